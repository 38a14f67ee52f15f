//! WebSocket transport adapter
//!
//! Server side: accept loop, handshake metadata capture, one reader and one
//! writer task per session. Client side: [`WsConnector`] opens a connection,
//! sends the ready sentinel and exposes incoming binary frames as a stream.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async, connect_async_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::{Outbound, RequestMeta, SessionRegistry};
use crate::relay::{Connector, UpstreamStream};
use crate::types::{SessionId, READY_SENTINEL};

/// Application callbacks for server-side sessions
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_connect(&self, _id: SessionId, _meta: &RequestMeta) {}

    /// First ready sentinel received from this session
    async fn on_ready(&self, id: SessionId);

    async fn on_close(&self, _id: SessionId) {}
}

/// Listening WebSocket endpoint feeding a [`SessionRegistry`]
pub struct WsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    path: String,
    registry: Arc<SessionRegistry>,
}

impl WsServer {
    pub async fn bind(
        addr: SocketAddr,
        path: impl Into<String>,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            path: path.into(),
            registry,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn serve(self, handler: Arc<dyn SessionHandler>, shutdown: CancellationToken) {
        info!(addr = %self.local_addr, path = %self.path, "Listening for WebSocket sessions");
        let path: Arc<str> = Arc::from(self.path.as_str());

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            let registry = self.registry.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            let path = path.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, &path, registry, handler, shutdown).await {
                    debug!(%peer, "Connection ended with error: {}", e);
                }
            });
        }

        info!(addr = %self.local_addr, "Listener stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    path: &str,
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn SessionHandler>,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true).ok();

    let mut meta = RequestMeta {
        peer_addr: Some(peer),
        ..Default::default()
    };
    let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
        meta.uri = Some(req.uri().to_string());
        meta.headers = req
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();

        if req.uri().path() != path {
            let mut err = ErrorResponse::new(Some(format!("no route for {}", req.uri().path())));
            *err.status_mut() = StatusCode::NOT_FOUND;
            return Err(err);
        }
        Ok(resp)
    })
    .await?;

    let (handle, mut outbox) = registry.add_session(meta.clone());
    let id = handle.id();
    debug!(%id, ?meta, "Handshake complete");
    handler.on_connect(id, &meta).await;

    let (mut sink, mut frames) = ws.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            let msg = match frame {
                Outbound::Binary(data) => WsMessage::Binary(Vec::from(data)),
                Outbound::Text(text) => WsMessage::Text(text),
            };
            if let Err(e) = sink.send(msg).await {
                warn!(%id, "Write failed, closing session: {}", e);
                return;
            }
        }
        sink.close().await.ok();
    });

    let mut writer_done = false;
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(msg)) if is_ready_sentinel(&msg) => {
                if registry.mark_ready(id) {
                    info!(%id, "Client sent ready");
                    handler.on_ready(id).await;
                }
            }
            Some(Ok(WsMessage::Text(text))) => debug!(%id, %text, "Ignoring text message"),
            Some(Ok(WsMessage::Binary(data))) => {
                debug!(%id, len = data.len(), "Ignoring binary message from downstream")
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(%id, "Read failed: {}", e);
                break;
            }
        }
    }

    registry.remove_session(id);
    if !writer_done {
        writer.abort();
    }
    handler.on_close(id).await;
    Ok(())
}

/// Clients send the sentinel either as a text or as a binary frame
fn is_ready_sentinel(msg: &WsMessage) -> bool {
    match msg {
        WsMessage::Text(text) => text == READY_SENTINEL,
        WsMessage::Binary(data) => data.as_slice() == READY_SENTINEL.as_bytes(),
        _ => false,
    }
}

/// WebSocket client that announces itself with the ready sentinel
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<UpstreamStream> {
        let (mut ws, _) = connect_async_with_config(url, None, true).await?;
        ws.send(WsMessage::Text(READY_SENTINEL.to_string())).await?;
        info!(%url, "Connected, sent ready");

        let frames = ws.filter_map(|frame| {
            future::ready(match frame {
                Ok(WsMessage::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            })
        });
        Ok(frames.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct ReadyProbe {
        tx: mpsc::UnboundedSender<SessionId>,
    }

    #[async_trait]
    impl SessionHandler for ReadyProbe {
        async fn on_ready(&self, id: SessionId) {
            self.tx.send(id).ok();
        }
    }

    async fn start_server(path: &str) -> (SocketAddr, Arc<SessionRegistry>, mpsc::UnboundedReceiver<SessionId>, CancellationToken) {
        let registry = Arc::new(SessionRegistry::new(64));
        let server = WsServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), path, registry.clone())
            .await
            .unwrap();
        let addr = server.local_addr();
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(Arc::new(ReadyProbe { tx }), shutdown.clone()));
        (addr, registry, rx, shutdown)
    }

    #[tokio::test]
    async fn test_ready_handshake_and_broadcast() {
        let (addr, registry, mut ready_rx, shutdown) = start_server("/sender").await;

        let mut frames = WsConnector
            .connect(&format!("ws://{}/sender", addr))
            .await
            .unwrap();

        let id = tokio::time::timeout(Duration::from_secs(2), ready_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let meta = registry.session_meta(id).unwrap();
        assert_eq!(meta.uri.as_deref(), Some("/sender"));
        assert!(meta.headers.iter().any(|(k, _)| k == "sec-websocket-key"));

        let msg = Message::from_wire(vec![5u8; 32]);
        assert_eq!(registry.broadcast(&msg).delivered, 1);
        let got = tokio::time::timeout(Duration::from_secs(2), frames.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], msg.as_bytes());

        // Client going away removes the session
        drop(frames);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_binary_ready_sentinel_accepted() {
        let (addr, registry, mut ready_rx, shutdown) = start_server("/sender").await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/sender", addr))
            .await
            .unwrap();
        ws.send(WsMessage::Binary(READY_SENTINEL.as_bytes().to_vec()))
            .await
            .unwrap();

        let id = tokio::time::timeout(Duration::from_secs(2), ready_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.ready_count(), 1);

        let msg = Message::from_wire(vec![8u8; 16]);
        assert_eq!(registry.broadcast(&msg).delivered, 1);
        let got = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, WsMessage::Binary(msg.as_bytes().to_vec()));
        assert!(registry.session_meta(id).is_some());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_path_rejected() {
        let (addr, registry, _ready_rx, shutdown) = start_server("/relay").await;
        let result = WsConnector.connect(&format!("ws://{}/elsewhere", addr)).await;
        assert!(result.is_err());
        assert!(registry.is_empty());
        shutdown.cancel();
    }
}
