//! Relay forwarder
//!
//! A downstream "ready" opens (or reuses) one upstream connection. Every
//! binary frame read from upstream goes into the downstream outbound queue
//! untouched; the relay never decodes the timestamp header. An upstream
//! read error closes the link for good until the next downstream ready.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::queue::OutboundQueue;
use crate::registry::SessionRegistry;
use crate::types::Message;

/// Binary frames from an upstream producer
pub type UpstreamStream = BoxStream<'static, Result<Bytes>>;

/// Opens upstream connections; the connection has already been sent the
/// ready sentinel when `connect` returns
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<UpstreamStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No downstream peer yet
    Idle,
    /// Downstream connected, waiting for its ready sentinel
    AwaitingReady,
    /// Upstream link is up
    Connected,
    /// At least one upstream frame has been forwarded
    Forwarding,
    /// Upstream link ended; only a new downstream ready reopens it
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub forwarded: u64,
    pub dropped: u64,
    /// Frames discarded because no downstream session was ready
    pub skipped: u64,
}

pub struct RelayForwarder {
    upstream_url: String,
    connector: Arc<dyn Connector>,
    queue: OutboundQueue,
    state: Arc<watch::Sender<RelayState>>,
    link: Mutex<Option<JoinHandle<ForwardStats>>>,
    gate: Option<Arc<SessionRegistry>>,
    shutdown: CancellationToken,
}

impl RelayForwarder {
    pub fn new(
        upstream_url: impl Into<String>,
        connector: Arc<dyn Connector>,
        queue: OutboundQueue,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(RelayState::Idle);
        Self {
            upstream_url: upstream_url.into(),
            connector,
            queue,
            state: Arc::new(state),
            link: Mutex::new(None),
            gate: None,
            shutdown,
        }
    }

    /// Discard upstream frames while `registry` has no ready session
    pub fn with_ready_gate(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.gate = Some(registry);
        self
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    pub fn on_downstream_connect(&self) {
        self.state.send_if_modified(|state| {
            if *state == RelayState::Idle {
                *state = RelayState::AwaitingReady;
                true
            } else {
                false
            }
        });
    }

    /// Last downstream peer left before any upstream link was opened
    pub fn on_downstream_idle(&self) {
        self.state.send_if_modified(|state| {
            if *state == RelayState::AwaitingReady {
                *state = RelayState::Idle;
                true
            } else {
                false
            }
        });
    }

    /// Open the upstream link unless one is already forwarding.
    /// Returns true when a new link was started.
    pub async fn on_downstream_ready(&self) -> Result<bool> {
        let mut link = self.link.lock().await;
        if let Some(task) = link.as_ref() {
            if !task.is_finished() {
                debug!("Upstream link already open, reusing");
                return Ok(false);
            }
        }

        info!(url = %self.upstream_url, "Connecting upstream");
        let stream = match self.connector.connect(&self.upstream_url).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(url = %self.upstream_url, "Upstream connect failed: {}", e);
                self.state.send_replace(RelayState::Closed);
                return Err(e);
            }
        };
        self.state.send_replace(RelayState::Connected);

        let queue = self.queue.clone();
        let state = self.state.clone();
        let gate = self.gate.clone();
        let shutdown = self.shutdown.clone();
        *link = Some(tokio::spawn(async move {
            forward_stream(stream, &queue, &state, gate.as_deref(), &shutdown).await
        }));
        Ok(true)
    }

    /// Wait for the current upstream link to end
    pub async fn join(&self) -> Option<ForwardStats> {
        let task = self.link.lock().await.take()?;
        task.await.ok()
    }
}

/// Forward every upstream frame into `queue` until the stream ends, errors,
/// or shutdown fires. With a `gate`, frames arriving while it has no ready
/// session are discarded instead of queued.
pub async fn forward_stream(
    mut stream: UpstreamStream,
    queue: &OutboundQueue,
    state: &watch::Sender<RelayState>,
    gate: Option<&SessionRegistry>,
    shutdown: &CancellationToken,
) -> ForwardStats {
    let mut stats = ForwardStats::default();

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(bytes)) => {
                if gate.is_some_and(|registry| registry.ready_count() == 0) {
                    stats.skipped += 1;
                    if stats.skipped % 1000 == 1 {
                        debug!(skipped = stats.skipped, "No ready downstream session, discarding frame");
                    }
                    continue;
                }
                if stats.forwarded + stats.dropped == 0 {
                    state.send_replace(RelayState::Forwarding);
                }
                if queue.enqueue(Message::from_wire(bytes)) {
                    stats.forwarded += 1;
                } else {
                    stats.dropped += 1;
                }
            }
            Some(Err(e)) => {
                warn!("Upstream read failed: {}", e);
                break;
            }
            None => {
                info!("Upstream stream ended");
                break;
            }
        }
    }

    state.send_replace(RelayState::Closed);
    info!(
        forwarded = stats.forwarded,
        dropped = stats.dropped,
        skipped = stats.skipped,
        "Upstream link closed"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BenchError;
    use crate::queue::outbound_queue;
    use crate::registry::{Outbound, RequestMeta};
    use crate::sender::{StarvationPolicy, TransportSender};
    use futures::channel::mpsc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Hands out pre-created channel streams, one per connect
    struct ChannelConnector {
        streams: parking_lot::Mutex<Vec<mpsc::UnboundedReceiver<Result<Bytes>>>>,
        connects: AtomicUsize,
    }

    impl ChannelConnector {
        fn new(count: usize) -> (Arc<Self>, Vec<mpsc::UnboundedSender<Result<Bytes>>>) {
            let (senders, receivers): (Vec<_>, Vec<_>) =
                (0..count).map(|_| mpsc::unbounded()).unzip();
            let mut receivers = receivers;
            receivers.reverse();
            let connector = Arc::new(Self {
                streams: parking_lot::Mutex::new(receivers),
                connects: AtomicUsize::new(0),
            });
            (connector, senders)
        }
    }

    #[async_trait]
    impl Connector for ChannelConnector {
        async fn connect(&self, url: &str) -> Result<UpstreamStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.streams.lock().pop() {
                Some(rx) => Ok(rx.boxed()),
                None => Err(BenchError::UpstreamClosed(format!("no upstream at {}", url))),
            }
        }
    }

    async fn wait_state(rx: &mut watch::Receiver<RelayState>, want: RelayState) {
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == want))
            .await
            .expect("state transition timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn test_state_machine_and_opaque_forwarding() {
        let (connector, upstreams) = ChannelConnector::new(2);
        let (queue, mut rx) = outbound_queue("relay-test", 16);
        let relay = RelayForwarder::new("ws://up", connector.clone(), queue, CancellationToken::new());
        let mut states = relay.subscribe();

        assert_eq!(relay.state(), RelayState::Idle);
        relay.on_downstream_connect();
        assert_eq!(relay.state(), RelayState::AwaitingReady);

        assert!(relay.on_downstream_ready().await.unwrap());
        assert_eq!(relay.state(), RelayState::Connected);

        // Header bytes that do not decode to any sensible time pass through as-is
        let frame = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 1, 2]);
        upstreams[0].unbounded_send(Ok(frame.clone())).unwrap();
        wait_state(&mut states, RelayState::Forwarding).await;
        assert_eq!(rx.dequeue().await.unwrap().as_bytes(), &frame[..]);

        // Second ready reuses the live link
        assert!(!relay.on_downstream_ready().await.unwrap());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        upstreams[0]
            .unbounded_send(Err(BenchError::UpstreamClosed("reset".into())))
            .unwrap();
        wait_state(&mut states, RelayState::Closed).await;
        assert_eq!(relay.join().await, Some(ForwardStats { forwarded: 1, dropped: 0, skipped: 0 }));

        // No automatic reconnect; a fresh ready opens a new link
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(relay.on_downstream_ready().await.unwrap());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        drop(upstreams);
    }

    #[tokio::test]
    async fn test_connect_failure_closes() {
        let (connector, _upstreams) = ChannelConnector::new(0);
        let (queue, _rx) = outbound_queue("relay-test", 4);
        let relay = RelayForwarder::new("ws://down", connector, queue, CancellationToken::new());
        relay.on_downstream_connect();
        assert!(relay.on_downstream_ready().await.is_err());
        assert_eq!(relay.state(), RelayState::Closed);
    }

    #[tokio::test]
    async fn test_preserves_order_and_drops_on_full_queue() {
        let (queue, mut rx) = outbound_queue("relay-test", 3);
        let (state, _) = watch::channel(RelayState::Connected);
        let frames: Vec<Result<Bytes>> = (0..5u8).map(|n| Ok(Bytes::from(vec![n; 10]))).collect();

        let stats = forward_stream(
            futures::stream::iter(frames).boxed(),
            &queue,
            &state,
            None,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(stats, ForwardStats { forwarded: 3, dropped: 2, skipped: 0 });
        assert_eq!(*state.borrow(), RelayState::Closed);
        for n in 0..3u8 {
            assert_eq!(rx.try_dequeue().unwrap().as_bytes(), &vec![n; 10][..]);
        }
    }

    #[tokio::test]
    async fn test_relayed_message_fans_out_to_two_sessions() {
        let (connector, upstreams) = ChannelConnector::new(1);
        let (queue, rx) = outbound_queue("relay-test", 16);
        let registry = Arc::new(SessionRegistry::new(16));
        let (a, mut outbox_a) = registry.add_session(RequestMeta::default());
        let (b, mut outbox_b) = registry.add_session(RequestMeta::default());
        registry.mark_ready(a.id());
        registry.mark_ready(b.id());

        let shutdown = CancellationToken::new();
        let relay = RelayForwarder::new("ws://up", connector, queue, shutdown.clone());
        let sender = tokio::spawn(
            TransportSender::new(rx, registry.clone(), StarvationPolicy::Wait).run(shutdown.clone()),
        );

        relay.on_downstream_ready().await.unwrap();
        let frame = Bytes::from(vec![9u8; 20]);
        upstreams[0].unbounded_send(Ok(frame.clone())).unwrap();

        let got_a = tokio::time::timeout(Duration::from_secs(1), outbox_a.recv()).await.unwrap();
        let got_b = tokio::time::timeout(Duration::from_secs(1), outbox_b.recv()).await.unwrap();
        assert_eq!(got_a, Some(Outbound::Binary(frame.clone())));
        assert_eq!(got_b, Some(Outbound::Binary(frame)));

        shutdown.cancel();
        let stats = sender.await.unwrap().unwrap();
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.deliveries, 2);
        assert!(outbox_a.try_recv().is_none());
        assert!(outbox_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_gate_discards_frames_without_ready_session() {
        let (queue, mut rx) = outbound_queue("relay-test", 16);
        let (state, _) = watch::channel(RelayState::Connected);
        let registry = Arc::new(SessionRegistry::new(4));
        let (upstream, frames) = mpsc::unbounded();
        upstream.unbounded_send(Ok(Bytes::from_static(b"stale-one"))).unwrap();
        upstream.unbounded_send(Ok(Bytes::from_static(b"stale-two"))).unwrap();

        let forward = tokio::spawn({
            let queue = queue.clone();
            let registry = registry.clone();
            async move {
                forward_stream(
                    frames.boxed(),
                    &queue,
                    &state,
                    Some(registry.as_ref()),
                    &CancellationToken::new(),
                )
                .await
            }
        });

        // Nobody is ready while the first two frames are read
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (handle, _outbox) = registry.add_session(RequestMeta::default());
        registry.mark_ready(handle.id());
        upstream.unbounded_send(Ok(Bytes::from_static(b"fresh-frame"))).unwrap();
        drop(upstream);

        let stats = forward.await.unwrap();
        assert_eq!(stats, ForwardStats { forwarded: 1, dropped: 0, skipped: 2 });
        assert_eq!(rx.try_dequeue().unwrap().as_bytes(), b"fresh-frame");
        assert!(rx.try_dequeue().is_err());
    }
}
