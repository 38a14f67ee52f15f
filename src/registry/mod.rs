//! Session registry
//!
//! Owns every live peer session. One mutex guards the map and is held only
//! to mutate it or to take a snapshot; sends happen after the guard is
//! released, into each session's bounded outbox, so no network I/O ever
//! runs under the lock.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::types::{Message, SessionId};

/// Frame queued for a session's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Bytes),
    Text(String),
}

/// Why a send to one session did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Writer is behind; this message is dropped for this session only
    Full,
    /// Writer task has exited
    Closed,
}

/// Handshake metadata, kept for logging only
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub peer_addr: Option<SocketAddr>,
    pub uri: Option<String>,
    pub headers: Vec<(String, String)>,
}

/// Cheap, cloneable send handle for one session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn try_send(&self, frame: Outbound) -> Result<(), SendFailure> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving end of a session's outbox, owned by its writer task
pub struct SessionOutbox {
    rx: mpsc::Receiver<Outbound>,
}

impl SessionOutbox {
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }
}

struct Session {
    handle: SessionHandle,
    ready: bool,
    meta: RequestMeta,
}

/// Point-in-time view of a session, taken under the lock
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub handle: SessionHandle,
    pub ready: bool,
}

/// Result of sending one message to every ready session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub failed: usize,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Session>>,
    next_id: AtomicU64,
    ready_notify: Notify,
    outbox_capacity: usize,
}

impl SessionRegistry {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            ready_notify: Notify::new(),
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    /// Register a freshly connected peer
    pub fn add_session(&self, meta: RequestMeta) -> (SessionHandle, SessionOutbox) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        let handle = SessionHandle { id, tx };

        let active = {
            let mut sessions = self.sessions.lock();
            sessions.insert(
                id,
                Session {
                    handle: handle.clone(),
                    ready: false,
                    meta,
                },
            );
            sessions.len()
        };

        metrics::gauge!("relay_bench_sessions_active").set(active as f64);
        info!(%id, active, "Session added");
        (handle, SessionOutbox { rx })
    }

    pub fn remove_session(&self, id: SessionId) -> bool {
        let (removed, active) = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(&id).is_some();
            (removed, sessions.len())
        };

        if removed {
            metrics::gauge!("relay_bench_sessions_active").set(active as f64);
            info!(%id, active, "Session removed");
        }
        removed
    }

    /// Record the ready handshake; true only on the first call per session
    pub fn mark_ready(&self, id: SessionId) -> bool {
        let first = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&id) {
                Some(session) if !session.ready => {
                    session.ready = true;
                    true
                }
                _ => false,
            }
        };

        if first {
            self.ready_notify.notify_waiters();
        }
        first
    }

    pub fn session_meta(&self, id: SessionId) -> Option<RequestMeta> {
        self.sessions.lock().get(&id).map(|s| s.meta.clone())
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .lock()
            .values()
            .map(|s| SessionSnapshot {
                handle: s.handle.clone(),
                ready: s.ready,
            })
            .collect()
    }

    /// Visit every session; the lock is released before `f` runs
    pub fn for_each_session<F>(&self, mut f: F)
    where
        F: FnMut(&SessionSnapshot),
    {
        for session in self.snapshot() {
            f(&session);
        }
    }

    /// Send `msg` to every ready session, removing sessions whose writer is gone
    pub fn broadcast(&self, msg: &Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();

        self.for_each_session(|session| {
            if !session.ready {
                return;
            }
            let frame = Outbound::Binary(msg.clone().into_bytes());
            match session.handle.try_send(frame) {
                Ok(()) => report.delivered += 1,
                Err(SendFailure::Full) => {
                    report.dropped += 1;
                    debug!(id = %session.handle.id(), "Session outbox full, dropping message");
                }
                Err(SendFailure::Closed) => {
                    report.failed += 1;
                    closed.push(session.handle.id());
                }
            }
        });

        if report.dropped > 0 {
            metrics::counter!("relay_bench_session_drops_total").increment(report.dropped as u64);
        }
        if !closed.is_empty() {
            metrics::counter!("relay_bench_session_send_failures_total")
                .increment(closed.len() as u64);
            for id in closed {
                self.remove_session(id);
            }
        }
        report
    }

    /// Resolve once at least one session has sent the ready sentinel
    pub async fn wait_for_ready(&self) {
        loop {
            let notified = self.ready_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.ready_count() > 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ready_count(&self) -> usize {
        self.sessions.lock().values().filter(|s| s.ready).count()
    }
}
