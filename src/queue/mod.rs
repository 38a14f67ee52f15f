//! Bounded outbound queue
//!
//! Producers never wait: a full queue drops the message and bumps the drop
//! counter. The consumer side suspends until a message arrives. A live
//! latency benchmark has to keep producing fresh timestamps, so overload
//! turns into data loss rather than a growing backlog of stale messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, warn};

use crate::types::Message;

/// Counters shared by every handle of one queue
#[derive(Debug, Default)]
pub struct QueueStats {
    pub enqueued: AtomicU64,
    pub dropped: AtomicU64,
}

/// Producer handle; clone one per producer task
#[derive(Clone)]
pub struct OutboundQueue {
    name: &'static str,
    capacity: usize,
    tx: mpsc::Sender<Message>,
    stats: Arc<QueueStats>,
}

/// The single consumer of an [`OutboundQueue`]
pub struct QueueReceiver {
    rx: mpsc::Receiver<Message>,
    stats: Arc<QueueStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryDequeueError {
    Empty,
    /// Every producer handle is gone and the queue is drained
    Closed,
}

/// Create a queue holding at most `capacity` messages
pub fn outbound_queue(name: &'static str, capacity: usize) -> (OutboundQueue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let stats = Arc::new(QueueStats::default());
    (
        OutboundQueue {
            name,
            capacity,
            tx,
            stats: stats.clone(),
        },
        QueueReceiver { rx, stats },
    )
}

impl OutboundQueue {
    /// Non-blocking insert. Returns false and discards `msg` when full.
    pub fn enqueue(&self, msg: Message) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("relay_bench_messages_enqueued_total", "queue" => self.name)
                    .increment(1);
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("relay_bench_messages_dropped_total", "queue" => self.name)
                    .increment(1);
                if dropped % 1000 == 1 {
                    warn!(queue = self.name, dropped, "{} chan full, dropping message", self.name);
                } else {
                    debug!(queue = self.name, dropped, "{} chan full", self.name);
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(queue = self.name, "consumer gone, discarding message");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn enqueued(&self) -> u64 {
        self.stats.enqueued.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }
}

impl QueueReceiver {
    /// Wait for the next message; `None` once all producers are dropped
    pub async fn dequeue(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_dequeue(&mut self) -> Result<Message, TryDequeueError> {
        self.rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => TryDequeueError::Empty,
            TryRecvError::Disconnected => TryDequeueError::Closed,
        })
    }

    /// Discard everything currently queued; returns how many were removed
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }
}
