//! Transport sender: drains the outbound queue into every ready session

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{BenchError, Result};
use crate::queue::{QueueReceiver, TryDequeueError};
use crate::registry::SessionRegistry;

/// What to do when the queue is empty right before a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarvationPolicy {
    /// Producer fell behind: surface it as a fatal error
    Fatal,
    /// Suspend until the next message arrives
    Wait,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub messages: u64,
    pub deliveries: u64,
    pub session_drops: u64,
    pub session_failures: u64,
}

pub struct TransportSender {
    rx: QueueReceiver,
    registry: Arc<SessionRegistry>,
    throttle: Option<Duration>,
    policy: StarvationPolicy,
    prime_delay: Duration,
}

impl TransportSender {
    pub fn new(rx: QueueReceiver, registry: Arc<SessionRegistry>, policy: StarvationPolicy) -> Self {
        Self {
            rx,
            registry,
            throttle: None,
            policy,
            prime_delay: Duration::ZERO,
        }
    }

    /// Sleep this long after every write
    pub fn with_throttle(mut self, throttle: Option<Duration>) -> Self {
        self.throttle = throttle;
        self
    }

    /// Give producers a head start before the first dequeue
    pub fn with_prime_delay(mut self, delay: Duration) -> Self {
        self.prime_delay = delay;
        self
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<SenderStats> {
        let mut stats = SenderStats::default();

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(stats),
            _ = self.registry.wait_for_ready() => {}
        }
        info!(policy = ?self.policy, "Sender started, first session ready");

        if !self.prime_delay.is_zero() && !sleep_or_cancel(self.prime_delay, &shutdown).await {
            return Ok(stats);
        }

        loop {
            if self.registry.ready_count() == 0 {
                debug!("No ready sessions, sender idle");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.registry.wait_for_ready() => {}
                }

                // Anything queued while idle carries a stale send time
                let stale = self.rx.drain();
                if stale > 0 {
                    info!(stale, "Discarded messages queued while no session was ready");
                }
                if !self.prime_delay.is_zero() && !sleep_or_cancel(self.prime_delay, &shutdown).await {
                    break;
                }
            }

            let msg = match self.policy {
                StarvationPolicy::Fatal => match self.rx.try_dequeue() {
                    Ok(msg) => msg,
                    Err(TryDequeueError::Empty) => {
                        error!("Outbound queue empty before send");
                        return Err(BenchError::QueueStarved);
                    }
                    Err(TryDequeueError::Closed) => break,
                },
                StarvationPolicy::Wait => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = self.rx.dequeue() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                },
            };

            let report = self.registry.broadcast(&msg);
            stats.messages += 1;
            stats.deliveries += report.delivered as u64;
            stats.session_drops += report.dropped as u64;
            stats.session_failures += report.failed as u64;
            metrics::counter!("relay_bench_messages_sent_total").increment(report.delivered as u64);

            match self.throttle {
                Some(delay) => {
                    if !sleep_or_cancel(delay, &shutdown).await {
                        break;
                    }
                }
                None => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
        }

        info!(?stats, "Sender stopped");
        Ok(stats)
    }
}

/// False when shutdown fired first
async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
