//! Payload generator
//!
//! Deterministic pseudo-random payloads: the same seed and size bounds give
//! the same byte sequence on every run, so benchmark runs are reproducible
//! across restarts. The send time is stamped right before enqueue.

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{PipelineConfig, TIMESTAMP_BYTES};
use crate::error::Result;
use crate::queue::OutboundQueue;
use crate::registry::SessionRegistry;
use crate::timestamp::{ByteOrder, Clock};
use crate::types::PendingMessage;

/// Seeded source of unstamped messages
pub struct PayloadGenerator {
    rng: ChaCha8Rng,
    min_bytes: usize,
    max_bytes: usize,
}

impl PayloadGenerator {
    pub fn new(seed: u64, min_bytes: usize, max_bytes: usize) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            min_bytes,
            max_bytes,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.rand_seed, config.payload_min_bytes, config.payload_max_bytes)
    }

    /// Uniform in `[min, max)`; exactly `min` when the bounds coincide
    #[inline]
    pub fn next_len(&mut self) -> usize {
        if self.max_bytes > self.min_bytes {
            self.rng.gen_range(self.min_bytes..self.max_bytes)
        } else {
            self.min_bytes
        }
    }

    pub fn next_payload(&mut self) -> Result<PendingMessage> {
        let len = self.next_len();
        let mut buf = vec![0u8; TIMESTAMP_BYTES + len];
        self.rng.try_fill_bytes(&mut buf[TIMESTAMP_BYTES..])?;
        Ok(PendingMessage::from_buf(buf))
    }
}

/// Totals reported when a generator run ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub generated: u64,
    pub enqueued: u64,
    pub dropped: u64,
}

/// Generator task: paces, stamps and enqueues messages
pub struct Generator {
    payloads: PayloadGenerator,
    queue: OutboundQueue,
    clock: Arc<dyn Clock>,
    byte_order: ByteOrder,
    throttle: Option<Duration>,
    limit: Option<u64>,
    gate: Option<Arc<SessionRegistry>>,
}

impl Generator {
    pub fn new(config: &PipelineConfig, queue: OutboundQueue, clock: Arc<dyn Clock>) -> Self {
        Self {
            payloads: PayloadGenerator::from_config(config),
            queue,
            clock,
            byte_order: config.header_byte_order,
            throttle: config.throttle(),
            limit: None,
            gate: None,
        }
    }

    /// Stop after `limit` messages instead of running until shutdown
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    /// Only produce while `registry` has a ready session, so nothing is
    /// stamped while no one is listening
    pub fn with_ready_gate(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.gate = Some(registry);
        self
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<GeneratorStats> {
        info!(
            throttle_ms = self.throttle.map(|t| t.as_millis() as u64).unwrap_or(0),
            limit = ?self.limit,
            "Generator started"
        );

        let mut stats = GeneratorStats::default();

        while self.limit.map_or(true, |limit| stats.generated < limit) {
            if let Some(gate) = &self.gate {
                if gate.ready_count() == 0 {
                    debug!(generated = stats.generated, "No ready sessions, generator paused");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = gate.wait_for_ready() => {}
                    }
                }
            }

            match self.throttle {
                Some(delay) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }

            let pending = self.payloads.next_payload()?;
            let msg = pending.stamp(self.clock.now_nanos(), self.byte_order);
            stats.generated += 1;

            if self.queue.enqueue(msg) {
                stats.enqueued += 1;
            } else {
                stats.dropped += 1;
            }
        }

        debug!(?stats, "Generator stopped");
        Ok(stats)
    }
}
