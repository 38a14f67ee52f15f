//! Latency sampler for the terminal hop
//!
//! Single writer: only [`LatencySampler`] mutates the statistics. Each
//! update is published as a [`StatsSnapshot`] on a watch channel which the
//! [`Reporter`] reads on its own interval.
//!
//! Overflow guard: a send time later than the receive time, or a delta above
//! the threshold, counts as corrupted. The previous accepted latency is
//! recorded in its place; before any sample has been accepted there is
//! nothing to substitute, so the message is discarded rather than recorded
//! as zero.

mod report;

pub use report::{format_report, Reporter};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{PipelineConfig, SamplerConfig};
use crate::timestamp::ByteOrder;
use crate::types::{Message, ReceivedMessage};

/// Rolling latency statistics in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningStats {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub sum: u128,
    pub last: u64,
}

impl RunningStats {
    #[inline]
    pub fn record(&mut self, latency: u64) {
        if self.count == 0 || latency < self.min {
            self.min = latency;
        }
        if latency > self.max {
            self.max = latency;
        }
        self.sum += latency as u128;
        self.last = latency;
        self.count += 1;
    }

    pub fn average(&self) -> Option<u64> {
        (self.count > 0).then(|| (self.sum / self.count as u128) as u64)
    }
}

/// Everything the reporter needs, copied out after each update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Well-formed messages seen, warm-up included
    pub received: u64,
    pub ignore_initial: u64,
    pub stats: RunningStats,
    /// Overflow guard hits
    pub corrupted: u64,
    /// Messages shorter than the timestamp header
    pub malformed: u64,
}

impl StatsSnapshot {
    pub fn warming_up(&self) -> bool {
        self.received < self.ignore_initial
    }
}

/// What happened to one observed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    WarmUp,
    Recorded(u64),
    /// Implausible latency replaced by the previous accepted value
    Substituted(u64),
    /// Implausible latency with no previous value to fall back on
    Discarded,
    Malformed,
}

pub struct LatencySampler {
    byte_order: ByteOrder,
    overflow_threshold: u64,
    snapshot: StatsSnapshot,
    publisher: watch::Sender<StatsSnapshot>,
}

impl LatencySampler {
    pub fn new(
        byte_order: ByteOrder,
        ignore_initial: u64,
        overflow_threshold: u64,
    ) -> (Self, watch::Receiver<StatsSnapshot>) {
        let snapshot = StatsSnapshot {
            ignore_initial,
            ..Default::default()
        };
        let (publisher, rx) = watch::channel(snapshot);
        (
            Self {
                byte_order,
                overflow_threshold,
                snapshot,
                publisher,
            },
            rx,
        )
    }

    pub fn from_config(
        pipeline: &PipelineConfig,
        sampler: &SamplerConfig,
    ) -> (Self, watch::Receiver<StatsSnapshot>) {
        Self::new(
            pipeline.header_byte_order,
            sampler.ignore_initial_message_count,
            sampler.overflow_threshold_nanos,
        )
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot
    }

    pub fn observe(&mut self, msg: &Message, recv_ns: u64) -> Observation {
        let observation = self.apply(msg, recv_ns);
        self.publisher.send_replace(self.snapshot);
        observation
    }

    fn apply(&mut self, msg: &Message, recv_ns: u64) -> Observation {
        let Some(send_ns) = msg.send_timestamp(self.byte_order) else {
            self.snapshot.malformed += 1;
            return Observation::Malformed;
        };

        self.snapshot.received += 1;
        if self.snapshot.received < self.snapshot.ignore_initial {
            return Observation::WarmUp;
        }

        // A send time after the receive time is as implausible as a huge delta
        let latency = recv_ns
            .checked_sub(send_ns)
            .filter(|latency| *latency <= self.overflow_threshold);
        let stats = &mut self.snapshot.stats;

        let Some(latency) = latency else {
            self.snapshot.corrupted += 1;
            metrics::counter!("relay_bench_latency_corrupted_total").increment(1);
            if stats.count == 0 {
                debug!(send_ns, recv_ns, "Implausible latency with no prior sample, discarding");
                return Observation::Discarded;
            }
            let last = stats.last;
            stats.record(last);
            return Observation::Substituted(last);
        };

        stats.record(latency);
        metrics::histogram!("relay_bench_latency_ns").record(latency as f64);
        Observation::Recorded(latency)
    }

    /// Consume received messages until the channel closes or shutdown fires
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<ReceivedMessage>,
        shutdown: CancellationToken,
    ) -> StatsSnapshot {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Some(received) => {
                        self.observe(&received.message, received.recv_ns);
                    }
                    None => break,
                },
            }
        }

        info!(snapshot = ?self.snapshot, "Sampler stopped");
        self.snapshot
    }
}
