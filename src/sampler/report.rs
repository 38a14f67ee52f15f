//! Periodic latency report

use chrono::{DateTime, Local, TimeZone};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::StatsSnapshot;

/// Render one report line
pub fn format_report<Tz>(now: &DateTime<Tz>, snapshot: &StatsSnapshot) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let ts = now.format("%Y-%m-%d %H:%M:%S");

    if snapshot.warming_up() {
        return format!(
            "{}: Ignoring initial messages, count={}/{}",
            ts, snapshot.received, snapshot.ignore_initial
        );
    }

    let stats = &snapshot.stats;
    match stats.average() {
        Some(avg) => format!(
            "{}: SampleLatency: {:?} | Min: {:?} | Max: {:?} | Avg: {:?} | Count: {} | Corrupted: {}",
            ts,
            Duration::from_nanos(stats.last),
            Duration::from_nanos(stats.min),
            Duration::from_nanos(stats.max),
            Duration::from_nanos(avg),
            stats.count,
            snapshot.corrupted,
        ),
        None => format!(
            "{}: No latency samples yet, received={}",
            ts, snapshot.received
        ),
    }
}

/// Reads the sampler's snapshots on a fixed interval and logs a report line
pub struct Reporter {
    rx: watch::Receiver<StatsSnapshot>,
    interval: Duration,
}

impl Reporter {
    pub fn new(rx: watch::Receiver<StatsSnapshot>, interval: Duration) -> Self {
        Self { rx, interval }
    }

    /// Returns the number of report lines emitted
    pub async fn run(self, shutdown: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        let mut reports = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = *self.rx.borrow();
                    info!("{}", format_report(&Local::now(), &snapshot));
                    reports += 1;
                }
            }
        }
        reports
    }
}
