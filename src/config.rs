//! Configuration module

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{BenchError, Result};
use crate::timestamp::ByteOrder;

/// Width of the send-timestamp header in bytes
pub const TIMESTAMP_BYTES: usize = 8;

/// One hour in nanoseconds
pub const DEFAULT_OVERFLOW_THRESHOLD_NANOS: u64 = 3_600_000_000_000;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Payload, queue and pacing settings shared by every role
    pub pipeline: PipelineConfig,

    /// Terminal-hop statistics
    pub sampler: SamplerConfig,

    /// Generator process
    pub sender: SenderConfig,

    /// Relay process
    pub relay: RelayConfig,

    /// Receiver process
    pub receiver: ReceiverConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Metrics exporter
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub message_chan_size: usize,
    pub sender_throttle_millis: u64,
    pub payload_min_bytes: usize,
    pub payload_max_bytes: usize,
    pub timestamp_bytes: usize,
    pub rand_seed: u64,
    pub header_byte_order: ByteOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub ignore_initial_message_count: u64,
    pub overflow_threshold_nanos: u64,
    pub report_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub listen_addr: SocketAddr,
    pub path: String,
    /// Abort when the queue is empty right before a send
    pub fatal_on_starvation: bool,
    /// Delay before the first dequeue so the generator can fill the queue
    pub prime_delay_ms: u64,
    /// Stop after this many generated messages (unbounded when unset)
    pub message_limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub path: String,
    pub upstream_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub target_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json_output: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape endpoint, disabled when unset
    pub listen_addr: Option<SocketAddr>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            message_chan_size: 2048,
            sender_throttle_millis: 20,
            payload_min_bytes: 2,
            payload_max_bytes: 4096,
            timestamp_bytes: TIMESTAMP_BYTES,
            rand_seed: 42,
            header_byte_order: ByteOrder::LittleEndian,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            ignore_initial_message_count: 100,
            overflow_threshold_nanos: DEFAULT_OVERFLOW_THRESHOLD_NANOS,
            report_interval_ms: 1000,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            path: "/sender".to_string(),
            fatal_on_starvation: true,
            prime_delay_ms: 100,
            message_limit: None,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            path: "/relay".to_string(),
            upstream_url: "ws://127.0.0.1:8080/sender".to_string(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            target_url: "ws://127.0.0.1:8081/relay".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_output: false,
        }
    }
}

impl PipelineConfig {
    pub fn throttle(&self) -> Option<Duration> {
        (self.sender_throttle_millis > 0).then(|| Duration::from_millis(self.sender_throttle_millis))
    }
}

impl SamplerConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

impl BenchConfig {
    /// Load config from environment
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        // Try to load from file first
        let config_path = std::env::var("RELAY_BENCH_CONFIG")
            .unwrap_or_else(|_| "config/relay-bench.json".to_string());

        if std::path::Path::new(&config_path).exists() {
            Self::load(&config_path)
        } else {
            Ok(BenchConfig::default())
        }
    }

    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BenchConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check startup invariants; a violation aborts before any task is spawned
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.payload_max_bytes < p.payload_min_bytes {
            return Err(BenchError::Config(
                "payload_max_bytes must be greater or equal to payload_min_bytes".into(),
            ));
        }
        if p.payload_min_bytes == 0 {
            return Err(BenchError::Config("payload_min_bytes must be at least 1".into()));
        }
        if p.message_chan_size == 0 {
            return Err(BenchError::Config("message_chan_size must be at least 1".into()));
        }
        if p.timestamp_bytes != TIMESTAMP_BYTES {
            return Err(BenchError::Config(format!(
                "timestamp_bytes must be {}, got {}",
                TIMESTAMP_BYTES, p.timestamp_bytes
            )));
        }
        if self.sampler.report_interval_ms == 0 {
            return Err(BenchError::Config("report_interval_ms must be at least 1".into()));
        }
        if self.sampler.overflow_threshold_nanos == 0 {
            return Err(BenchError::Config("overflow_threshold_nanos must be at least 1".into()));
        }
        Ok(())
    }
}
