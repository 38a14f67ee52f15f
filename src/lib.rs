//! Relay Bench
//!
//! End-to-end latency benchmark for a chain of WebSocket relays.
//!
//! ## Architecture
//! - Generator: seeded random payloads, stamped with the send time on enqueue
//! - Queue: bounded drop-on-full buffer between each producer and its sender
//! - Sender: broadcasts queued messages to every ready session
//! - Relay: forwards an upstream feed to its own downstream sessions
//! - Sampler: decodes the send time on arrival and keeps running statistics

pub mod bench;
pub mod config;
pub mod error;
pub mod generator;
pub mod node;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod sampler;
pub mod sender;
pub mod timestamp;
pub mod transport;
pub mod types;

pub use bench::run_all_benchmarks;
pub use config::BenchConfig;
pub use error::{BenchError, Result};
pub use node::{run_receiver, run_relay, run_sender, start_receiver, start_relay, start_sender};
pub use sampler::{LatencySampler, StatsSnapshot};
pub use timestamp::{ByteOrder, Clock, SystemClock};
pub use transport::WsConnector;
pub use types::Message;
