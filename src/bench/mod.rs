//! Benchmark module
//! Precision latency measurements for the in-process hot path

pub mod latency;

pub use latency::{run_all_benchmarks, run_bench, BenchResult};
