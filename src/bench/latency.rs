//! Precision micro-benchmarks for the per-message hot path
//! Every stage a message touches between generation and sampling

use std::hint::black_box;
use std::time::Instant;

use crate::generator::PayloadGenerator;
use crate::queue::outbound_queue;
use crate::registry::{RequestMeta, SessionRegistry};
use crate::sampler::LatencySampler;
use crate::timestamp::{decode_header, encode_header, ByteOrder, Clock, SystemClock};
use crate::types::Message;

/// Benchmark result
#[derive(Debug, Clone)]
pub struct BenchResult {
    pub name: String,
    pub iterations: u64,
    pub total_ns: u64,
    pub avg_ns: f64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub p50_ns: u64,
    pub p99_ns: u64,
    pub throughput_ops: f64,
}

impl std::fmt::Display for BenchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<30} | avg: {:>8.2}ns | min: {:>6}ns | p50: {:>6}ns | p99: {:>6}ns | throughput: {:>12.0} ops/s",
            self.name, self.avg_ns, self.min_ns, self.p50_ns, self.p99_ns, self.throughput_ops
        )
    }
}

/// Run a benchmark with high precision
pub fn run_bench<F>(name: &str, iterations: u64, mut f: F) -> BenchResult
where
    F: FnMut(),
{
    // Warmup
    for _ in 0..1000 {
        black_box(f());
    }

    let mut samples = Vec::with_capacity(iterations as usize);
    for _ in 0..iterations {
        let start = Instant::now();
        black_box(f());
        samples.push(start.elapsed().as_nanos() as u64);
    }

    samples.sort_unstable();

    let total: u64 = samples.iter().sum();
    let avg = total as f64 / iterations.max(1) as f64;
    let min = *samples.first().unwrap_or(&0);
    let max = *samples.last().unwrap_or(&0);
    let p50 = samples.get(samples.len() / 2).copied().unwrap_or(0);
    let p99 = samples.get(samples.len() * 99 / 100).copied().unwrap_or(0);
    let throughput = if avg > 0.0 { 1_000_000_000.0 / avg } else { 0.0 };

    BenchResult {
        name: name.to_string(),
        iterations,
        total_ns: total,
        avg_ns: avg,
        min_ns: min,
        max_ns: max,
        p50_ns: p50,
        p99_ns: p99,
        throughput_ops: throughput,
    }
}

pub fn bench_header_encode() -> BenchResult {
    let ts = 1_700_000_000_123_456_789u64;
    run_bench("Header encode (8 bytes)", 100_000, || {
        black_box(encode_header(black_box(ts), ByteOrder::LittleEndian));
    })
}

pub fn bench_header_decode() -> BenchResult {
    let header = encode_header(1_700_000_000_123_456_789, ByteOrder::LittleEndian);
    run_bench("Header decode (8 bytes)", 100_000, || {
        black_box(decode_header(black_box(&header), ByteOrder::LittleEndian));
    })
}

pub fn bench_clock_read() -> BenchResult {
    let clock = SystemClock::new();
    run_bench("SystemClock read", 100_000, || {
        black_box(clock.now_nanos());
    })
}

/// Fill and stamp one payload of random length
pub fn bench_payload_generation() -> BenchResult {
    let mut generator = PayloadGenerator::new(42, 2, 4096);
    let clock = SystemClock::new();
    run_bench("Payload generate+stamp", 50_000, || {
        if let Ok(pending) = generator.next_payload() {
            black_box(pending.stamp(clock.now_nanos(), ByteOrder::LittleEndian));
        }
    })
}

pub fn bench_queue_roundtrip() -> BenchResult {
    let (queue, mut rx) = outbound_queue("bench", 1024);
    let msg = Message::from_wire(vec![0u8; 256]);
    run_bench("Outbound queue enqueue+dequeue", 100_000, || {
        queue.enqueue(msg.clone());
        black_box(rx.try_dequeue().ok());
    })
}

/// Crossbeam baseline for the queue above
pub fn bench_channel() -> BenchResult {
    use crossbeam_channel::bounded;

    let (tx, rx) = bounded::<Message>(1024);
    let msg = Message::from_wire(vec![0u8; 256]);
    run_bench("Crossbeam channel send+recv", 100_000, || {
        tx.send(msg.clone()).ok();
        black_box(rx.recv().ok());
    })
}

/// Fan-out to four sessions with their outboxes drained each iteration
pub fn bench_broadcast() -> BenchResult {
    let registry = SessionRegistry::new(1024);
    let mut outboxes: Vec<_> = (0..4)
        .map(|_| {
            let (handle, outbox) = registry.add_session(RequestMeta::default());
            registry.mark_ready(handle.id());
            outbox
        })
        .collect();
    let msg = Message::from_wire(vec![0u8; 256]);

    run_bench("Broadcast to 4 sessions", 50_000, || {
        black_box(registry.broadcast(&msg));
        for outbox in outboxes.iter_mut() {
            black_box(outbox.try_recv());
        }
    })
}

pub fn bench_sampler_observe() -> BenchResult {
    let (mut sampler, _rx) = LatencySampler::new(ByteOrder::LittleEndian, 0, u64::MAX);
    let clock = SystemClock::new();
    let mut buf = encode_header(clock.now_nanos(), ByteOrder::LittleEndian).to_vec();
    buf.extend_from_slice(&[0u8; 248]);
    let msg = Message::from_wire(buf);

    run_bench("Sampler observe", 100_000, || {
        black_box(sampler.observe(&msg, clock.now_nanos()));
    })
}

/// Run all benchmarks
pub fn run_all_benchmarks() -> Vec<BenchResult> {
    println!("\n╔══════════════════════════════════════════════════════════════════════════════╗");
    println!("║                    RELAY BENCH - HOT PATH LATENCY                            ║");
    println!("╠══════════════════════════════════════════════════════════════════════════════╣");

    let results = vec![
        // Header
        bench_header_encode(),
        bench_header_decode(),
        bench_clock_read(),
        // Producer
        bench_payload_generation(),
        // Queues
        bench_queue_roundtrip(),
        bench_channel(),
        // Fan-out
        bench_broadcast(),
        // Receiver
        bench_sampler_observe(),
    ];

    for r in &results {
        println!("║ {} ║", r);
    }

    println!("╚══════════════════════════════════════════════════════════════════════════════╝");

    // Per-message overhead excluding the network
    println!("\n📊 PIPELINE OVERHEAD:");
    let per_message = ["Payload", "Outbound queue", "Broadcast", "Sampler"];
    let total: f64 = results
        .iter()
        .filter(|r| per_message.iter().any(|op| r.name.starts_with(op)))
        .map(|r| r.avg_ns)
        .sum();

    println!("   In-process path per message: {:.2}ns ({:.2}µs)", total, total / 1000.0);

    if total < 1000.0 {
        println!("   ✅ Sub-microsecond in-process overhead");
    } else if total < 10000.0 {
        println!("   ⚠️  Under 10µs - network latency still dominates");
    } else {
        println!("   ❌ Over 10µs - overhead will show in the samples");
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bench_framework() {
        let result = run_bench("test_noop", 1000, || {
            black_box(42);
        });

        assert!(result.avg_ns < 1000.0);
        assert!(result.min_ns <= result.p50_ns);
        assert!(result.p50_ns <= result.p99_ns);
    }

    #[test]
    fn test_queue_bench_does_not_drop() {
        let result = bench_queue_roundtrip();
        assert_eq!(result.iterations, 100_000);
        assert!(result.p99_ns <= result.max_ns);
    }
}
