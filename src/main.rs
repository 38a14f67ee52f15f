//! Relay Bench CLI
//! One process per role: sender, relay or receiver

use metrics_exporter_prometheus::PrometheusBuilder;
use relay_bench::config::LoggingConfig;
use relay_bench::{run_receiver, run_relay, run_sender, BenchConfig};
use std::env;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const USAGE: &str = "usage: relay-bench <sender|relay|receiver|benchmark>";

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))?;

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if logging.json_output {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let Some(role) = args.get(1).map(String::as_str) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = BenchConfig::from_env()?;
    init_logging(&config.logging)?;

    println!("╔═══════════════════════════════════════════════════════════════╗");
    println!("║          RELAY BENCH v0.1.0                                   ║");
    println!("║          WebSocket relay chain | End-to-end latency           ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    if role == "benchmark" {
        info!("Running hot path benchmarks...");
        relay_bench::run_all_benchmarks();
        return Ok(());
    }

    config.validate()?;
    info!("✅ Configuration loaded");
    info!(
        "   Payload: {}..{} bytes | Queue: {} | Throttle: {}ms | Seed: {}",
        config.pipeline.payload_min_bytes,
        config.pipeline.payload_max_bytes,
        config.pipeline.message_chan_size,
        config.pipeline.sender_throttle_millis,
        config.pipeline.rand_seed
    );

    if let Some(addr) = config.metrics.listen_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("✅ Metrics exporter listening on {}", addr);
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        signal.cancel();
    });

    info!("🚀 Starting {} role", role);
    let result = match role {
        "sender" => run_sender(&config, shutdown).await,
        "relay" => run_relay(&config, shutdown).await,
        "receiver" => run_receiver(&config, shutdown).await,
        other => {
            eprintln!("unknown role '{}'\n{}", other, USAGE);
            std::process::exit(2);
        }
    };

    if let Err(e) = &result {
        error!("❌ {} role failed: {:#}", role, e);
    } else {
        info!("✅ {} shutdown complete", role);
    }
    result
}
