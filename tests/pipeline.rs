//! End-to-end: sender -> relay -> receiver over loopback WebSockets

use relay_bench::config::DEFAULT_OVERFLOW_THRESHOLD_NANOS;
use relay_bench::relay::RelayState;
use relay_bench::{start_receiver, start_relay, start_sender, BenchConfig, SystemClock, WsConnector};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn loopback_config() -> BenchConfig {
    let mut config = BenchConfig::default();
    config.pipeline.rand_seed = 42;
    config.pipeline.payload_min_bytes = 2;
    config.pipeline.payload_max_bytes = 4096;
    config.pipeline.message_chan_size = 2048;
    config.pipeline.sender_throttle_millis = 0;
    config.sender.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    config.sender.message_limit = Some(1000);
    config.sender.fatal_on_starvation = false;
    config.sender.prime_delay_ms = 0;
    config.relay.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_hop_chain_measures_latency() {
    let mut config = loopback_config();
    let shutdown = CancellationToken::new();
    let clock = Arc::new(SystemClock::new());

    let sender = start_sender(&config, clock.clone(), shutdown.clone()).await.unwrap();
    config.relay.upstream_url = format!("ws://{}/sender", sender.local_addr);

    let relay = start_relay(&config, Arc::new(WsConnector), shutdown.clone()).await.unwrap();
    assert_eq!(relay.state(), RelayState::Idle);
    config.receiver.target_url = format!("ws://{}/relay", relay.local_addr);

    let receiver = start_receiver(&config, Arc::new(WsConnector), clock, shutdown.clone())
        .await
        .unwrap();

    let mut stats = receiver.stats.clone();
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if stats.borrow_and_update().stats.count >= 900 {
                break;
            }
            if stats.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "receiver stalled at {:?}", receiver.snapshot());

    let snapshot = receiver.snapshot();
    assert!(snapshot.received >= 1000 - 100);
    assert!(snapshot.stats.min <= snapshot.stats.last);
    assert!(snapshot.stats.last <= snapshot.stats.max);
    assert!(snapshot.stats.max < DEFAULT_OVERFLOW_THRESHOLD_NANOS);
    assert_eq!(snapshot.corrupted, 0);
    assert_eq!(snapshot.malformed, 0);

    assert_eq!(relay.state(), RelayState::Forwarding);
    assert_eq!(relay.registry.ready_count(), 1);
    assert_eq!(sender.registry.ready_count(), 1);
    assert_eq!(sender.queue_stats.dropped.load(std::sync::atomic::Ordering::Relaxed), 0);

    shutdown.cancel();
    sender.wait().await.unwrap();
    relay.wait().await.unwrap();
    let last = receiver.wait().await.unwrap();
    assert!(last.stats.count >= 900);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_receiver_sees_fresh_timestamps() {
    // Default sender policy: fatal on starvation, 100ms prime delay
    let mut config = BenchConfig::default();
    config.pipeline.sender_throttle_millis = 10;
    config.sampler.ignore_initial_message_count = 10;
    config.sender.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    config.relay.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    assert!(config.sender.fatal_on_starvation);

    let shutdown = CancellationToken::new();
    let clock = Arc::new(SystemClock::new());

    let sender = start_sender(&config, clock.clone(), shutdown.clone()).await.unwrap();
    config.relay.upstream_url = format!("ws://{}/sender", sender.local_addr);
    let relay = start_relay(&config, Arc::new(WsConnector), shutdown.clone()).await.unwrap();
    config.receiver.target_url = format!("ws://{}/relay", relay.local_addr);

    // Nobody listens for a while; none of that wait may show up in the samples
    let idle = Duration::from_millis(1_500);
    tokio::time::sleep(idle).await;
    assert_eq!(sender.queue_stats.enqueued.load(std::sync::atomic::Ordering::Relaxed), 0);

    let receiver = start_receiver(&config, Arc::new(WsConnector), clock, shutdown.clone())
        .await
        .unwrap();

    let mut stats = receiver.stats.clone();
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if stats.borrow_and_update().stats.count >= 40 {
                break;
            }
            if stats.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "receiver stalled at {:?}", receiver.snapshot());

    let snapshot = receiver.snapshot();
    assert_eq!(snapshot.corrupted, 0);
    assert!(
        Duration::from_nanos(snapshot.stats.max) < idle / 2,
        "max latency {:?} includes time spent waiting for a receiver",
        Duration::from_nanos(snapshot.stats.max)
    );

    shutdown.cancel();
    sender.wait().await.unwrap();
    relay.wait().await.unwrap();
    receiver.wait().await.unwrap();
}

#[tokio::test]
async fn test_receiver_fails_without_relay() {
    let mut config = loopback_config();
    // Bind then release a port so nothing is listening on it
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    config.receiver.target_url = format!("ws://{}/relay", addr);

    let result = start_receiver(
        &config,
        Arc::new(WsConnector),
        Arc::new(SystemClock::new()),
        CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
}
