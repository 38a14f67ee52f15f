//! Process roles: sender, relay and receiver
//!
//! Each `start_*` function wires the pipeline stages for one role, spawns
//! their tasks and returns immediately with a handle exposing the bound
//! address and live state. All tasks observe the shared shutdown token.

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BenchConfig;
use crate::error::BenchError;
use crate::generator::GeneratorStats;
use crate::generator::Generator;
use crate::queue::{outbound_queue, QueueStats};
use crate::registry::SessionRegistry;
use crate::relay::{Connector, RelayForwarder, RelayState, UpstreamStream};
use crate::sampler::{LatencySampler, Reporter, StatsSnapshot};
use crate::sender::{SenderStats, StarvationPolicy, TransportSender};
use crate::timestamp::{Clock, SystemClock};
use crate::transport::{SessionHandler, WsConnector, WsServer};
use crate::registry::RequestMeta;
use crate::types::{Message, ReceivedMessage, SessionId};

/// Generator side of the chain
pub struct SenderNode {
    pub local_addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    pub queue_stats: Arc<QueueStats>,
    task: JoinHandle<anyhow::Result<()>>,
}

/// Intermediate hop
pub struct RelayNode {
    pub local_addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    pub forwarder: Arc<RelayForwarder>,
    task: JoinHandle<anyhow::Result<()>>,
}

/// Terminal hop
pub struct ReceiverNode {
    pub stats: watch::Receiver<StatsSnapshot>,
    task: JoinHandle<anyhow::Result<StatsSnapshot>>,
}

struct SenderHandler;

#[async_trait]
impl SessionHandler for SenderHandler {
    async fn on_ready(&self, id: SessionId) {
        info!(%id, "Streaming to session");
    }
}

struct RelayHandler {
    forwarder: Arc<RelayForwarder>,
    registry: Arc<SessionRegistry>,
}

#[async_trait]
impl SessionHandler for RelayHandler {
    async fn on_connect(&self, _id: SessionId, _meta: &RequestMeta) {
        self.forwarder.on_downstream_connect();
    }

    async fn on_ready(&self, id: SessionId) {
        if let Err(e) = self.forwarder.on_downstream_ready().await {
            warn!(%id, "Could not open upstream for session: {}", e);
        }
    }

    async fn on_close(&self, _id: SessionId) {
        if self.registry.is_empty() {
            self.forwarder.on_downstream_idle();
        }
    }
}

pub async fn start_sender(
    config: &BenchConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) -> anyhow::Result<SenderNode> {
    config.validate()?;
    let pipeline = &config.pipeline;

    let registry = Arc::new(SessionRegistry::new(pipeline.message_chan_size));
    let (queue, rx) = outbound_queue("sender", pipeline.message_chan_size);
    let queue_stats = queue.stats();

    let server = WsServer::bind(config.sender.listen_addr, &config.sender.path, registry.clone())
        .await
        .with_context(|| format!("binding sender on {}", config.sender.listen_addr))?;
    let local_addr = server.local_addr();

    // Nothing is stamped until a client is listening
    let generator = Generator::new(pipeline, queue, clock)
        .with_limit(config.sender.message_limit)
        .with_ready_gate(registry.clone());
    let policy = if config.sender.fatal_on_starvation {
        StarvationPolicy::Fatal
    } else {
        StarvationPolicy::Wait
    };
    let sender = TransportSender::new(rx, registry.clone(), policy)
        .with_throttle(pipeline.throttle())
        .with_prime_delay(Duration::from_millis(config.sender.prime_delay_ms));

    tokio::spawn(server.serve(Arc::new(SenderHandler), shutdown.clone()));
    let generator_task = tokio::spawn(generator.run(shutdown.clone()));
    let sender_task = tokio::spawn(sender.run(shutdown.clone()));
    let task = tokio::spawn(supervise_sender(generator_task, sender_task, shutdown));

    info!(%local_addr, "Sender node started");
    Ok(SenderNode {
        local_addr,
        registry,
        queue_stats,
        task,
    })
}

impl SenderNode {
    pub async fn wait(self) -> anyhow::Result<()> {
        self.task.await?
    }
}

pub async fn start_relay(
    config: &BenchConfig,
    connector: Arc<dyn Connector>,
    shutdown: CancellationToken,
) -> anyhow::Result<RelayNode> {
    config.validate()?;
    let pipeline = &config.pipeline;

    let registry = Arc::new(SessionRegistry::new(pipeline.message_chan_size));
    let (queue, rx) = outbound_queue("relay", pipeline.message_chan_size);
    let forwarder = Arc::new(
        RelayForwarder::new(config.relay.upstream_url.clone(), connector, queue, shutdown.clone())
            .with_ready_gate(registry.clone()),
    );

    let server = WsServer::bind(config.relay.listen_addr, &config.relay.path, registry.clone())
        .await
        .with_context(|| format!("binding relay on {}", config.relay.listen_addr))?;
    let local_addr = server.local_addr();

    let handler = Arc::new(RelayHandler {
        forwarder: forwarder.clone(),
        registry: registry.clone(),
    });
    tokio::spawn(server.serve(handler, shutdown.clone()));

    let sender = TransportSender::new(rx, registry.clone(), StarvationPolicy::Wait);
    let task = tokio::spawn(supervise_relay(sender, shutdown));

    info!(%local_addr, upstream = %config.relay.upstream_url, "Relay node started");
    Ok(RelayNode {
        local_addr,
        registry,
        forwarder,
        task,
    })
}

impl RelayNode {
    pub fn state(&self) -> RelayState {
        self.forwarder.state()
    }

    pub async fn wait(self) -> anyhow::Result<()> {
        self.task.await?
    }
}

pub async fn start_receiver(
    config: &BenchConfig,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) -> anyhow::Result<ReceiverNode> {
    config.validate()?;

    let (sampler, stats) = LatencySampler::from_config(&config.pipeline, &config.sampler);
    let reporter = Reporter::new(stats.clone(), config.sampler.report_interval());
    let (tx, rx) = mpsc::channel(config.pipeline.message_chan_size);

    let target = config.receiver.target_url.clone();
    let frames = connector
        .connect(&target)
        .await
        .with_context(|| format!("connecting receiver to {}", target))?;

    let sampler_task = tokio::spawn(sampler.run(rx, shutdown.clone()));
    tokio::spawn(reporter.run(shutdown.clone()));

    let task = tokio::spawn(read_frames(frames, tx, sampler_task, clock, shutdown));

    info!(%target, "Receiver node started");
    Ok(ReceiverNode { stats, task })
}

impl ReceiverNode {
    pub fn snapshot(&self) -> StatsSnapshot {
        *self.stats.borrow()
    }

    pub async fn wait(self) -> anyhow::Result<StatsSnapshot> {
        self.task.await?
    }
}

/// Waits on both sender-side stages; the first failure cancels the other
async fn supervise_sender(
    mut generator_task: JoinHandle<Result<GeneratorStats, BenchError>>,
    mut sender_task: JoinHandle<Result<SenderStats, BenchError>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut generator_done = false;
    let mut sender_done = false;

    while !(generator_done && sender_done) {
        let outcome = tokio::select! {
            res = &mut generator_task, if !generator_done => {
                generator_done = true;
                res?.map(|stats| info!(?stats, "Generator finished"))
            }
            res = &mut sender_task, if !sender_done => {
                sender_done = true;
                res?.map(|stats| info!(?stats, "Sender finished"))
            }
        };
        if let Err(e) = outcome {
            if e.is_fatal() {
                error!("Sender role failed: {}", e);
            } else {
                warn!("Sender stage stopped: {}", e);
            }
            shutdown.cancel();
            return Err(e.into());
        }
    }
    Ok(())
}

async fn supervise_relay(sender: TransportSender, shutdown: CancellationToken) -> anyhow::Result<()> {
    let stats = sender.run(shutdown).await?;
    info!(?stats, "Relay sender finished");
    Ok(())
}

/// Receiver read loop: timestamp on arrival, hand off to the sampler
async fn read_frames(
    mut frames: UpstreamStream,
    tx: mpsc::Sender<ReceivedMessage>,
    sampler_task: JoinHandle<StatsSnapshot>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) -> anyhow::Result<StatsSnapshot> {
    let mut dropped = 0u64;
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(bytes)) => {
                let received = ReceivedMessage {
                    recv_ns: clock.now_nanos(),
                    message: Message::from_wire(bytes),
                };
                if tx.try_send(received).is_err() {
                    dropped += 1;
                    metrics::counter!("relay_bench_messages_dropped_total", "queue" => "receiver")
                        .increment(1);
                    if dropped % 1000 == 1 {
                        warn!(dropped, "receiver chan full");
                    } else {
                        debug!(dropped, "receiver chan full");
                    }
                }
            }
            Some(Err(e)) => {
                warn!("Receiver stream failed: {}", e);
                break;
            }
            None => {
                info!("Receiver stream ended");
                break;
            }
        }
    }

    drop(tx);
    Ok(sampler_task.await?)
}

/// Run the sender role until shutdown or a fatal error
pub async fn run_sender(config: &BenchConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let node = start_sender(config, Arc::new(SystemClock::new()), shutdown).await?;
    node.wait().await
}

pub async fn run_relay(config: &BenchConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let node = start_relay(config, Arc::new(WsConnector), shutdown).await?;
    node.wait().await
}

pub async fn run_receiver(config: &BenchConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let node = start_receiver(config, Arc::new(WsConnector), Arc::new(SystemClock::new()), shutdown).await?;
    let snapshot = node.wait().await?;
    info!(
        received = snapshot.received,
        samples = snapshot.stats.count,
        corrupted = snapshot.corrupted,
        "Receiver finished"
    );
    Ok(())
}
