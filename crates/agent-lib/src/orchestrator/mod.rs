//! Agent orchestrator
//!
//! Owns every runtime component by composition:
//! - one collection loop task per collector
//! - the pipeline, which runs the analyzers and batches outbound data
//! - the transport client, observed through its state channel
//!
//! The pipeline is the single owner of the analyzers and the outbound
//! buffer, so neither needs locking.

mod control;
mod outbound;

#[cfg(test)]
mod tests;

pub use control::{ControlHandler, ControlOutcome};
pub use outbound::{alert_message, samples_message, should_forward, BufferStats, OutboundBuffer};

use crate::analyzer::{analyze_guarded, create_analyzers, Analyzer};
use crate::collector::{
    create_collectors, CollectionLoopBuilder, Collector, CollectorStats, CollectorStatsSnapshot,
};
use crate::config::AgentConfig;
use crate::health::{components, HealthRegistry};
use crate::models::{CollectorKind, Finding, Sample};
use crate::observability::{AgentMetrics, ForwardedLog, StructuredLogger};
use crate::proto::{ControlMessage, HostInfo};
use crate::transport::{ConnectionState, Credentials, TransportClient, TransportStatus};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Outcome of [`Orchestrator::run`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub reason: String,
    /// Buffered entries handed to the transport during shutdown
    pub flushed: usize,
    /// Buffered entries left behind because the backend was unreachable
    pub discarded: usize,
    /// Collector tasks aborted after the grace period
    pub abandoned: usize,
    /// What the discarded entries were
    pub remaining: BufferStats,
    /// Final counters of every collection loop
    pub collectors: BTreeMap<CollectorKind, CollectorStatsSnapshot>,
}

/// Events raised by transport callbacks
enum Notice {
    Control(ControlMessage),
    Status(TransportStatus),
}

pub struct Orchestrator {
    config: Arc<AgentConfig>,
    collectors: Vec<Box<dyn Collector>>,
    analyzers: Vec<Box<dyn Analyzer>>,
    transport: Arc<TransportClient>,
    health: HealthRegistry,
    metrics: AgentMetrics,
    forwarded_logs: Option<mpsc::Receiver<ForwardedLog>>,
}

impl Orchestrator {
    pub fn builder(config: AgentConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> Arc<AgentConfig> {
        Arc::clone(&self.config)
    }

    /// Transport handle, for status reporting
    pub fn transport(&self) -> Arc<TransportClient> {
        Arc::clone(&self.transport)
    }

    /// Run until `shutdown` resolves or the backend sends `disconnect`
    ///
    /// The connection is opened first but never awaited: collector timers
    /// start right away and data buffers locally until the link is up.
    pub async fn run<F>(self, shutdown: F) -> Result<ShutdownReport>
    where
        F: Future<Output = ()> + Send,
    {
        let Orchestrator {
            config,
            collectors,
            analyzers,
            transport,
            health,
            metrics,
            mut forwarded_logs,
        } = self;

        let logger = StructuredLogger::new(config.agent_id());
        logger.log_startup(&config.agent_version, &config.channel_name);

        health.register(components::PIPELINE).await;
        health.register(components::TRANSPORT).await;
        for collector in &collectors {
            health.register(&components::collector(collector.kind())).await;
        }

        let (notice_tx, mut notices) = mpsc::unbounded_channel();
        let control_tx = notice_tx.clone();
        transport.on_message(move |message| {
            let _ = control_tx.send(Notice::Control(message));
        });
        transport.on_status(move |status| {
            let _ = notice_tx.send(Notice::Status(status));
        });

        transport
            .connect(
                &config.channel_uri,
                &config.channel_name,
                Credentials {
                    agent_id: config.agent_id().to_string(),
                    agent_version: config.agent_version.clone(),
                },
            )
            .context("Failed to open real-time connection")?;

        let (config_tx, config_rx) = watch::channel(Arc::clone(&config));
        let (samples_tx, mut samples_rx) =
            mpsc::channel::<Sample>(config.pipeline.channel_capacity.max(1));
        let (stop_tx, _) = broadcast::channel(1);

        let mut triggers = HashMap::new();
        let mut loops: Vec<(CollectorKind, JoinHandle<()>)> = Vec::new();
        let mut loop_stats: Vec<(CollectorKind, Arc<CollectorStats>)> = Vec::new();
        for collector in collectors {
            let kind = collector.kind();
            let collection_loop = CollectionLoopBuilder::new()
                .collector(collector)
                .config(config_rx.clone())
                .samples(samples_tx.clone())
                .health(health.clone())
                .metrics(metrics.clone())
                .build()?;
            triggers.insert(kind, collection_loop.trigger());
            loop_stats.push((kind, collection_loop.stats()));
            loops.push((kind, tokio::spawn(collection_loop.run(stop_tx.subscribe()))));
        }
        drop(samples_tx);

        let mut pipeline = Pipeline {
            analyzers,
            buffer: outbound::OutboundBuffer::new(&config.pipeline, metrics.clone()),
            transport: Arc::clone(&transport),
            control: ControlHandler::new(config_tx, triggers),
            logger: logger.clone(),
            metrics: metrics.clone(),
            health: health.clone(),
            batch_size: config.pipeline.batch_size.max(1),
            send_all_logs: config.pipeline.send_all_logs,
            flush_at: Instant::now() + config.flush_interval(),
        };
        health.set_healthy(components::PIPELINE).await;
        health.set_ready(true).await;
        info!(
            collectors = loops.len(),
            analyzers = pipeline.analyzers.len(),
            "Agent pipeline running"
        );

        let mut state_rx = transport.state();
        tokio::pin!(shutdown);

        let reason = loop {
            tokio::select! {
                _ = &mut shutdown => break "shutdown signal".to_string(),
                Some(notice) = notices.recv() => {
                    if let Some(reason) = pipeline.on_notice(notice).await {
                        break reason;
                    }
                }
                Some(sample) = samples_rx.recv() => pipeline.on_sample(sample),
                Some(log) = recv_log(&mut forwarded_logs) => pipeline.buffer.push_log(log),
                Ok(()) = state_rx.changed() => {
                    let state = *state_rx.borrow_and_update();
                    pipeline.on_state(state);
                }
                _ = sleep_until(pipeline.flush_at) => {
                    pipeline.flush();
                    pipeline.rearm_flush();
                }
            }
        };

        info!(reason = %reason, "Stopping agent");
        health.set_ready(false).await;
        let _ = stop_tx.send(());

        let grace = config.pipeline.shutdown_grace;
        let deadline = Instant::now() + grace;
        let mut abandoned = 0;
        for (kind, mut handle) in loops {
            if timeout_at(deadline, &mut handle).await.is_err() {
                warn!(collector = %kind, "Collector did not stop within grace, abandoning");
                handle.abort();
                abandoned += 1;
            }
        }

        while let Ok(sample) = samples_rx.try_recv() {
            pipeline.on_sample(sample);
        }
        let flushed = pipeline.flush();
        let remaining = pipeline.buffer.stats();
        let discarded = remaining.total();
        if discarded > 0 {
            warn!(
                discarded,
                samples = remaining.samples,
                logs = remaining.logs,
                findings = remaining.anomalies + remaining.protected,
                state = %transport.current_state(),
                "Backend unreachable at shutdown, discarding buffered entries"
            );
        }
        let collectors: BTreeMap<_, _> = loop_stats
            .iter()
            .map(|(kind, stats)| (*kind, stats.snapshot()))
            .collect();

        transport.shutdown(grace).await;
        logger.log_shutdown(&reason, flushed, abandoned);

        Ok(ShutdownReport {
            reason,
            flushed,
            discarded,
            abandoned,
            remaining,
            collectors,
        })
    }
}

async fn recv_log(logs: &mut Option<mpsc::Receiver<ForwardedLog>>) -> Option<ForwardedLog> {
    match logs {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Single owner of the analyzers and the outbound buffer
struct Pipeline {
    analyzers: Vec<Box<dyn Analyzer>>,
    buffer: OutboundBuffer,
    transport: Arc<TransportClient>,
    control: ControlHandler,
    logger: StructuredLogger,
    metrics: AgentMetrics,
    health: HealthRegistry,
    batch_size: usize,
    send_all_logs: bool,
    flush_at: Instant,
}

impl Pipeline {
    fn on_sample(&mut self, sample: Sample) {
        let mut findings = Vec::new();
        for analyzer in self
            .analyzers
            .iter_mut()
            .filter(|a| a.accepts(sample.source()))
        {
            match analyze_guarded(analyzer.as_mut(), &sample) {
                Ok(mut found) => findings.append(&mut found),
                Err(e) => {
                    self.metrics.inc_analyzer_errors(analyzer.name());
                    warn!(
                        analyzer = analyzer.name(),
                        collector = %sample.source(),
                        sample_id = %sample.id(),
                        error = %e,
                        "Analyzer failed on sample"
                    );
                }
            }
        }

        for finding in findings {
            self.on_finding(finding);
        }

        if should_forward(&sample, self.send_all_logs) {
            self.buffer.push_sample(sample);
        }
        if self.buffer.len() >= self.batch_size && self.flush() > 0 {
            self.rearm_flush();
        }
    }

    fn on_finding(&mut self, finding: Finding) {
        self.metrics
            .inc_findings(finding.analyzer(), finding.severity());
        self.logger.log_finding(&finding);

        // while disconnected the bounded finding queue holds them
        if finding.is_critical() && self.transport.current_state().is_connected() {
            match self.transport.send(alert_message(std::slice::from_ref(&finding))) {
                Ok(()) => return,
                Err(e) => warn!(
                    error = %e,
                    rule = %finding.rule(),
                    "Transport refused critical finding, keeping it buffered"
                ),
            }
        }
        self.buffer.push_finding(finding);
    }

    async fn on_notice(&mut self, notice: Notice) -> Option<String> {
        match notice {
            Notice::Control(message) => match self.control.apply(message) {
                ControlOutcome::Continue => None,
                ControlOutcome::RearmFlush => {
                    self.rearm_flush();
                    None
                }
                ControlOutcome::Shutdown { reason } => Some(reason),
            },
            Notice::Status(TransportStatus::PersistentFailure { attempts }) => {
                warn!(
                    attempts,
                    buffered = self.buffer.len(),
                    "Backend unreachable, buffering locally"
                );
                self.health
                    .set_degraded(components::PIPELINE, "backend unreachable")
                    .await;
                None
            }
            Notice::Status(TransportStatus::Recovered) => {
                info!(buffered = self.buffer.len(), "Backend reachable again");
                self.health.set_healthy(components::PIPELINE).await;
                None
            }
        }
    }

    fn on_state(&mut self, state: ConnectionState) {
        self.logger
            .log_connection_state(&state.to_string(), self.buffer.len());
        if state.is_connected() {
            self.flush();
        }
    }

    fn rearm_flush(&mut self) {
        self.flush_at = Instant::now() + self.control.config().flush_interval();
    }

    /// Hand the buffer to the transport. Returns the entries flushed.
    ///
    /// Nothing leaves the buffer while disconnected, so backpressure is
    /// applied here and not in the transport's replay queue. Findings the
    /// transport refuses stay buffered for the next flush.
    fn flush(&mut self) -> usize {
        if self.buffer.is_empty() || !self.transport.current_state().is_connected() {
            return 0;
        }
        let mut flushed = 0;

        let findings = self.buffer.take_findings();
        if !findings.is_empty() {
            match self.transport.send(alert_message(&findings)) {
                Ok(()) => flushed += findings.len(),
                Err(e) => {
                    warn!(
                        error = %e,
                        findings = findings.len(),
                        "Transport refused findings, keeping them buffered"
                    );
                    self.buffer.restore_findings(findings);
                }
            }
        }

        for (message, entries) in self.buffer.drain_batches() {
            match self.transport.send(message) {
                Ok(()) => flushed += entries,
                Err(e) => self.logger.log_data_dropped("batch", &e.to_string()),
            }
        }
        debug!(flushed, "Flushed outbound buffer");
        flushed
    }
}

/// Builder for an [`Orchestrator`]
///
/// Collectors, analyzers and the transport default to what the
/// configuration describes; tests substitute their own.
pub struct OrchestratorBuilder {
    config: AgentConfig,
    collectors: Option<Vec<Box<dyn Collector>>>,
    analyzers: Option<Vec<Box<dyn Analyzer>>>,
    transport: Option<TransportClient>,
    health: Option<HealthRegistry>,
    metrics: Option<AgentMetrics>,
    forwarded_logs: Option<mpsc::Receiver<ForwardedLog>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            collectors: None,
            analyzers: None,
            transport: None,
            health: None,
            metrics: None,
            forwarded_logs: None,
        }
    }

    pub fn collectors(mut self, collectors: Vec<Box<dyn Collector>>) -> Self {
        self.collectors = Some(collectors);
        self
    }

    pub fn analyzers(mut self, analyzers: Vec<Box<dyn Analyzer>>) -> Self {
        self.analyzers = Some(analyzers);
        self
    }

    pub fn transport(mut self, transport: TransportClient) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Receiver of the log forwarding layer
    pub fn forwarded_logs(mut self, logs: mpsc::Receiver<ForwardedLog>) -> Self {
        self.forwarded_logs = Some(logs);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        if self.config.server_id.is_empty() {
            anyhow::bail!("Server id is required");
        }
        let config = Arc::new(self.config);
        let health = self.health.unwrap_or_default();
        let metrics = self.metrics.unwrap_or_default();

        let collectors = self
            .collectors
            .unwrap_or_else(|| create_collectors(&config));
        let analyzers = self
            .analyzers
            .unwrap_or_else(|| create_analyzers(&config));
        let transport = self
            .transport
            .unwrap_or_else(|| {
                TransportClient::websocket(config.transport.clone(), HostInfo::detect())
            })
            .with_health(health.clone())
            .with_metrics(metrics.clone());

        Ok(Orchestrator {
            config,
            collectors,
            analyzers,
            transport: Arc::new(transport),
            health,
            metrics,
            forwarded_logs: self.forwarded_logs,
        })
    }
}
