//! Per-collector scheduling loop
//!
//! Every collector runs in its own task on its own timer. A tick is bounded
//! by the configured collector timeout; a failed or timed-out tick produces
//! no sample and bumps the degraded counter. The loop also reacts to
//! immediate-run triggers and to interval changes published on the config
//! watch channel.

use super::Collector;
use crate::config::AgentConfig;
use crate::error::CollectorError;
use crate::health::{components, HealthRegistry};
use crate::models::{CollectorKind, Sample};
use crate::observability::AgentMetrics;
use anyhow::Result;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// Counters shared between a loop and its observers
#[derive(Debug, Default)]
pub struct CollectorStats {
    ticks: AtomicU64,
    samples: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    consecutive_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStatsSnapshot {
    pub ticks: u64,
    pub samples: u64,
    /// Degraded counter: failed or timed-out ticks
    pub failures: u64,
    pub timeouts: u64,
    pub consecutive_failures: u64,
}

impl CollectorStats {
    pub fn snapshot(&self) -> CollectorStatsSnapshot {
        CollectorStatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

/// Why a tick ran
#[derive(Debug, Clone, Copy)]
enum TickCause {
    Scheduled,
    Triggered,
}

/// Collection loop driving one collector
pub struct CollectionLoop {
    collector: Box<dyn Collector>,
    kind: CollectorKind,
    config: watch::Receiver<Arc<AgentConfig>>,
    samples_tx: mpsc::Sender<Sample>,
    trigger: Arc<Notify>,
    stats: Arc<CollectorStats>,
    health: HealthRegistry,
    metrics: AgentMetrics,
}

impl CollectionLoop {
    /// Create a new collection loop
    pub fn new(
        collector: Box<dyn Collector>,
        config: watch::Receiver<Arc<AgentConfig>>,
        samples_tx: mpsc::Sender<Sample>,
    ) -> Self {
        let kind = collector.kind();
        Self {
            collector,
            kind,
            config,
            samples_tx,
            trigger: Arc::new(Notify::new()),
            stats: Arc::new(CollectorStats::default()),
            health: HealthRegistry::new(),
            metrics: AgentMetrics::new(),
        }
    }

    pub fn kind(&self) -> CollectorKind {
        self.kind
    }

    /// Handle that forces an immediate, out-of-schedule tick
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    pub fn stats(&self) -> Arc<CollectorStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the shutdown signal fires
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut period = self.current_interval();
        info!(
            collector = %self.kind,
            interval_secs = period.as_secs(),
            "Starting collection loop"
        );

        let mut anchor = Instant::now();
        let mut deadline = anchor;
        let mut config_open = true;

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    self.tick(TickCause::Scheduled).await;

                    let now = Instant::now();
                    anchor += period;
                    while anchor <= now {
                        anchor += period;
                    }
                    deadline = anchor + self.jitter();
                }
                _ = self.trigger.notified() => {
                    self.tick(TickCause::Triggered).await;
                }
                changed = self.config.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        continue;
                    }
                    let next = self.current_interval();
                    if next != period {
                        info!(
                            collector = %self.kind,
                            old_interval_secs = period.as_secs(),
                            new_interval_secs = next.as_secs(),
                            "Collection interval updated"
                        );
                        period = next;
                        anchor = Instant::now() + period;
                        deadline = anchor + self.jitter();
                    }
                }
                _ = shutdown.recv() => {
                    info!(collector = %self.kind, "Shutting down collection loop");
                    break;
                }
            }
        }
    }

    fn current_interval(&self) -> Duration {
        self.config.borrow().interval_for(self.kind)
    }

    fn jitter(&self) -> Duration {
        let max = self.config.borrow().collectors.jitter;
        rand_jitter(max)
    }

    /// Run one bounded collection and forward the sample
    async fn tick(&mut self, cause: TickCause) {
        let budget = self.config.borrow().collectors.timeout;
        let start = Instant::now();
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let result = match timeout(budget, self.collector.collect()).await {
            Ok(result) => result,
            Err(_) => Err(CollectorError::timeout(self.kind, budget)),
        };
        let elapsed = start.elapsed();

        match result {
            Ok(sample) => {
                self.record_success(elapsed).await;
                debug!(
                    collector = %self.kind,
                    cause = ?cause,
                    elapsed_ms = elapsed.as_millis() as u64,
                    truncated = sample.is_truncated(),
                    "Collected sample"
                );
                match timeout(budget, self.samples_tx.send(sample)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => debug!(collector = %self.kind, "Pipeline closed, sample discarded"),
                    Err(_) => warn!(
                        collector = %self.kind,
                        "Pipeline backed up, sample dropped"
                    ),
                }
            }
            Err(e) => self.record_failure(&e).await,
        }
    }

    async fn record_success(&self, elapsed: Duration) {
        self.stats.samples.fetch_add(1, Ordering::Relaxed);
        let previous = self.stats.consecutive_failures.swap(0, Ordering::Relaxed);
        self.metrics
            .observe_collection_latency(self.kind, elapsed.as_secs_f64());
        self.metrics.inc_samples_collected(self.kind);
        if previous > 0 {
            info!(
                collector = %self.kind,
                failed_ticks = previous,
                "Collector recovered"
            );
            self.health
                .set_healthy(&components::collector(self.kind))
                .await;
        }
    }

    async fn record_failure(&self, err: &CollectorError) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        if err.timed_out {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        let consecutive = self.stats.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.inc_collector_failure(self.kind, err.timed_out);

        warn!(
            collector = %self.kind,
            error = %err,
            timed_out = err.timed_out,
            consecutive_failures = consecutive,
            "Collector tick failed"
        );
        self.health
            .set_degraded(&components::collector(self.kind), err.to_string())
            .await;
    }
}

/// Random jitter in `[0, max)`
fn rand_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}

/// Builder for creating a collection loop
pub struct CollectionLoopBuilder {
    collector: Option<Box<dyn Collector>>,
    config: Option<watch::Receiver<Arc<AgentConfig>>>,
    samples_tx: Option<mpsc::Sender<Sample>>,
    health: Option<HealthRegistry>,
    metrics: Option<AgentMetrics>,
}

impl CollectionLoopBuilder {
    pub fn new() -> Self {
        Self {
            collector: None,
            config: None,
            samples_tx: None,
            health: None,
            metrics: None,
        }
    }

    pub fn collector(mut self, collector: Box<dyn Collector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn config(mut self, config: watch::Receiver<Arc<AgentConfig>>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn samples(mut self, samples_tx: mpsc::Sender<Sample>) -> Self {
        self.samples_tx = Some(samples_tx);
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

    pub fn build(self) -> Result<CollectionLoop> {
        let collector = self
            .collector
            .ok_or_else(|| anyhow::anyhow!("Collector is required"))?;
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("Config receiver is required"))?;
        let samples_tx = self
            .samples_tx
            .ok_or_else(|| anyhow::anyhow!("Sample sender is required"))?;

        let mut collection_loop = CollectionLoop::new(collector, config, samples_tx);
        if let Some(health) = self.health {
            collection_loop.health = health;
        }
        if let Some(metrics) = self.metrics {
            collection_loop.metrics = metrics;
        }
        Ok(collection_loop)
    }
}

impl Default for CollectionLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
