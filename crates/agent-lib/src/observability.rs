//! Observability infrastructure for the security agent
//!
//! Provides:
//! - Prometheus metrics (collection latency, degraded collectors, findings,
//!   transport traffic, buffer depth, connection state)
//! - Structured JSON logging helpers with tracing
//! - A tracing layer that forwards WARN/ERROR events to the backend

use crate::models::{CollectorKind, Finding, Severity};
use chrono::{DateTime, Utc};
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{info, warn, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct AgentMetricsInner {
    collection_latency_seconds: HistogramVec,
    samples_collected: IntCounterVec,
    collector_failures: IntCounterVec,
    findings: IntCounterVec,
    analyzer_errors: IntCounterVec,
    messages_sent: IntCounterVec,
    entries_dropped: IntCounterVec,
    reconnect_attempts: IntCounter,
    outbound_buffer_entries: IntGauge,
    transport_queue_depth: IntGauge,
    connection_state: IntGauge,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            collection_latency_seconds: register_histogram_vec!(
                "secspot_collection_latency_seconds",
                "Time spent in a single collector invocation",
                &["collector"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_latency_seconds"),

            samples_collected: register_int_counter_vec!(
                "secspot_samples_collected_total",
                "Samples produced per collector",
                &["collector"]
            )
            .expect("Failed to register samples_collected"),

            collector_failures: register_int_counter_vec!(
                "secspot_collector_failures_total",
                "Failed or timed-out collector ticks (degraded counter)",
                &["collector", "reason"]
            )
            .expect("Failed to register collector_failures"),

            findings: register_int_counter_vec!(
                "secspot_findings_total",
                "Findings emitted by analyzers",
                &["analyzer", "severity"]
            )
            .expect("Failed to register findings"),

            analyzer_errors: register_int_counter_vec!(
                "secspot_analyzer_errors_total",
                "Samples an analyzer failed to process",
                &["analyzer"]
            )
            .expect("Failed to register analyzer_errors"),

            messages_sent: register_int_counter_vec!(
                "secspot_messages_sent_total",
                "Messages written to the real-time channel",
                &["type"]
            )
            .expect("Failed to register messages_sent"),

            entries_dropped: register_int_counter_vec!(
                "secspot_entries_dropped_total",
                "Outbound entries dropped under backpressure",
                &["entry"]
            )
            .expect("Failed to register entries_dropped"),

            reconnect_attempts: register_int_counter!(
                "secspot_reconnect_attempts_total",
                "Connection attempts after the first"
            )
            .expect("Failed to register reconnect_attempts"),

            outbound_buffer_entries: register_int_gauge!(
                "secspot_outbound_buffer_entries",
                "Entries waiting in the orchestrator's outbound buffer"
            )
            .expect("Failed to register outbound_buffer_entries"),

            transport_queue_depth: register_int_gauge!(
                "secspot_transport_queue_depth",
                "Messages queued in the transport awaiting a write"
            )
            .expect("Failed to register transport_queue_depth"),

            connection_state: register_int_gauge!(
                "secspot_connection_state",
                "0 disconnected, 1 connecting, 2 connected, 3 backoff"
            )
            .expect("Failed to register connection_state"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_collection_latency(&self, collector: CollectorKind, duration_secs: f64) {
        self.inner()
            .collection_latency_seconds
            .with_label_values(&[collector.as_str()])
            .observe(duration_secs);
    }

    pub fn inc_samples_collected(&self, collector: CollectorKind) {
        self.inner()
            .samples_collected
            .with_label_values(&[collector.as_str()])
            .inc();
    }

    pub fn inc_collector_failure(&self, collector: CollectorKind, timed_out: bool) {
        let reason = if timed_out { "timeout" } else { "error" };
        self.inner()
            .collector_failures
            .with_label_values(&[collector.as_str(), reason])
            .inc();
    }

    pub fn inc_findings(&self, analyzer: &str, severity: Severity) {
        self.inner()
            .findings
            .with_label_values(&[analyzer, severity.as_str()])
            .inc();
    }

    pub fn inc_analyzer_errors(&self, analyzer: &str) {
        self.inner()
            .analyzer_errors
            .with_label_values(&[analyzer])
            .inc();
    }

    pub fn inc_messages_sent(&self, message_type: &str) {
        self.inner()
            .messages_sent
            .with_label_values(&[message_type])
            .inc();
    }

    pub fn inc_entries_dropped(&self, entry: &str) {
        self.inner()
            .entries_dropped
            .with_label_values(&[entry])
            .inc();
    }

    pub fn inc_reconnect_attempts(&self) {
        self.inner().reconnect_attempts.inc();
    }

    pub fn set_outbound_buffer(&self, entries: usize) {
        self.inner().outbound_buffer_entries.set(entries as i64);
    }

    pub fn set_transport_queue_depth(&self, depth: usize) {
        self.inner().transport_queue_depth.set(depth as i64);
    }

    pub fn set_connection_state(&self, code: i64) {
        self.inner().connection_state.set(code);
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for lifecycle, findings and
/// connectivity so these events share field names.
#[derive(Clone)]
pub struct StructuredLogger {
    agent_id: String,
}

impl StructuredLogger {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, channel: &str) {
        info!(
            event = "agent_started",
            agent_id = %self.agent_id,
            agent_version = %version,
            channel = %channel,
            "Security agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str, flushed: usize, abandoned: usize) {
        info!(
            event = "agent_shutdown",
            agent_id = %self.agent_id,
            reason = %reason,
            flushed_entries = flushed,
            abandoned_tasks = abandoned,
            "Security agent shutting down"
        );
    }

    /// Log a finding produced by an analyzer
    pub fn log_finding(&self, finding: &Finding) {
        if finding.severity() >= Severity::High {
            warn!(
                event = "finding_detected",
                agent_id = %self.agent_id,
                analyzer = finding.analyzer(),
                rule = %finding.rule(),
                severity = %finding.severity(),
                sample_id = %finding.sample_id(),
                "{}",
                finding.description()
            );
        } else {
            info!(
                event = "finding_detected",
                agent_id = %self.agent_id,
                analyzer = finding.analyzer(),
                rule = %finding.rule(),
                severity = %finding.severity(),
                sample_id = %finding.sample_id(),
                "{}",
                finding.description()
            );
        }
    }

    /// Log a connection state change observed by the orchestrator
    pub fn log_connection_state(&self, state: &str, buffered: usize) {
        info!(
            event = "connection_state",
            agent_id = %self.agent_id,
            state = %state,
            buffered_entries = buffered,
            "Connection state changed"
        );
    }

    /// Log data dropped under backpressure
    pub fn log_data_dropped(&self, entry: &str, reason: &str) {
        warn!(
            event = "data_dropped",
            agent_id = %self.agent_id,
            entry = %entry,
            reason = %reason,
            "Dropped buffered entry"
        );
    }
}

/// A log event captured for the backend
#[derive(Debug, Clone, Serialize)]
pub struct ForwardedLog {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

/// Targets whose events are never forwarded. The transport cannot ship its
/// own failures, and buffer drop warnings would re-enter the buffer.
const SUPPRESSED_TARGETS: &[&str] = &[
    "secspot_lib::transport",
    "secspot_lib::orchestrator::outbound",
    "tokio_tungstenite",
    "tungstenite",
    "rustls",
];

/// Tracing layer forwarding log events to the orchestrator
///
/// WARN and ERROR are always forwarded; INFO only while `send_all` is set.
/// The channel is lossy: when full, events are discarded.
pub struct LogForwardLayer {
    tx: mpsc::Sender<ForwardedLog>,
    send_all: Arc<AtomicBool>,
}

impl LogForwardLayer {
    pub fn new(capacity: usize, send_all: bool) -> (Self, mpsc::Receiver<ForwardedLog>) {
        let (tx, rx) = mpsc::channel(capacity);
        let layer = Self {
            tx,
            send_all: Arc::new(AtomicBool::new(send_all)),
        };
        (layer, rx)
    }

    /// Shared switch for forwarding INFO events
    pub fn send_all_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.send_all)
    }

    fn should_forward(&self, level: &Level, target: &str) -> bool {
        if SUPPRESSED_TARGETS.iter().any(|t| target.starts_with(t)) {
            return false;
        }
        *level <= Level::WARN || (*level == Level::INFO && self.send_all.load(Ordering::Relaxed))
    }
}

impl<S: Subscriber> Layer<S> for LogForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !self.should_forward(meta.level(), meta.target()) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let _ = self.tx.try_send(ForwardedLog {
            timestamp: Utc::now(),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::Bool(value));
    }
}
