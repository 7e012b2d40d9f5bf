//! Immutable agent configuration snapshot
//!
//! Loaded once at startup by the binary. Runtime control commands never
//! mutate a snapshot in place; they derive a new one that is published to
//! the running tasks through a `watch` channel.

use crate::models::CollectorKind;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A log file tailed by the log-tail collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    /// Grouping shown to the backend (system, auth, web, database)
    pub category: String,
}

impl LogFile {
    pub fn new(path: impl Into<PathBuf>, category: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            category: category.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Kinds instantiated at startup
    pub enabled: Vec<CollectorKind>,
    /// Upper bound on a single `collect()` call
    pub timeout: Duration,
    /// Maximum random delay added to each tick
    pub jitter: Duration,
    /// Cap on packet metadata per network-traffic window
    pub max_packets: usize,
    pub log_files: Vec<LogFile>,
    pub auth_log_files: Vec<PathBuf>,
    /// Maximum new lines read per file per tick
    pub max_lines_per_tick: usize,
    /// Root of the kernel connection tables
    pub proc_net_root: PathBuf,
    pub suspicious_processes: Vec<String>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            enabled: CollectorKind::ALL.to_vec(),
            timeout: Duration::from_secs(10),
            jitter: Duration::from_millis(500),
            max_packets: 50,
            log_files: vec![
                LogFile::new("/var/log/syslog", "system"),
                LogFile::new("/var/log/messages", "system"),
                LogFile::new("/var/log/auth.log", "auth"),
                LogFile::new("/var/log/secure", "auth"),
                LogFile::new("/var/log/apache2/access.log", "web"),
                LogFile::new("/var/log/apache2/error.log", "web"),
                LogFile::new("/var/log/nginx/access.log", "web"),
                LogFile::new("/var/log/nginx/error.log", "web"),
                LogFile::new("/var/log/mysql/error.log", "database"),
                LogFile::new("/var/log/postgresql/postgresql.log", "database"),
            ],
            auth_log_files: vec![
                PathBuf::from("/var/log/auth.log"),
                PathBuf::from("/var/log/secure"),
                PathBuf::from("/var/log/syslog"),
                PathBuf::from("/var/log/messages"),
            ],
            max_lines_per_tick: 1000,
            proc_net_root: PathBuf::from("/proc/net"),
            suspicious_processes: [
                "xmrig", "minerd", "cpuminer", "kdevtmpfsi", "kinsing", "cgminer", "ncat",
                "socat", "masscan",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Consecutive failed attempts before persistent-failure mode
    pub retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Fixed retry period once `retries` is exhausted
    pub persistent_retry_interval: Duration,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    /// Maximum unsent messages held by the transport
    pub queue_capacity: usize,
    /// Ceiling on unsent urgent messages; the oldest is dropped beyond it
    pub urgent_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            persistent_retry_interval: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            queue_capacity: 10_000,
            urgent_capacity: 5000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Flush as soon as this many entries are buffered
    pub batch_size: usize,
    /// Hard cap on buffered non-urgent entries
    pub buffer_max_entries: usize,
    /// Ceiling on retained security findings
    pub buffer_max_findings: usize,
    pub shutdown_grace: Duration,
    pub send_all_logs: bool,
    pub channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            buffer_max_entries: 1000,
            buffer_max_findings: 5000,
            shutdown_grace: Duration::from_secs(5),
            send_all_logs: false,
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsAnalyzerSettings {
    /// Rolling window length in samples
    pub history: usize,
    /// Samples needed before a baseline exists
    pub min_history: usize,
    /// Deviation threshold in standard deviations
    pub multiplier: f64,
    /// Consecutive deviating samples before alerting (N)
    pub alert_after: u32,
    /// Consecutive normal samples before clearing (M)
    pub clear_after: u32,
}

impl Default for MetricsAnalyzerSettings {
    fn default() -> Self {
        Self {
            history: 30,
            min_history: 5,
            multiplier: 2.0,
            alert_after: 3,
            clear_after: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityAnalyzerSettings {
    pub ip_threshold: usize,
    pub ip_window: Duration,
    pub user_threshold: usize,
    pub user_window: Duration,
    pub scan_threshold: usize,
    pub scan_window: Duration,
    pub ignored_users: Vec<String>,
}

impl Default for SecurityAnalyzerSettings {
    fn default() -> Self {
        Self {
            ip_threshold: 5,
            ip_window: Duration::from_secs(3600),
            user_threshold: 3,
            user_window: Duration::from_secs(300),
            scan_threshold: 10,
            scan_window: Duration::from_secs(60),
            ignored_users: vec!["root".into(), "nobody".into(), "daemon".into()],
        }
    }
}

/// Read-only configuration shared by every component
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server id, doubles as the agent id on the wire
    pub server_id: String,
    pub agent_version: String,
    pub backend_url: String,
    pub channel_uri: String,
    pub channel_name: String,
    /// Period of the system, network-traffic and log-tail collectors and of
    /// the batch flush
    pub monitoring_interval: Duration,
    pub security_check_interval: Duration,
    /// Per-collector overrides applied by `update-interval`
    pub interval_overrides: BTreeMap<CollectorKind, Duration>,
    pub collectors: CollectorSettings,
    pub transport: TransportSettings,
    pub pipeline: PipelineSettings,
    pub metrics_analyzer: MetricsAnalyzerSettings,
    pub security_analyzer: SecurityAnalyzerSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_id: "local".to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            backend_url: "http://localhost:8000".to_string(),
            channel_uri: "ws://localhost:8080/app/secspot".to_string(),
            channel_name: "agents".to_string(),
            monitoring_interval: Duration::from_secs(20),
            security_check_interval: Duration::from_secs(60),
            interval_overrides: BTreeMap::new(),
            collectors: CollectorSettings::default(),
            transport: TransportSettings::default(),
            pipeline: PipelineSettings::default(),
            metrics_analyzer: MetricsAnalyzerSettings::default(),
            security_analyzer: SecurityAnalyzerSettings::default(),
        }
    }
}

impl AgentConfig {
    pub fn agent_id(&self) -> &str {
        &self.server_id
    }

    /// Effective collection period of a collector
    pub fn interval_for(&self, kind: CollectorKind) -> Duration {
        if let Some(interval) = self.interval_overrides.get(&kind) {
            return *interval;
        }
        match kind {
            CollectorKind::Security => self.security_check_interval,
            _ => self.monitoring_interval,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        self.monitoring_interval
    }

    /// Derive a snapshot with a new interval
    ///
    /// With no collector the base monitoring interval changes and every
    /// override is kept.
    pub fn with_interval(&self, collector: Option<CollectorKind>, interval: Duration) -> Self {
        let mut next = self.clone();
        match collector {
            Some(kind) => {
                next.interval_overrides.insert(kind, interval);
            }
            None => next.monitoring_interval = interval,
        }
        next
    }
}
