//! Agent settings
//!
//! Settings come from an optional TOML file layered under environment
//! variables. Variable names are upper-case field names (`SERVER_ID`,
//! `REVERB_URI`, `MONITORING_INTERVAL`, ...); intervals are in seconds.

use secspot_lib::config::{
    AgentConfig, CollectorSettings, LogFile, PipelineSettings, TransportSettings,
};
use secspot_lib::transport::parse_channel_uri;
use secspot_lib::{CollectorKind, ConfigError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A tailed log file as written in the settings file
#[derive(Debug, Clone, Deserialize)]
pub struct LogFileSetting {
    pub path: PathBuf,
    #[serde(default = "default_log_category")]
    pub category: String,
}

fn default_log_category() -> String {
    "system".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Server id assigned by the backend
    #[serde(default)]
    pub server_id: Option<String>,

    #[serde(default = "default_agent_version")]
    pub agent_version: String,

    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Real-time channel endpoint (`ws://` or `wss://`)
    #[serde(default)]
    pub reverb_uri: Option<String>,

    #[serde(default)]
    pub reverb_channel: Option<String>,

    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval: u64,

    #[serde(default = "default_security_check_interval")]
    pub security_check_interval: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_max_packets")]
    pub max_packets: usize,

    #[serde(default)]
    pub send_all_logs: bool,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    #[serde(default = "default_collector_timeout")]
    pub collector_timeout: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_buffer_max_entries")]
    pub buffer_max_entries: usize,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Collector names to run; all when unset
    #[serde(default)]
    pub collectors: Option<Vec<String>>,

    #[serde(default)]
    pub log_files: Option<Vec<LogFileSetting>>,

    #[serde(default)]
    pub auth_log_files: Option<Vec<PathBuf>>,

    #[serde(default)]
    pub suspicious_processes: Option<Vec<String>>,
}

fn default_agent_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_monitoring_interval() -> u64 {
    20
}

fn default_security_check_interval() -> u64 {
    60
}

fn default_retries() -> u32 {
    3
}

fn default_max_packets() -> usize {
    50
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_collector_timeout() -> u64 {
    10
}

fn default_batch_size() -> usize {
    100
}

fn default_buffer_max_entries() -> usize {
    1000
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_api_port() -> u16 {
    8080
}

impl Settings {
    /// Load settings from an optional file and the process environment
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(file, config::Environment::default())
    }

    fn load_from(
        file: Option<&Path>,
        environment: config::Environment,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(environment.try_parsing(true))
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Check the settings and build the immutable runtime snapshot
    pub fn into_agent_config(self) -> Result<AgentConfig, ConfigError> {
        let server_id = required(self.server_id, "SERVER_ID")?;
        let channel_uri = required(self.reverb_uri, "REVERB_URI")?;
        let channel_name = required(self.reverb_channel, "REVERB_CHANNEL")?;

        parse_channel_uri(&channel_uri).map_err(|e| ConfigError::Invalid {
            name: "REVERB_URI",
            reason: e.to_string(),
        })?;

        let monitoring_interval = seconds(self.monitoring_interval, "MONITORING_INTERVAL")?;
        let security_check_interval =
            seconds(self.security_check_interval, "SECURITY_CHECK_INTERVAL")?;
        let heartbeat_interval = seconds(self.heartbeat_interval, "HEARTBEAT_INTERVAL")?;
        let connect_timeout = seconds(self.connect_timeout, "CONNECT_TIMEOUT")?;
        let collector_timeout = seconds(self.collector_timeout, "COLLECTOR_TIMEOUT")?;

        if self.buffer_max_entries == 0 {
            return Err(ConfigError::Invalid {
                name: "BUFFER_MAX_ENTRIES",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "BATCH_SIZE",
                reason: "must be greater than zero".to_string(),
            });
        }

        let mut collectors = CollectorSettings {
            timeout: collector_timeout,
            max_packets: self.max_packets,
            ..CollectorSettings::default()
        };
        if let Some(names) = self.collectors {
            collectors.enabled = names
                .iter()
                .map(|name| {
                    CollectorKind::parse(name.trim()).ok_or_else(|| ConfigError::Invalid {
                        name: "COLLECTORS",
                        reason: format!("unknown collector `{name}`"),
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(files) = self.log_files {
            collectors.log_files = files
                .into_iter()
                .map(|f| LogFile::new(f.path, f.category))
                .collect();
        }
        if let Some(files) = self.auth_log_files {
            collectors.auth_log_files = files;
        }
        if let Some(names) = self.suspicious_processes {
            collectors.suspicious_processes = names;
        }

        Ok(AgentConfig {
            server_id,
            agent_version: self.agent_version,
            backend_url: self.backend_url,
            channel_uri,
            channel_name,
            monitoring_interval,
            security_check_interval,
            collectors,
            transport: TransportSettings {
                retries: self.retries,
                heartbeat_interval,
                connect_timeout,
                ..TransportSettings::default()
            },
            pipeline: PipelineSettings {
                batch_size: self.batch_size,
                buffer_max_entries: self.buffer_max_entries,
                shutdown_grace: Duration::from_secs(self.shutdown_grace),
                send_all_logs: self.send_all_logs,
                ..PipelineSettings::default()
            },
            ..AgentConfig::default()
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn seconds(value: u64, name: &'static str) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(value))
}
