//! Telemetry collection
//!
//! A collector reads one data source and turns it into a [`Sample`]. Each
//! collector is owned by its own [`CollectionLoop`] task, so a slow or
//! failing source never delays another collector's schedule.

mod logs;
mod network;
mod procnet;
mod security;
mod system;
mod tail;
mod r#loop;


pub use logs::{classify, LogSeverity, LogTailCollector};
pub use network::{NetworkTrafficCollector, PacketMeta, PacketSource, ProcNetSource};
pub use procnet::{Protocol, SocketEntry, SocketState};
pub use r#loop::{CollectionLoop, CollectionLoopBuilder, CollectorStats, CollectorStatsSnapshot};
pub use security::{match_auth_line, SecurityCollector};
pub use system::SystemCollector;
pub use tail::LogTail;

use crate::config::AgentConfig;
use crate::error::CollectorError;
use crate::models::{CollectorKind, Sample};

pub use async_trait::async_trait;

/// A single telemetry source
#[async_trait]
pub trait Collector: Send + Sync {
    fn kind(&self) -> CollectorKind;

    /// Produce one sample. Callers bound this with a timeout.
    async fn collect(&mut self) -> Result<Sample, CollectorError>;
}

/// Instantiate the collectors enabled in `config`
pub fn create_collectors(config: &AgentConfig) -> Vec<Box<dyn Collector>> {
    let settings = &config.collectors;
    settings
        .enabled
        .iter()
        .map(|kind| -> Box<dyn Collector> {
            match kind {
                CollectorKind::System => Box::new(SystemCollector::new()),
                CollectorKind::NetworkTraffic => Box::new(NetworkTrafficCollector::new(
                    Box::new(ProcNetSource::new(&settings.proc_net_root)),
                    settings.max_packets,
                )),
                CollectorKind::Security => Box::new(SecurityCollector::new(
                    settings.auth_log_files.clone(),
                    &settings.proc_net_root,
                    settings.suspicious_processes.clone(),
                    settings.max_lines_per_tick,
                )),
                CollectorKind::LogTail => Box::new(LogTailCollector::new(
                    settings.log_files.clone(),
                    settings.max_lines_per_tick,
                )),
            }
        })
        .inspect(|c| tracing::info!(collector = %c.kind(), "Collector enabled"))
        .collect()
}
