//! Host resource collector backed by `sysinfo`

use super::Collector;
use crate::error::CollectorError;
use crate::models::{CollectorKind, Payload, Sample};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use sysinfo::{Disks, Networks, System};

struct Probes {
    system: System,
    networks: Networks,
    disks: Disks,
}

pub struct SystemCollector {
    probes: Arc<Mutex<Probes>>,
}

impl SystemCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes
        system.refresh_cpu();
        Self {
            probes: Arc::new(Mutex::new(Probes {
                system,
                networks: Networks::new_with_refreshed_list(),
                disks: Disks::new_with_refreshed_list(),
            })),
        }
    }
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

fn snapshot(probes: &mut Probes) -> Payload {
    let Probes {
        system,
        networks,
        disks,
    } = probes;

    system.refresh_cpu();
    system.refresh_memory();
    networks.refresh();
    disks.refresh();

    let cpu = system.global_cpu_info().cpu_usage() as f64;
    let ram_total = system.total_memory();
    let ram_used = system.used_memory();

    let (disk_total, disk_used) = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == Path::new("/"))
        .or_else(|| disks.list().first())
        .map(|d| (d.total_space(), d.total_space().saturating_sub(d.available_space())))
        .unwrap_or((0, 0));

    let (mut bytes_recv, mut bytes_sent) = (0u64, 0u64);
    let (mut packets_recv, mut packets_sent) = (0u64, 0u64);
    for (_, data) in networks.list() {
        bytes_recv += data.total_received();
        bytes_sent += data.total_transmitted();
        packets_recv += data.total_packets_received();
        packets_sent += data.total_packets_transmitted();
    }

    let load = System::load_average();

    let mut payload = Payload::new();
    payload.insert("cpu".into(), json!({ "percent": cpu, "cores": system.cpus().len() }));
    payload.insert(
        "ram".into(),
        json!({ "total": ram_total, "used": ram_used, "percent": percent(ram_used, ram_total) }),
    );
    payload.insert(
        "disk".into(),
        json!({ "total": disk_total, "used": disk_used, "percent": percent(disk_used, disk_total) }),
    );
    payload.insert(
        "network".into(),
        json!({
            "bytes_recv": bytes_recv,
            "bytes_sent": bytes_sent,
            "packets_recv": packets_recv,
            "packets_sent": packets_sent,
        }),
    );
    payload.insert(
        "load".into(),
        json!({ "one": load.one, "five": load.five, "fifteen": load.fifteen }),
    );
    payload.insert("uptime_secs".into(), Value::from(System::uptime()));
    payload
}

#[async_trait]
impl Collector for SystemCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::System
    }

    async fn collect(&mut self) -> Result<Sample, CollectorError> {
        let probes = Arc::clone(&self.probes);
        let payload = tokio::task::spawn_blocking(move || {
            let mut probes = probes
                .lock()
                .map_err(|_| CollectorError::new(CollectorKind::System, "probe lock poisoned"))?;
            Ok::<_, CollectorError>(snapshot(&mut probes))
        })
        .await
        .map_err(|e| CollectorError::new(CollectorKind::System, e.to_string()))??;

        Ok(Sample::new(CollectorKind::System, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_handles_zero_total() {
        assert_eq!(percent(10, 0), 0.0);
        assert!((percent(25, 100) - 25.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_collect_reports_resource_fields() {
        let mut collector = SystemCollector::new();
        let sample = collector.collect().await.unwrap();

        assert_eq!(sample.source(), CollectorKind::System);
        let payload = sample.payload();
        for field in ["cpu", "ram", "disk", "network", "load", "uptime_secs"] {
            assert!(payload.contains_key(field), "missing {field}");
        }
        let ram = &payload["ram"];
        assert!(ram["percent"].as_f64().unwrap() >= 0.0);
    }
}
