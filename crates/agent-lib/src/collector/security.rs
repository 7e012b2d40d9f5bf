//! Security collector
//!
//! Each tick gathers suspicious auth log lines since the previous tick, the
//! listening sockets, established connections and processes whose name
//! matches a known miner/backdoor list.

use super::procnet;
use super::tail::LogTail;
use super::Collector;
use crate::error::CollectorError;
use crate::models::{CollectorKind, Payload, Sample};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use sysinfo::System;
use tracing::{debug, warn};

/// Upper bound on established connections reported per tick
const MAX_CONNECTIONS: usize = 200;

const AUTH_PATTERNS: &[&str] = &[
    r"Failed password for .* from",
    r"Invalid user .* from",
    r"authentication failure",
    r"POSSIBLE BREAK-IN ATTEMPT",
    r"refused connect from",
    r"pam_unix\(sshd:auth\): authentication failure",
];

fn auth_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        AUTH_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("auth pattern is valid"))
            .collect()
    })
}

/// Pattern matched by `line`, if any
pub fn match_auth_line(line: &str) -> Option<&'static str> {
    auth_patterns()
        .iter()
        .zip(AUTH_PATTERNS)
        .find(|(re, _)| re.is_match(line))
        .map(|(_, pattern)| *pattern)
}

pub struct SecurityCollector {
    tails: Vec<LogTail>,
    proc_net_root: PathBuf,
    suspicious_names: Vec<String>,
    max_lines: usize,
    system: Option<Arc<Mutex<System>>>,
    primed: bool,
}

impl SecurityCollector {
    pub fn new(
        auth_logs: Vec<PathBuf>,
        proc_net_root: impl Into<PathBuf>,
        suspicious_names: Vec<String>,
        max_lines: usize,
    ) -> Self {
        Self {
            tails: auth_logs.into_iter().map(LogTail::new).collect(),
            proc_net_root: proc_net_root.into(),
            suspicious_names: suspicious_names
                .into_iter()
                .map(|n| n.to_lowercase())
                .collect(),
            max_lines,
            system: Some(Arc::new(Mutex::new(System::new()))),
            primed: false,
        }
    }

    /// Disable the process table scan
    pub fn without_process_scan(mut self) -> Self {
        self.system = None;
        self
    }

    async fn suspicious_logins(&mut self) -> Vec<Value> {
        let mut found = Vec::new();
        for tail in &mut self.tails {
            let lines = match tail.read_new_lines(self.max_lines).await {
                Ok(lines) => lines,
                Err(e) => {
                    debug!(path = %tail.path().display(), error = %e, "Skipping auth log");
                    continue;
                }
            };
            for line in lines {
                if let Some(pattern) = match_auth_line(&line) {
                    found.push(json!({
                        "log_file": tail.path().display().to_string(),
                        "entry": line,
                        "pattern": pattern,
                    }));
                }
            }
        }
        found
    }

    async fn sockets(&self) -> (Vec<Value>, Vec<Value>) {
        let entries = match procnet::read_tables(&self.proc_net_root).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "Connection tables unavailable");
                return (Vec::new(), Vec::new());
            }
        };

        let mut open_ports: Vec<Value> = Vec::new();
        let mut connections = Vec::new();
        for entry in &entries {
            if entry.is_listening() {
                open_ports.push(json!({
                    "port": entry.local.port(),
                    "address": entry.local.to_string(),
                    "protocol": entry.protocol.as_str(),
                }));
            } else if entry.is_established() && connections.len() < MAX_CONNECTIONS {
                connections.push(json!({
                    "local": entry.local.to_string(),
                    "remote": entry.remote.to_string(),
                    "remote_ip": entry.remote.ip().to_string(),
                    "local_port": entry.local.port(),
                    "remote_port": entry.remote.port(),
                }));
            }
        }
        open_ports.dedup_by(|a, b| a["port"] == b["port"] && a["protocol"] == b["protocol"]);
        (open_ports, connections)
    }

    async fn suspicious_processes(&self) -> Result<Vec<Value>, CollectorError> {
        let Some(system) = self.system.clone() else {
            return Ok(Vec::new());
        };
        let names = self.suspicious_names.clone();

        tokio::task::spawn_blocking(move || {
            let mut system = system.lock().map_err(|_| {
                CollectorError::new(CollectorKind::Security, "process table lock poisoned")
            })?;
            system.refresh_processes();

            let matches: Vec<Value> = system
                .processes()
                .iter()
                .filter_map(|(pid, process)| {
                    let name = process.name().to_lowercase();
                    names.iter().find(|n| name.contains(n.as_str())).map(|n| {
                        json!({
                            "pid": pid.as_u32(),
                            "name": process.name(),
                            "matched": n,
                            "cmd": process.cmd().join(" "),
                        })
                    })
                })
                .collect();
            Ok(matches)
        })
        .await
        .map_err(|e| CollectorError::new(CollectorKind::Security, e.to_string()))?
    }
}

#[async_trait]
impl Collector for SecurityCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Security
    }

    async fn collect(&mut self) -> Result<Sample, CollectorError> {
        if !self.primed {
            for tail in &mut self.tails {
                tail.prime().await;
            }
            self.primed = true;
        }

        let logins = self.suspicious_logins().await;
        let (open_ports, connections) = self.sockets().await;
        let processes = self.suspicious_processes().await?;

        let total_suspicious = logins.len() + processes.len();
        if total_suspicious > 0 {
            warn!(
                collector = %CollectorKind::Security,
                suspicious = total_suspicious,
                "Suspicious security activity collected"
            );
        }

        let mut payload = Payload::new();
        payload.insert("suspicious_logins".into(), Value::Array(logins));
        payload.insert("open_ports".into(), Value::Array(open_ports));
        payload.insert("active_connections".into(), Value::Array(connections));
        payload.insert("suspicious_processes".into(), Value::Array(processes));
        payload.insert("total_suspicious".into(), Value::from(total_suspicious));

        Ok(Sample::new(CollectorKind::Security, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_match_auth_line() {
        assert_eq!(
            match_auth_line("sshd[1]: Failed password for admin from 203.0.113.9 port 22 ssh2"),
            Some(r"Failed password for .* from")
        );
        assert_eq!(
            match_auth_line("sshd[1]: reverse mapping checking getaddrinfo - POSSIBLE BREAK-IN ATTEMPT!"),
            Some(r"POSSIBLE BREAK-IN ATTEMPT")
        );
        assert_eq!(match_auth_line("sshd[1]: Accepted publickey for deploy"), None);
    }

    #[tokio::test]
    async fn test_collect_reports_new_suspicious_lines_and_ports() {
        let dir = tempfile::tempdir().unwrap();
        let auth = dir.path().join("auth.log");
        std::fs::write(&auth, "Failed password for old from 1.1.1.1 port 1 ssh2\n").unwrap();
        let net = dir.path().join("net");
        std::fs::create_dir(&net).unwrap();
        std::fs::write(
            net.join("tcp"),
            "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1 1 0 100 0 0 10 0
   1: 0F02000A:0016 0302000A:D431 01 00000000:00000000 00:00000000 00000000     0        0 2 1 0 20 4 30 10 -1
",
        )
        .unwrap();

        let mut collector =
            SecurityCollector::new(vec![auth.clone()], &net, vec![], 1000).without_process_scan();

        let first = collector.collect().await.unwrap();
        assert!(first.get_array("suspicious_logins").is_empty());

        let mut file = std::fs::OpenOptions::new().append(true).open(&auth).unwrap();
        writeln!(file, "sshd[9]: Invalid user oracle from 198.51.100.7 port 5000").unwrap();
        writeln!(file, "sshd[9]: session opened for user deploy").unwrap();

        let sample = collector.collect().await.unwrap();
        let logins = sample.get_array("suspicious_logins");
        assert_eq!(logins.len(), 1);
        assert!(logins[0]["entry"].as_str().unwrap().contains("198.51.100.7"));
        assert_eq!(sample.get_f64("total_suspicious"), Some(1.0));

        let ports = sample.get_array("open_ports");
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0]["port"], 22);
        assert_eq!(sample.get_array("active_connections")[0]["remote_ip"], "10.0.2.3");
    }
}
