//! Threat detection over security and network-traffic samples
//!
//! Time windows are driven by sample timestamps rather than the wall clock,
//! so a replayed sample history always yields the same findings. Counting
//! rules fire once when their count crosses the threshold and can fire
//! again only after the window has drained below it.

use super::Analyzer;
use crate::config::SecurityAnalyzerSettings;
use crate::error::AnalyzerError;
use crate::models::{CollectorKind, Finding, FindingKind, Sample, Severity};
use chrono::{DateTime, Duration as TimeDelta, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

const NAME: &str = "security";

fn failed_login() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:Failed password for (?:invalid user )?|Invalid user )(\S+) from (\S+)")
            .expect("failed login pattern is valid")
    })
}

fn pam_failure() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"authentication failure;.*rhost=(\S+)(?:\s+user=(\S+))?")
            .expect("pam failure pattern is valid")
    })
}

/// User and source address of a failed login line
fn parse_failed_login(line: &str) -> Option<(Option<String>, String)> {
    if let Some(caps) = failed_login().captures(line) {
        return Some((Some(caps[1].to_string()), caps[2].to_string()));
    }
    pam_failure().captures(line).map(|caps| {
        (
            caps.get(2).map(|m| m.as_str().to_string()),
            caps[1].to_string(),
        )
    })
}

fn to_delta(window: Duration) -> TimeDelta {
    TimeDelta::from_std(window).unwrap_or_else(|_| TimeDelta::days(365))
}

/// Per-key event timestamps inside a sliding window
#[derive(Debug)]
struct EventWindow {
    span: TimeDelta,
    threshold: usize,
    events: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl EventWindow {
    fn new(span: Duration, threshold: usize) -> Self {
        Self {
            span: to_delta(span),
            threshold: threshold.max(1),
            events: HashMap::new(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.span;
        self.events.retain(|_, times| {
            while times.front().is_some_and(|t| *t < cutoff) {
                times.pop_front();
            }
            !times.is_empty()
        });
    }

    /// Record one event; returns the count when this event crossed the
    /// threshold
    fn record(&mut self, key: &str, at: DateTime<Utc>) -> Option<usize> {
        let times = self.events.entry(key.to_string()).or_default();
        let before = times.len();
        times.push_back(at);
        (before < self.threshold && times.len() >= self.threshold).then_some(times.len())
    }
}

/// Distinct local ports touched per remote address
#[derive(Debug)]
struct PortScanWindow {
    span: TimeDelta,
    threshold: usize,
    touches: HashMap<IpAddr, VecDeque<(DateTime<Utc>, u16)>>,
}

impl PortScanWindow {
    fn new(span: Duration, threshold: usize) -> Self {
        Self {
            span: to_delta(span),
            threshold: threshold.max(1),
            touches: HashMap::new(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.span;
        self.touches.retain(|_, touches| {
            while touches.front().is_some_and(|(t, _)| *t < cutoff) {
                touches.pop_front();
            }
            !touches.is_empty()
        });
    }

    fn distinct(touches: &VecDeque<(DateTime<Utc>, u16)>) -> BTreeSet<u16> {
        touches.iter().map(|(_, port)| *port).collect()
    }

    /// Record a touch; returns the ports when the remote crossed the
    /// threshold
    fn record(&mut self, remote: IpAddr, port: u16, at: DateTime<Utc>) -> Option<BTreeSet<u16>> {
        let touches = self.touches.entry(remote).or_default();
        let before = Self::distinct(touches).len();
        touches.push_back((at, port));
        let after = Self::distinct(touches);
        (before < self.threshold && after.len() >= self.threshold).then_some(after)
    }
}

pub struct SecurityAnalyzer {
    by_ip: EventWindow,
    by_user: EventWindow,
    scans: PortScanWindow,
    ignored_users: HashSet<String>,
    /// `None` until the first security sample
    known_ports: Option<BTreeSet<(String, u64)>>,
    reported_processes: HashSet<(u64, String)>,
}

impl SecurityAnalyzer {
    pub fn new(settings: SecurityAnalyzerSettings) -> Self {
        Self {
            by_ip: EventWindow::new(settings.ip_window, settings.ip_threshold),
            by_user: EventWindow::new(settings.user_window, settings.user_threshold),
            scans: PortScanWindow::new(settings.scan_window, settings.scan_threshold),
            ignored_users: settings.ignored_users.into_iter().collect(),
            known_ports: None,
            reported_processes: HashSet::new(),
        }
    }

    fn security_event(
        sample: &Sample,
        severity: Severity,
        rule: &str,
        description: String,
    ) -> Finding {
        Finding::new(
            FindingKind::SecurityEvent,
            severity,
            sample,
            NAME,
            rule,
            description,
        )
    }

    fn check_logins(&mut self, sample: &Sample, findings: &mut Vec<Finding>) {
        let at = sample.timestamp();
        for login in sample.get_array("suspicious_logins") {
            let Some(entry) = login.get("entry").and_then(Value::as_str) else {
                continue;
            };

            if entry.contains("POSSIBLE BREAK-IN ATTEMPT") {
                findings.push(
                    Self::security_event(
                        sample,
                        Severity::Critical,
                        "possible_break_in",
                        "Possible break-in attempt reported by sshd".to_string(),
                    )
                    .with_evidence("entry", entry),
                );
            }

            let Some((user, ip)) = parse_failed_login(entry) else {
                continue;
            };

            if let Some(count) = self.by_ip.record(&ip, at) {
                findings.push(
                    Self::security_event(
                        sample,
                        Severity::High,
                        "brute_force_ip",
                        format!("{count} failed logins from {ip}"),
                    )
                    .with_evidence("ip", ip.as_str())
                    .with_evidence("attempts", count)
                    .with_evidence("window_secs", self.by_ip.span.num_seconds()),
                );
            }

            let Some(user) = user.filter(|u| !self.ignored_users.contains(u)) else {
                continue;
            };
            if let Some(count) = self.by_user.record(&user, at) {
                findings.push(
                    Self::security_event(
                        sample,
                        Severity::High,
                        "brute_force_user",
                        format!("{count} failed logins for user {user}"),
                    )
                    .with_evidence("user", user.as_str())
                    .with_evidence("attempts", count)
                    .with_evidence("window_secs", self.by_user.span.num_seconds()),
                );
            }
        }
    }

    fn check_scans<'a>(
        &mut self,
        sample: &Sample,
        touches: impl Iterator<Item = (&'a str, u64)>,
        findings: &mut Vec<Finding>,
    ) {
        for (remote, port) in touches {
            let Ok(ip) = remote.parse::<IpAddr>() else {
                continue;
            };
            if ip.is_loopback() || ip.is_unspecified() {
                continue;
            }
            let Ok(port) = u16::try_from(port) else {
                continue;
            };
            if let Some(ports) = self.scans.record(ip, port, sample.timestamp()) {
                findings.push(
                    Self::security_event(
                        sample,
                        Severity::High,
                        "port_scan",
                        format!("{ip} touched {} distinct local ports", ports.len()),
                    )
                    .with_evidence("remote_ip", ip.to_string())
                    .with_evidence("ports", ports.into_iter().collect::<Vec<_>>())
                    .with_evidence("window_secs", self.scans.span.num_seconds()),
                );
            }
        }
    }

    fn check_ports(&mut self, sample: &Sample, findings: &mut Vec<Finding>) {
        let current: BTreeSet<(String, u64)> = sample
            .get_array("open_ports")
            .iter()
            .filter_map(|p| {
                let port = p.get("port")?.as_u64()?;
                let protocol = p.get("protocol").and_then(Value::as_str).unwrap_or("tcp");
                Some((protocol.to_string(), port))
            })
            .collect();

        if let Some(known) = &self.known_ports {
            for (protocol, port) in current.difference(known) {
                findings.push(
                    Self::security_event(
                        sample,
                        Severity::Medium,
                        "new_listening_port",
                        format!("New listening port {port}/{protocol}"),
                    )
                    .with_evidence("port", *port)
                    .with_evidence("protocol", protocol.as_str()),
                );
            }
        }
        self.known_ports = Some(current);
    }

    /// Report each running `(pid, name)` once; forget it when it exits
    fn check_processes(&mut self, sample: &Sample, findings: &mut Vec<Finding>) {
        let mut running = HashSet::new();
        for process in sample.get_array("suspicious_processes") {
            let pid = process.get("pid").and_then(Value::as_u64).unwrap_or(0);
            let name = process
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if !running.insert((pid, name.clone())) {
                continue;
            }
            if self.reported_processes.contains(&(pid, name.clone())) {
                continue;
            }
            findings.push(
                Self::security_event(
                    sample,
                    Severity::Critical,
                    "suspicious_process",
                    format!("Suspicious process {name} (pid {pid})"),
                )
                .with_evidence("pid", pid)
                .with_evidence("name", name)
                .with_evidence("cmd", process.get("cmd").cloned().unwrap_or(Value::Null)),
            );
        }
        self.reported_processes = running;
    }
}

impl Analyzer for SecurityAnalyzer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn accepts(&self, kind: CollectorKind) -> bool {
        matches!(kind, CollectorKind::Security | CollectorKind::NetworkTraffic)
    }

    fn analyze(&mut self, sample: &Sample) -> Result<Vec<Finding>, AnalyzerError> {
        let now = sample.timestamp();
        self.by_ip.prune(now);
        self.by_user.prune(now);
        self.scans.prune(now);

        let mut findings = Vec::new();
        match sample.source() {
            CollectorKind::Security => {
                self.check_logins(sample, &mut findings);
                let touches = sample.get_array("active_connections").iter().filter_map(|c| {
                    Some((c.get("remote_ip")?.as_str()?, c.get("local_port")?.as_u64()?))
                });
                self.check_scans(sample, touches, &mut findings);
                self.check_ports(sample, &mut findings);
                self.check_processes(sample, &mut findings);
            }
            CollectorKind::NetworkTraffic => {
                let packets = sample
                    .get("packets")
                    .and_then(Value::as_array)
                    .ok_or_else(|| AnalyzerError::MissingField {
                        field: "packets".to_string(),
                    })?;
                let touches = packets.iter().filter_map(|p| {
                    Some((p.get("to")?.as_str()?, p.get("src_port")?.as_u64()?))
                });
                self.check_scans(sample, touches, &mut findings);
            }
            other => {
                return Err(AnalyzerError::Malformed(format!(
                    "unexpected {other} sample"
                )))
            }
        }
        Ok(findings)
    }
}
