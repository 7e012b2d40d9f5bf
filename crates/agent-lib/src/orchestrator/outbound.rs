//! Outbound buffer between the pipeline and the transport
//!
//! Holds everything that waits for the next batch flush. When the hard cap
//! is exceeded, entries are dropped oldest first in this order: samples,
//! forwarded logs, then low-value anomalies. Security findings live in a
//! separate queue bounded only by a much larger memory ceiling; crossing it
//! drops the single oldest finding with a warning.

use crate::config::PipelineSettings;
use crate::models::{CollectorKind, Finding, FindingKind, Sample, Severity};
use crate::observability::{AgentMetrics, ForwardedLog};
use crate::proto::{events, sample_event, MessageType, Outgoing};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// Buffer occupancy, for the shutdown report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub samples: usize,
    pub logs: usize,
    pub anomalies: usize,
    pub protected: usize,
}

impl BufferStats {
    pub fn total(&self) -> usize {
        self.samples + self.logs + self.anomalies + self.protected
    }
}

pub struct OutboundBuffer {
    samples: VecDeque<Sample>,
    logs: VecDeque<ForwardedLog>,
    anomalies: VecDeque<Finding>,
    /// Security events and critical findings
    protected: VecDeque<Finding>,
    max_entries: usize,
    max_findings: usize,
    /// Set while the cap is being enforced, to warn once per overflow
    overflowing: bool,
    metrics: AgentMetrics,
}

impl OutboundBuffer {
    pub fn new(settings: &PipelineSettings, metrics: AgentMetrics) -> Self {
        Self {
            samples: VecDeque::new(),
            logs: VecDeque::new(),
            anomalies: VecDeque::new(),
            protected: VecDeque::new(),
            max_entries: settings.buffer_max_entries.max(1),
            max_findings: settings.buffer_max_findings.max(1),
            overflowing: false,
            metrics,
        }
    }

    pub fn push_sample(&mut self, sample: Sample) {
        self.samples.push_back(sample);
        self.enforce_cap();
    }

    pub fn push_log(&mut self, log: ForwardedLog) {
        self.logs.push_back(log);
        self.enforce_cap();
    }

    pub fn push_finding(&mut self, finding: Finding) {
        if is_protected(&finding) {
            self.protected.push_back(finding);
            self.enforce_ceiling();
        } else {
            self.anomalies.push_back(finding);
            self.enforce_cap();
        }
        self.publish();
    }

    /// Take every buffered finding, oldest first
    pub fn take_findings(&mut self) -> Vec<Finding> {
        let mut findings: Vec<Finding> = self
            .protected
            .drain(..)
            .chain(self.anomalies.drain(..))
            .collect();
        findings.sort_by_key(Finding::timestamp);
        self.publish();
        findings
    }

    /// Put back findings the transport refused
    ///
    /// They go ahead of anything buffered since, and the usual bounds
    /// apply, so a long refusal still drops the oldest first.
    pub fn restore_findings(&mut self, findings: Vec<Finding>) {
        for finding in findings.into_iter().rev() {
            if is_protected(&finding) {
                self.protected.push_front(finding);
            } else {
                self.anomalies.push_front(finding);
            }
        }
        self.enforce_ceiling();
        self.enforce_cap();
    }

    fn enforce_ceiling(&mut self) {
        while self.protected.len() > self.max_findings {
            if let Some(dropped) = self.protected.pop_front() {
                warn!(
                    rule = %dropped.rule(),
                    severity = %dropped.severity(),
                    sample_id = %dropped.sample_id(),
                    ceiling = self.max_findings,
                    "Finding ceiling reached, dropping oldest security finding"
                );
                self.metrics.inc_entries_dropped("finding");
            }
        }
    }

    /// Entries subject to the hard cap
    fn lossy_len(&self) -> usize {
        self.samples.len() + self.logs.len() + self.anomalies.len()
    }

    fn enforce_cap(&mut self) {
        while self.lossy_len() > self.max_entries {
            let entry = if self.samples.pop_front().is_some() {
                "sample"
            } else if self.logs.pop_front().is_some() {
                "log"
            } else if self.anomalies.pop_front().is_some() {
                "anomaly"
            } else {
                break;
            };

            if !self.overflowing {
                self.overflowing = true;
                warn!(
                    cap = self.max_entries,
                    "Outbound buffer full, dropping oldest entries"
                );
            }
            debug!(entry, "Dropped buffered entry");
            self.metrics.inc_entries_dropped(entry);
        }
        self.publish();
    }

    fn publish(&self) {
        self.metrics.set_outbound_buffer(self.len());
    }

    pub fn len(&self) -> usize {
        self.lossy_len() + self.protected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            samples: self.samples.len(),
            logs: self.logs.len(),
            anomalies: self.anomalies.len(),
            protected: self.protected.len(),
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.protected.iter().chain(self.anomalies.iter())
    }

    /// Empty samples and logs into wire messages
    ///
    /// One message per collector kind, then forwarded logs, each paired
    /// with the entries it carries. Findings stay put; see
    /// [`take_findings`](Self::take_findings).
    pub fn drain_batches(&mut self) -> Vec<(Outgoing, usize)> {
        let mut by_kind: BTreeMap<CollectorKind, Vec<Sample>> = BTreeMap::new();
        for sample in self.samples.drain(..) {
            by_kind.entry(sample.source()).or_default().push(sample);
        }
        let mut batches: Vec<(Outgoing, usize)> = by_kind
            .into_iter()
            .map(|(kind, samples)| (samples_message(kind, &samples), samples.len()))
            .collect();

        if !self.logs.is_empty() {
            let logs: Vec<ForwardedLog> = self.logs.drain(..).collect();
            let entries = logs.len();
            batches.push((
                Outgoing::new(
                    MessageType::Log,
                    events::LOGS,
                    json!({ "source": "agent", "entries": logs }),
                ),
                entries,
            ));
        }

        self.overflowing = false;
        self.publish();
        batches
    }
}

/// Findings that the cap never drops
fn is_protected(finding: &Finding) -> bool {
    finding.kind() == FindingKind::SecurityEvent || finding.severity() == Severity::Critical
}

fn sample_message_type(kind: CollectorKind) -> MessageType {
    match kind {
        CollectorKind::System | CollectorKind::NetworkTraffic => MessageType::Metrics,
        CollectorKind::Security => MessageType::Event,
        CollectorKind::LogTail => MessageType::Log,
    }
}

pub fn samples_message(kind: CollectorKind, samples: &[Sample]) -> Outgoing {
    Outgoing::new(
        sample_message_type(kind),
        sample_event(kind),
        json!({ "collector": kind, "samples": samples }),
    )
}

/// One alert carrying `findings`; urgent when any of them is critical
pub fn alert_message(findings: &[Finding]) -> Outgoing {
    let severity = findings
        .iter()
        .map(Finding::severity)
        .max()
        .unwrap_or(Severity::Low);
    let message = Outgoing::new(
        MessageType::Event,
        events::ALERT,
        json!({ "severity": severity, "findings": findings }),
    );
    if severity == Severity::Critical {
        message.urgent()
    } else {
        message
    }
}

/// Whether a sample goes out with the next batch
///
/// Log-tail windows are shipped only when they carry warnings or errors,
/// unless every log line is requested. Empty windows never are.
pub fn should_forward(sample: &Sample, send_all_logs: bool) -> bool {
    if sample.source() != CollectorKind::LogTail {
        return true;
    }
    if sample.get_array("entries").is_empty() {
        return false;
    }
    send_all_logs || sample.get_bool("has_errors") || sample.get_bool("has_warnings")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Payload;
    use chrono::{DateTime, Utc};
    use serde_json::Value;

    fn settings(max_entries: usize, max_findings: usize) -> PipelineSettings {
        PipelineSettings {
            buffer_max_entries: max_entries,
            buffer_max_findings: max_findings,
            ..Default::default()
        }
    }

    fn sample(n: u64) -> Sample {
        let mut payload = Payload::new();
        payload.insert("n".into(), Value::from(n));
        Sample::new(CollectorKind::System, payload)
    }

    /// Finding raised `n` seconds into the test
    fn finding(kind: FindingKind, severity: Severity, n: u64) -> Finding {
        let mut payload = Payload::new();
        payload.insert("n".into(), Value::from(n));
        let at = DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(n as i64);
        let sample = Sample::at(CollectorKind::System, at, payload);
        Finding::new(kind, severity, &sample, "test", format!("rule_{n}"), "test finding")
    }

    fn log(message: &str) -> ForwardedLog {
        ForwardedLog {
            timestamp: Utc::now(),
            level: "WARN".into(),
            target: "secspot_lib::collector".into(),
            message: message.into(),
            fields: Default::default(),
        }
    }

    fn sample_numbers(buffer: &OutboundBuffer) -> Vec<u64> {
        buffer
            .samples()
            .filter_map(|s| s.get("n").and_then(Value::as_u64))
            .collect()
    }

    #[test]
    fn test_overflow_drops_oldest_samples() {
        let mut buffer = OutboundBuffer::new(&settings(10, 100), AgentMetrics::new());
        for n in 0..15 {
            buffer.push_sample(sample(n));
        }

        assert_eq!(buffer.len(), 10);
        assert_eq!(sample_numbers(&buffer), (5..15).collect::<Vec<_>>());
    }

    #[test]
    fn test_samples_go_before_logs_and_anomalies() {
        let mut buffer = OutboundBuffer::new(&settings(3, 100), AgentMetrics::new());
        buffer.push_finding(finding(FindingKind::Anomaly, Severity::Medium, 0));
        buffer.push_log(log("disk slow"));
        buffer.push_sample(sample(1));
        buffer.push_sample(sample(2));

        let stats = buffer.stats();
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.logs, 1);
        assert_eq!(stats.anomalies, 1);

        buffer.push_log(log("disk slower"));
        buffer.push_log(log("disk gone"));
        let stats = buffer.stats();
        assert_eq!(stats.samples, 0);
        assert_eq!(stats.logs, 2);
        assert_eq!(stats.anomalies, 1);
    }

    #[test]
    fn test_security_findings_survive_overflow() {
        let mut buffer = OutboundBuffer::new(&settings(2, 100), AgentMetrics::new());
        buffer.push_finding(finding(FindingKind::SecurityEvent, Severity::High, 0));
        buffer.push_finding(finding(FindingKind::Anomaly, Severity::Critical, 1));
        for n in 0..10 {
            buffer.push_sample(sample(n));
        }

        let stats = buffer.stats();
        assert_eq!(stats.protected, 2);
        assert_eq!(stats.samples, 2);
        assert_eq!(buffer.findings().count(), 2);
    }

    #[test]
    fn test_finding_ceiling_drops_only_oldest() {
        let mut buffer = OutboundBuffer::new(&settings(10, 3), AgentMetrics::new());
        for n in 0..4 {
            buffer.push_finding(finding(FindingKind::SecurityEvent, Severity::High, n));
        }

        let rules: Vec<&str> = buffer.findings().map(Finding::rule).collect();
        assert_eq!(rules, vec!["rule_1", "rule_2", "rule_3"]);
    }

    #[test]
    fn test_drain_builds_batches() {
        let mut buffer = OutboundBuffer::new(&settings(10, 10), AgentMetrics::new());
        buffer.push_sample(sample(0));
        buffer.push_sample(Sample::new(CollectorKind::Security, Payload::new()));
        buffer.push_sample(sample(1));
        buffer.push_finding(finding(FindingKind::SecurityEvent, Severity::High, 2));
        buffer.push_log(log("collector degraded"));

        let batches = buffer.drain_batches();
        assert_eq!(buffer.len(), 1);

        let names: Vec<&str> = batches.iter().map(|(m, _)| m.event).collect();
        assert_eq!(
            names,
            vec![
                events::RESOURCE_MONITORING,
                events::SECURITY_EVENTS,
                events::LOGS
            ]
        );
        let entries: Vec<usize> = batches.iter().map(|(_, n)| *n).collect();
        assert_eq!(entries, vec![2, 1, 1]);
        assert_eq!(batches[0].0.body["samples"][1]["payload"]["n"], 1);
        assert_eq!(batches[1].0.message_type, MessageType::Event);
        assert_eq!(batches[2].0.body["entries"][0]["message"], "collector degraded");

        let findings = buffer.take_findings();
        assert!(buffer.is_empty());
        let alert = alert_message(&findings);
        assert_eq!(alert.event, events::ALERT);
        assert_eq!(alert.body["severity"], "high");
        assert!(!alert.is_urgent());
    }

    #[test]
    fn test_critical_alert_is_urgent() {
        let findings = vec![
            finding(FindingKind::Anomaly, Severity::Medium, 0),
            finding(FindingKind::SecurityEvent, Severity::Critical, 1),
        ];
        let alert = alert_message(&findings);
        assert_eq!(alert.body["severity"], "critical");
        assert!(alert.is_urgent());
    }

    #[test]
    fn test_restored_findings_keep_order_and_ceiling() {
        let mut buffer = OutboundBuffer::new(&settings(10, 3), AgentMetrics::new());
        buffer.push_finding(finding(FindingKind::SecurityEvent, Severity::High, 0));
        buffer.push_finding(finding(FindingKind::Anomaly, Severity::Low, 1));
        buffer.push_finding(finding(FindingKind::SecurityEvent, Severity::High, 2));

        let refused = buffer.take_findings();
        assert_eq!(refused.len(), 3);
        assert!(buffer.is_empty());

        // two more arrive while the refused alert is handled
        buffer.push_finding(finding(FindingKind::SecurityEvent, Severity::High, 3));
        buffer.push_finding(finding(FindingKind::SecurityEvent, Severity::High, 4));
        buffer.restore_findings(refused);

        let stats = buffer.stats();
        assert_eq!(stats.anomalies, 1);
        assert_eq!(stats.protected, 3);
        let findings = buffer.take_findings();
        let rules: Vec<&str> = findings.iter().map(Finding::rule).collect();
        assert_eq!(rules, vec!["rule_1", "rule_2", "rule_3", "rule_4"]);
    }

    #[test]
    fn test_log_windows_filtered() {
        let mut payload = Payload::new();
        payload.insert("entries".into(), json!([{ "severity": "info", "content": "ok" }]));
        payload.insert("has_errors".into(), Value::Bool(false));
        payload.insert("has_warnings".into(), Value::Bool(false));
        let quiet = Sample::new(CollectorKind::LogTail, payload.clone());

        payload.insert("has_warnings".into(), Value::Bool(true));
        let noisy = Sample::new(CollectorKind::LogTail, payload);

        let empty = Sample::new(CollectorKind::LogTail, Payload::new());

        assert!(!should_forward(&quiet, false));
        assert!(should_forward(&quiet, true));
        assert!(should_forward(&noisy, false));
        assert!(!should_forward(&empty, true));
        assert!(should_forward(&sample(0), false));
    }
}
