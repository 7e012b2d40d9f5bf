//! Core data models for the security agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Field -> value mapping carried by samples and findings
pub type Payload = BTreeMap<String, Value>;

/// Data source a collector reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectorKind {
    System,
    NetworkTraffic,
    Security,
    LogTail,
}

impl CollectorKind {
    pub const ALL: [CollectorKind; 4] = [
        CollectorKind::System,
        CollectorKind::NetworkTraffic,
        CollectorKind::Security,
        CollectorKind::LogTail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorKind::System => "system",
            CollectorKind::NetworkTraffic => "network-traffic",
            CollectorKind::Security => "security",
            CollectorKind::LogTail => "log-tail",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a produced sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleId(Uuid);

impl SampleId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One collector invocation's output. Fields are private so a sample cannot
/// change after it has been handed to analyzers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    id: SampleId,
    source: CollectorKind,
    timestamp: DateTime<Utc>,
    payload: Payload,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    truncated: bool,
}

impl Sample {
    pub fn new(source: CollectorKind, payload: Payload) -> Self {
        Self::at(source, Utc::now(), payload)
    }

    pub fn at(source: CollectorKind, timestamp: DateTime<Utc>, payload: Payload) -> Self {
        Self {
            id: SampleId::generate(),
            source,
            timestamp,
            payload,
            truncated: false,
        }
    }

    /// Mark the collection window as cut short
    pub fn truncated(mut self) -> Self {
        self.truncated = true;
        self
    }

    pub fn id(&self) -> SampleId {
        self.id
    }

    pub fn source(&self) -> CollectorKind {
        self.source
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.payload.get(field).and_then(Value::as_f64)
    }

    /// Numeric value at a dotted path such as `cpu.percent`
    pub fn get_path_f64(&self, path: &str) -> Option<f64> {
        let mut parts = path.split('.');
        let first = self.payload.get(parts.next()?)?;
        parts
            .try_fold(first, |value, key| value.get(key))
            .and_then(Value::as_f64)
    }

    pub fn get_array(&self, field: &str) -> &[Value] {
        self.payload
            .get(field)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get_bool(&self, field: &str) -> bool {
        self.payload
            .get(field)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Anomaly,
    SecurityEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomaly or security event derived from a sample
///
/// A finding can only be built from a reference to the sample it was
/// derived from, and it keeps that sample's id rather than the sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    kind: FindingKind,
    severity: Severity,
    timestamp: DateTime<Utc>,
    sample_id: SampleId,
    source: CollectorKind,
    analyzer: &'static str,
    rule: String,
    description: String,
    evidence: Payload,
}

impl Finding {
    pub fn new(
        kind: FindingKind,
        severity: Severity,
        sample: &Sample,
        analyzer: &'static str,
        rule: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            timestamp: sample.timestamp(),
            sample_id: sample.id(),
            source: sample.source(),
            analyzer,
            rule: rule.into(),
            description: description.into(),
            evidence: Payload::new(),
        }
    }

    pub fn with_evidence(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.evidence.insert(key.to_string(), value.into());
        self
    }

    pub fn kind(&self) -> FindingKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn sample_id(&self) -> SampleId {
        self.sample_id
    }

    pub fn analyzer(&self) -> &'static str {
        self.analyzer
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn evidence(&self) -> &Payload {
        &self.evidence
    }
}
