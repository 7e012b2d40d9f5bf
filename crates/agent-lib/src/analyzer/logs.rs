//! Error bursts in tailed logs

use super::Analyzer;
use crate::error::AnalyzerError;
use crate::models::{CollectorKind, Finding, FindingKind, Sample, Severity};
use serde_json::Value;
use std::collections::BTreeSet;

const NAME: &str = "logs";

/// Error lines carried as evidence
const MAX_EVIDENCE_LINES: usize = 10;

/// Error count at which the finding becomes high severity
const HIGH_SEVERITY_ERRORS: usize = 50;

#[derive(Debug, Default)]
pub struct LogAnalyzer;

impl LogAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl Analyzer for LogAnalyzer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn accepts(&self, kind: CollectorKind) -> bool {
        kind == CollectorKind::LogTail
    }

    fn analyze(&mut self, sample: &Sample) -> Result<Vec<Finding>, AnalyzerError> {
        let entries = sample
            .get("entries")
            .and_then(Value::as_array)
            .ok_or_else(|| AnalyzerError::MissingField {
                field: "entries".to_string(),
            })?;

        let errors: Vec<&Value> = entries
            .iter()
            .filter(|e| e.get("severity").and_then(Value::as_str) == Some("error"))
            .collect();
        if errors.is_empty() {
            return Ok(Vec::new());
        }

        let files: BTreeSet<&str> = errors
            .iter()
            .filter_map(|e| e.get("file").and_then(Value::as_str))
            .collect();
        let lines: Vec<&str> = errors
            .iter()
            .filter_map(|e| e.get("content").and_then(Value::as_str))
            .take(MAX_EVIDENCE_LINES)
            .collect();
        let severity = if errors.len() >= HIGH_SEVERITY_ERRORS {
            Severity::High
        } else {
            Severity::Medium
        };

        let finding = Finding::new(
            FindingKind::Anomaly,
            severity,
            sample,
            NAME,
            "log_errors",
            format!("{} error lines in {} log files", errors.len(), files.len()),
        )
        .with_evidence("error_count", errors.len())
        .with_evidence("files", files.into_iter().collect::<Vec<_>>())
        .with_evidence("lines", lines);

        Ok(vec![finding])
    }
}
