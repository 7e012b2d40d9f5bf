//! Log-tail collector with severity classification

use super::tail::LogTail;
use super::Collector;
use crate::config::LogFile;
use crate::error::CollectorError;
use crate::models::{CollectorKind, Payload, Sample};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
    Error,
    Warning,
    Info,
}

impl LogSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSeverity::Error => "error",
            LogSeverity::Warning => "warning",
            LogSeverity::Info => "info",
        }
    }
}

struct SeverityPatterns {
    error: Vec<Regex>,
    warning: Vec<Regex>,
}

fn patterns() -> &'static SeverityPatterns {
    static PATTERNS: OnceLock<SeverityPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |list: &[&str]| {
            list.iter()
                .map(|p| Regex::new(p).expect("severity pattern is valid"))
                .collect()
        };
        SeverityPatterns {
            error: compile(&[
                r"\berror\b",
                r"\bfail(ed|ure)\b",
                r"\bcritical\b",
                r"\bemergency\b",
                r"\balert\b",
            ]),
            warning: compile(&[r"\bwarn(ing)?\b", r"\bnotice\b", r"\btimeout\b"]),
        }
    })
}

/// Classify one line; anything that is neither error nor warning is info
pub fn classify(line: &str) -> LogSeverity {
    let lower = line.to_lowercase();
    let p = patterns();
    if p.error.iter().any(|re| re.is_match(&lower)) {
        LogSeverity::Error
    } else if p.warning.iter().any(|re| re.is_match(&lower)) {
        LogSeverity::Warning
    } else {
        LogSeverity::Info
    }
}

pub struct LogTailCollector {
    files: Vec<(LogFile, LogTail)>,
    max_lines: usize,
    primed: bool,
}

impl LogTailCollector {
    pub fn new(files: Vec<LogFile>, max_lines: usize) -> Self {
        let files = files
            .into_iter()
            .map(|file| {
                let tail = LogTail::new(&file.path);
                (file, tail)
            })
            .collect();
        Self {
            files,
            max_lines,
            primed: false,
        }
    }

    /// Anchor every tail at its current end of file
    pub async fn prime(&mut self) {
        for (_, tail) in &mut self.files {
            tail.prime().await;
        }
        self.primed = true;
    }
}

#[async_trait]
impl Collector for LogTailCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::LogTail
    }

    async fn collect(&mut self) -> Result<Sample, CollectorError> {
        if !self.primed {
            self.prime().await;
        }

        let mut entries = Vec::new();
        let mut by_severity: BTreeMap<&'static str, u64> = BTreeMap::new();
        let mut by_category: BTreeMap<String, u64> = BTreeMap::new();
        let mut budget = self.max_lines;

        for (file, tail) in &mut self.files {
            if budget == 0 {
                break;
            }
            let lines = match tail.read_new_lines(budget).await {
                Ok(lines) => lines,
                Err(e) => {
                    debug!(path = %file.path.display(), error = %e, "Skipping unreadable log file");
                    continue;
                }
            };
            budget -= lines.len();

            for line in lines {
                let severity = classify(&line);
                *by_severity.entry(severity.as_str()).or_default() += 1;
                *by_category.entry(file.category.clone()).or_default() += 1;
                entries.push(json!({
                    "file": file.path.display().to_string(),
                    "category": file.category,
                    "severity": severity.as_str(),
                    "content": line,
                }));
            }
        }

        let errors = by_severity.get("error").copied().unwrap_or(0);
        let warnings = by_severity.get("warning").copied().unwrap_or(0);
        let importance = if errors > 0 {
            "high"
        } else if warnings > 0 {
            "medium"
        } else {
            "low"
        };

        let mut payload = Payload::new();
        payload.insert(
            "stats".into(),
            json!({
                "total": entries.len(),
                "by_severity": by_severity,
                "by_category": by_category,
            }),
        );
        payload.insert("entries".into(), Value::Array(entries));
        payload.insert("has_errors".into(), Value::Bool(errors > 0));
        payload.insert("has_warnings".into(), Value::Bool(warnings > 0));
        payload.insert("importance".into(), Value::from(importance));

        Ok(Sample::new(CollectorKind::LogTail, payload))
    }
}
