//! Resource usage anomaly detection
//!
//! Every tracked field keeps a rolling window of recent values. A value is
//! deviating when it sits more than `multiplier` standard deviations above
//! the window mean; the field's [`Hysteresis`] decides when that becomes an
//! alert. Network counters are cumulative, so their per-tick deltas are
//! tracked instead of the raw values.

use super::hysteresis::{Hysteresis, Transition};
use super::window::RollingWindow;
use super::Analyzer;
use crate::config::MetricsAnalyzerSettings;
use crate::error::AnalyzerError;
use crate::models::{CollectorKind, Finding, FindingKind, Sample, Severity};

const NAME: &str = "metrics";

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    path: &'static str,
    /// Track the increase since the previous sample
    delta: bool,
    /// Smallest standard deviation used for the z-score
    sigma_floor: f64,
}

const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "cpu",
        path: "cpu.percent",
        delta: false,
        sigma_floor: 1.0,
    },
    FieldSpec {
        name: "ram",
        path: "ram.percent",
        delta: false,
        sigma_floor: 1.0,
    },
    FieldSpec {
        name: "disk",
        path: "disk.percent",
        delta: false,
        sigma_floor: 0.5,
    },
    FieldSpec {
        name: "network_recv",
        path: "network.bytes_recv",
        delta: true,
        sigma_floor: 64.0 * 1024.0,
    },
    FieldSpec {
        name: "network_sent",
        path: "network.bytes_sent",
        delta: true,
        sigma_floor: 64.0 * 1024.0,
    },
];

#[derive(Debug)]
struct Tracker {
    spec: FieldSpec,
    window: RollingWindow,
    hysteresis: Hysteresis,
    last_raw: Option<f64>,
}

/// Severity of a raised alert from its z-score
fn severity_for(z_score: f64) -> Severity {
    if z_score >= 5.0 {
        Severity::Critical
    } else if z_score >= 4.0 {
        Severity::High
    } else {
        Severity::Medium
    }
}

pub struct MetricsAnalyzer {
    settings: MetricsAnalyzerSettings,
    trackers: Vec<Tracker>,
}

impl MetricsAnalyzer {
    pub fn new(settings: MetricsAnalyzerSettings) -> Self {
        let trackers = FIELDS
            .iter()
            .map(|spec| Tracker {
                spec: *spec,
                window: RollingWindow::new(settings.history),
                hysteresis: Hysteresis::new(settings.alert_after, settings.clear_after),
                last_raw: None,
            })
            .collect();
        Self { settings, trackers }
    }

    /// Detector state of a tracked field
    #[cfg(test)]
    pub fn state(&self, field: &str) -> Option<super::DetectorState> {
        self.trackers
            .iter()
            .find(|t| t.spec.name == field)
            .map(|t| t.hysteresis.state())
    }
}

impl Analyzer for MetricsAnalyzer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn accepts(&self, kind: CollectorKind) -> bool {
        kind == CollectorKind::System
    }

    fn analyze(&mut self, sample: &Sample) -> Result<Vec<Finding>, AnalyzerError> {
        let mut findings = Vec::new();
        let mut seen = 0;

        for tracker in &mut self.trackers {
            let Some(raw) = sample.get_path_f64(tracker.spec.path) else {
                continue;
            };
            seen += 1;

            let value = if tracker.spec.delta {
                match tracker.last_raw.replace(raw) {
                    // Counter reset, skip this tick
                    Some(previous) if raw >= previous => raw - previous,
                    _ => continue,
                }
            } else {
                raw
            };

            if tracker.window.len() < self.settings.min_history {
                tracker.window.push(value);
                continue;
            }

            let mean = tracker.window.mean();
            let std_dev = tracker.window.std_dev();
            let z_score = tracker.window.z_score(value, tracker.spec.sigma_floor);
            let deviating = z_score > self.settings.multiplier;

            match tracker.hysteresis.observe(deviating) {
                Transition::Raised => findings.push(
                    Finding::new(
                        FindingKind::Anomaly,
                        severity_for(z_score),
                        sample,
                        NAME,
                        format!("{}_anomaly", tracker.spec.name),
                        format!(
                            "{} at {:.2} is {:.1} standard deviations above its baseline of {:.2}",
                            tracker.spec.name, value, z_score, mean
                        ),
                    )
                    .with_evidence("field", tracker.spec.path)
                    .with_evidence("value", value)
                    .with_evidence("mean", mean)
                    .with_evidence("std_dev", std_dev)
                    .with_evidence("z_score", z_score)
                    .with_evidence("threshold", self.settings.multiplier),
                ),
                Transition::Cleared => findings.push(
                    Finding::new(
                        FindingKind::Anomaly,
                        Severity::Low,
                        sample,
                        NAME,
                        format!("{}_anomaly_resolved", tracker.spec.name),
                        format!("{} is back within its baseline", tracker.spec.name),
                    )
                    .with_evidence("field", tracker.spec.path)
                    .with_evidence("value", value)
                    .with_evidence("mean", mean),
                ),
                Transition::None => {}
            }

            tracker.window.push(value);
        }

        if seen == 0 {
            return Err(AnalyzerError::MissingField {
                field: FIELDS[0].path.to_string(),
            });
        }
        Ok(findings)
    }
}
