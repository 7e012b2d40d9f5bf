//! Stateful detectors turning samples into findings
//!
//! Analyzers are owned by the pipeline task and see the samples of the
//! kinds they accept one at a time, in arrival order. They never consult
//! the clock or a random source, so a given sample history always produces
//! the same findings.

mod hysteresis;
mod logs;
mod metrics;
mod security;
mod window;

pub use hysteresis::{DetectorState, Hysteresis, Transition};
pub use logs::LogAnalyzer;
pub use metrics::MetricsAnalyzer;
pub use security::SecurityAnalyzer;
pub use window::RollingWindow;

use crate::config::AgentConfig;
use crate::error::AnalyzerError;
use crate::models::{CollectorKind, Finding, Sample};
use std::panic::{catch_unwind, AssertUnwindSafe};

pub trait Analyzer: Send {
    fn name(&self) -> &'static str;

    /// Whether samples of `kind` are fed to this analyzer
    fn accepts(&self, kind: CollectorKind) -> bool;

    fn analyze(&mut self, sample: &Sample) -> Result<Vec<Finding>, AnalyzerError>;
}

/// Instantiate every analyzer with its configured thresholds
pub fn create_analyzers(config: &AgentConfig) -> Vec<Box<dyn Analyzer>> {
    vec![
        Box::new(MetricsAnalyzer::new(config.metrics_analyzer.clone())),
        Box::new(SecurityAnalyzer::new(config.security_analyzer.clone())),
        Box::new(LogAnalyzer::new()),
    ]
}

/// Run one analysis, turning a panic into an [`AnalyzerError`]
pub fn analyze_guarded(
    analyzer: &mut dyn Analyzer,
    sample: &Sample,
) -> Result<Vec<Finding>, AnalyzerError> {
    match catch_unwind(AssertUnwindSafe(|| analyzer.analyze(sample))) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(AnalyzerError::Panicked(message))
        }
    }
}
