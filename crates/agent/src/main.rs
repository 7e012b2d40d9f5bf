//! secspot agent - host security monitoring agent
//!
//! Collects host telemetry, detects threats locally and streams results to
//! the backend over a real-time channel.

use anyhow::{Context, Result};
use secspot_agent::{api, config::Settings};
use secspot_lib::{
    health::HealthRegistry,
    observability::{AgentMetrics, ForwardedLog, LogForwardLayer},
    ConfigError, Orchestrator,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Forwarded agent log events held while the pipeline is busy
const FORWARDED_LOG_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> ExitCode {
    let (forward_layer, forwarded_logs) = LogForwardLayer::new(FORWARDED_LOG_CAPACITY, false);
    let send_all_logs = forward_layer.send_all_handle();

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().json())
        .with(forward_layer)
        .init();

    match run(forwarded_logs, send_all_logs).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.downcast_ref::<ConfigError>().is_some() => {
            error!(error = %format!("{e:#}"), "Invalid configuration");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Agent failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    forwarded_logs: mpsc::Receiver<ForwardedLog>,
    send_all_logs: Arc<AtomicBool>,
) -> Result<()> {
    info!(version = AGENT_VERSION, "Starting secspot-agent");

    // Load configuration
    let settings = Settings::load(config_path().as_deref())?;
    let api_port = settings.api_port;
    let config = settings.into_agent_config()?;
    send_all_logs.store(config.pipeline.send_all_logs, Ordering::Relaxed);
    info!(
        server_id = %config.server_id,
        channel = %config.channel_name,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    let metrics = AgentMetrics::new();

    let orchestrator = Orchestrator::builder(config)
        .health(health_registry.clone())
        .metrics(metrics.clone())
        .forwarded_logs(forwarded_logs)
        .build()
        .context("Failed to assemble the agent")?;

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(
        health_registry,
        metrics,
        orchestrator.transport(),
    ));
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            warn!(error = %e, "API server stopped");
        }
    });

    let report = orchestrator.run(shutdown_signal()).await?;
    info!(
        reason = %report.reason,
        flushed = report.flushed,
        discarded = report.discarded,
        abandoned = report.abandoned,
        findings_discarded = report.remaining.anomalies + report.remaining.protected,
        "Shutting down"
    );
    for (kind, stats) in &report.collectors {
        info!(
            collector = %kind,
            ticks = stats.ticks,
            samples = stats.samples,
            failures = stats.failures,
            timeouts = stats.timeouts,
            "Collector totals"
        );
    }

    api_handle.abort();
    Ok(())
}

/// `RUST_LOG` wins over `LOG_LEVEL`; `info` otherwise
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn config_path() -> Option<PathBuf> {
    std::env::var_os("SECSPOT_CONFIG")
        .or_else(|| std::env::args_os().nth(1))
        .map(PathBuf::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
