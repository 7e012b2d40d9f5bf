//! Host security agent runtime
//!
//! This crate provides the core functionality for:
//! - Telemetry collection (system metrics, network traffic, security events, log tails)
//! - Stateful anomaly and threat detection
//! - A resilient real-time connection to the backend
//! - Orchestration of collectors, analyzers and outbound batching
//! - Health checks and observability

pub mod analyzer;
pub mod collector;
pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod proto;
pub mod transport;

pub use config::AgentConfig;
pub use error::{
    AnalyzerError, CollectorError, ConfigError, ConnectionError, ProtocolError, SendError,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, ForwardedLog, LogForwardLayer, StructuredLogger};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, ShutdownReport};
pub use transport::{ConnectionState, TransportClient};
