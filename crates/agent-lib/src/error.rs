//! Error taxonomy for the agent runtime
//!
//! Only [`ConfigError`] is fatal. Every other error is contained by the
//! component that raised it and surfaces as a log line, a health counter or
//! a connection status change.

use crate::models::CollectorKind;
use std::time::Duration;
use thiserror::Error;

/// A single collection tick failed. The tick produces no sample.
#[derive(Debug, Error)]
#[error("{kind} collector failed: {message}")]
pub struct CollectorError {
    pub kind: CollectorKind,
    pub message: String,
    pub timed_out: bool,
}

impl CollectorError {
    pub fn new(kind: CollectorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout(kind: CollectorKind, after: Duration) -> Self {
        Self {
            kind,
            message: format!("collection timed out after {}ms", after.as_millis()),
            timed_out: true,
        }
    }

    pub fn io(kind: CollectorKind, err: std::io::Error) -> Self {
        Self::new(kind, err.to_string())
    }
}

/// An analyzer could not process one sample.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("sample field `{field}` missing or not numeric")]
    MissingField { field: String },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("analyzer panicked: {0}")]
    Panicked(String),
}

/// Returned by `TransportClient::send` when a message could not be queued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("transport has been shut down")]
    Closed,

    #[error("outbound queue full ({capacity} messages)")]
    QueueFull { capacity: usize },
}

/// Failure to open or keep the real-time link. Triggers backoff.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid channel uri `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("link closed by peer")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => ConnectionError::Closed,
            WsError::Io(e) => ConnectionError::Io(e),
            other => ConnectionError::WebSocket(other.to_string()),
        }
    }
}

/// Startup configuration is unusable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required setting `{0}` is missing")]
    Missing(&'static str),

    #[error("setting `{name}` is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// An inbound frame could not be understood.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is missing `{0}`")]
    MissingField(&'static str),

    #[error("invalid params for `{command}`: {reason}")]
    InvalidParams { command: String, reason: String },

    #[error("binary frames are not supported")]
    Binary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_timeout_is_flagged() {
        let err = CollectorError::timeout(CollectorKind::Security, Duration::from_millis(250));
        assert!(err.timed_out);
        assert!(err.to_string().contains("security"));
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_tungstenite_close_maps_to_closed() {
        let err: ConnectionError = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(err, ConnectionError::Closed));
    }

    #[test]
    fn test_config_error_message() {
        let err = ConfigError::Missing("SERVER_ID");
        assert_eq!(err.to_string(), "required setting `SERVER_ID` is missing");
    }
}
