//! Wire protocol for the backend's real-time channel
//!
//! Every outbound transmission is one JSON [`Message`] envelope. The
//! transport stamps `epoch` and `sequence_no` at write time; producers only
//! describe what to send through [`Outgoing`].

use crate::error::ProtocolError;
use crate::models::CollectorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Backend event names
pub mod events {
    pub const SUBSCRIBE: &str = "agent.subscribe";
    pub const RESOURCE_MONITORING: &str = "agent.resource-monitoring";
    pub const NETWORK_TRAFFIC: &str = "agent.network-traffic";
    pub const SECURITY_EVENTS: &str = "agent.security-events";
    pub const LOGS: &str = "agent.logs";
    pub const ALERT: &str = "agent.alert";
    pub const HEARTBEAT: &str = "agent.heartbeat";
    pub const DISCONNECT: &str = "agent.disconnect";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Metrics,
    Event,
    Log,
    Heartbeat,
    Control,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Metrics => "metrics",
            MessageType::Event => "event",
            MessageType::Log => "log",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Control => "control",
        }
    }
}

/// Wire envelope, one per transmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub event: String,
    pub channel: String,
    pub agent_id: String,
    pub agent_version: String,
    pub epoch: u64,
    pub sequence_no: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
}

impl Message {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Identity stamped on every envelope of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub agent_id: String,
    pub agent_version: String,
    pub channel: String,
}

impl Envelope {
    pub fn seal(&self, outgoing: &Outgoing, epoch: u64, sequence_no: u64) -> Message {
        Message {
            message_type: outgoing.message_type,
            event: outgoing.event.to_string(),
            channel: self.channel.clone(),
            agent_id: self.agent_id.clone(),
            agent_version: self.agent_version.clone(),
            epoch,
            sequence_no,
            timestamp: Utc::now(),
            body: outgoing.body.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    /// Jumps ahead of every queued normal message
    Urgent,
}

/// Unsequenced message waiting for the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub message_type: MessageType,
    pub event: &'static str,
    pub body: Value,
    pub priority: Priority,
}

impl Outgoing {
    pub fn new(message_type: MessageType, event: &'static str, body: Value) -> Self {
        Self {
            message_type,
            event,
            body,
            priority: Priority::Normal,
        }
    }

    pub fn urgent(mut self) -> Self {
        self.priority = Priority::Urgent;
        self
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, events::HEARTBEAT, Value::Null)
    }

    pub fn subscribe(host: &HostInfo, server_id: &str, agent_version: &str) -> Self {
        Self::new(
            MessageType::Control,
            events::SUBSCRIBE,
            json!({
                "server_id": server_id,
                "agent_version": agent_version,
                "hostname": host.hostname,
                "platform": host.platform,
                "platform_version": host.platform_version,
            }),
        )
    }

    pub fn disconnect(reason: &str) -> Self {
        Self::new(
            MessageType::Control,
            events::DISCONNECT,
            json!({ "reason": reason }),
        )
    }

    pub fn is_urgent(&self) -> bool {
        self.priority == Priority::Urgent
    }
}

/// Event name for a batch of samples from one collector
pub fn sample_event(kind: CollectorKind) -> &'static str {
    match kind {
        CollectorKind::System => events::RESOURCE_MONITORING,
        CollectorKind::NetworkTraffic => events::NETWORK_TRAFFIC,
        CollectorKind::Security => events::SECURITY_EVENTS,
        CollectorKind::LogTail => events::LOGS,
    }
}

/// Host details announced in the subscribe handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    pub hostname: String,
    pub platform: String,
    pub platform_version: String,
}

impl HostInfo {
    pub fn detect() -> Self {
        Self {
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            platform: sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            platform_version: sysinfo::System::os_version().unwrap_or_default(),
        }
    }
}

/// Command pushed by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Change the collection interval of one collector, or of all when
    /// `collector` is `None`
    UpdateInterval {
        interval: Duration,
        collector: Option<CollectorKind>,
    },
    RunScanNow {
        collector: CollectorKind,
    },
    Disconnect,
    Unknown {
        command: String,
    },
}

impl ControlCommand {
    pub fn name(&self) -> &str {
        match self {
            ControlCommand::UpdateInterval { .. } => "update-interval",
            ControlCommand::RunScanNow { .. } => "run-scan-now",
            ControlCommand::Disconnect => "disconnect",
            ControlCommand::Unknown { command } => command,
        }
    }

    fn from_parts(command: &str, params: &Value) -> Result<Self, ProtocolError> {
        let invalid = |reason: &str| ProtocolError::InvalidParams {
            command: command.to_string(),
            reason: reason.to_string(),
        };
        let collector = match params.get("collector") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(
                CollectorKind::parse(name)
                    .ok_or_else(|| invalid(&format!("unknown collector `{name}`")))?,
            ),
            Some(_) => return Err(invalid("`collector` must be a string")),
        };

        match command {
            "update-interval" => {
                let secs = params
                    .get("interval_secs")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| invalid("`interval_secs` must be a positive integer"))?;
                if secs == 0 {
                    return Err(invalid("`interval_secs` must be a positive integer"));
                }
                Ok(ControlCommand::UpdateInterval {
                    interval: Duration::from_secs(secs),
                    collector,
                })
            }
            "run-scan-now" => Ok(ControlCommand::RunScanNow {
                collector: collector.unwrap_or(CollectorKind::Security),
            }),
            "disconnect" => Ok(ControlCommand::Disconnect),
            other => Ok(ControlCommand::Unknown {
                command: other.to_string(),
            }),
        }
    }
}

/// Inbound control message handed to the registered handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub command: ControlCommand,
    pub received_at: DateTime<Utc>,
}

/// Parsed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control(ControlMessage),
    /// Anything else the channel pushes (acks, pings, broadcasts)
    Other { message_type: String },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    message_type: Option<String>,
    command: Option<String>,
    #[serde(default)]
    params: Value,
}

pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let raw: RawFrame = serde_json::from_str(text)?;
    let message_type = raw.message_type.ok_or(ProtocolError::MissingField("type"))?;
    if message_type != "control" {
        return Ok(Inbound::Other { message_type });
    }
    let command = raw.command.ok_or(ProtocolError::MissingField("command"))?;
    Ok(Inbound::Control(ControlMessage {
        command: ControlCommand::from_parts(&command, &raw.params)?,
        received_at: Utc::now(),
    }))
}
