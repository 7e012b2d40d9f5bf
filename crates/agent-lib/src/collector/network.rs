//! Network-traffic collector
//!
//! Connection and packet metadata comes from a [`PacketSource`]. The
//! default source walks the kernel connection tables; raw capture backends
//! plug in behind the same trait.

use super::procnet::{self, SocketEntry};
use super::Collector;
use crate::error::CollectorError;
use crate::models::{CollectorKind, Payload, Sample};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

/// Metadata of one observed packet or connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketMeta {
    /// Local endpoint address
    pub from: String,
    /// Peer address
    pub to: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl From<&SocketEntry> for PacketMeta {
    fn from(entry: &SocketEntry) -> Self {
        Self {
            from: entry.local.ip().to_string(),
            to: entry.remote.ip().to_string(),
            src_port: entry.local.port(),
            dst_port: entry.remote.port(),
            protocol: entry.protocol.as_str().to_string(),
            state: Some(entry.state.as_str().to_string()),
            size: None,
        }
    }
}

/// Stream of packet metadata, consumed one window at a time
#[async_trait]
pub trait PacketSource: Send + Sync {
    /// Start a new collection window
    async fn begin_window(&mut self) -> Result<(), CollectorError>;

    /// Next packet in the window, `None` once the window is exhausted
    async fn next_packet(&mut self) -> Result<Option<PacketMeta>, CollectorError>;
}

/// Reads active (non-listening) sockets from `/proc/net`
pub struct ProcNetSource {
    root: PathBuf,
    pending: VecDeque<PacketMeta>,
}

impl ProcNetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl PacketSource for ProcNetSource {
    async fn begin_window(&mut self) -> Result<(), CollectorError> {
        let entries = procnet::read_tables(&self.root)
            .await
            .map_err(|e| CollectorError::io(CollectorKind::NetworkTraffic, e))?;
        self.pending = entries
            .iter()
            .filter(|entry| !entry.is_listening())
            .map(PacketMeta::from)
            .collect();
        Ok(())
    }

    async fn next_packet(&mut self) -> Result<Option<PacketMeta>, CollectorError> {
        Ok(self.pending.pop_front())
    }
}

pub struct NetworkTrafficCollector {
    source: Box<dyn PacketSource>,
    max_packets: usize,
}

impl NetworkTrafficCollector {
    pub fn new(source: Box<dyn PacketSource>, max_packets: usize) -> Self {
        Self {
            source,
            max_packets,
        }
    }
}

#[async_trait]
impl Collector for NetworkTrafficCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::NetworkTraffic
    }

    async fn collect(&mut self) -> Result<Sample, CollectorError> {
        self.source.begin_window().await?;

        let mut packets = Vec::new();
        let mut truncated = false;
        while let Some(packet) = self.source.next_packet().await? {
            if packets.len() >= self.max_packets {
                truncated = true;
                break;
            }
            packets.push(packet);
        }

        let mut by_protocol: BTreeMap<&str, u64> = BTreeMap::new();
        for packet in &packets {
            *by_protocol.entry(packet.protocol.as_str()).or_default() += 1;
        }
        let by_protocol = json!(by_protocol);

        let mut payload = Payload::new();
        payload.insert("packet_count".into(), Value::from(packets.len()));
        payload.insert("by_protocol".into(), by_protocol);
        payload.insert(
            "packets".into(),
            serde_json::to_value(&packets)
                .map_err(|e| CollectorError::new(CollectorKind::NetworkTraffic, e.to_string()))?,
        );

        let sample = Sample::new(CollectorKind::NetworkTraffic, payload);
        Ok(if truncated { sample.truncated() } else { sample })
    }
}
