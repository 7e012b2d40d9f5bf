//! In-memory backend for transport and pipeline tests

use super::{Connector, Frame, Link, TransportClient};
use crate::config::TransportSettings;
use crate::error::ConnectionError;
use crate::proto::{HostInfo, Message, MessageType};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

pub(crate) const URI: &str = "ws://backend.test/app/secspot";

struct LinkControl {
    alive: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    inbound: Option<mpsc::UnboundedSender<Frame>>,
}

/// Backend side of every link a [`ScriptedConnector`] opened
#[derive(Default)]
pub(crate) struct Backend {
    frames: Mutex<Vec<Message>>,
    links: Mutex<Vec<LinkControl>>,
}

impl Backend {
    /// Every message written by the agent, across links
    pub(crate) fn frames(&self) -> Vec<Message> {
        self.frames.lock().unwrap().clone()
    }

    pub(crate) fn frames_of(&self, message_type: MessageType) -> Vec<Message> {
        self.frames()
            .into_iter()
            .filter(|m| m.message_type == message_type)
            .collect()
    }

    /// Drop the newest link as if the network went away
    pub(crate) fn kill_latest(&self) {
        let mut links = self.links.lock().unwrap();
        let link = links.last_mut().expect("a link was opened");
        link.alive.store(false, Ordering::SeqCst);
        link.inbound = None;
    }

    /// Push a text frame to the agent over the newest link
    pub(crate) fn push_text(&self, text: &str) {
        let links = self.links.lock().unwrap();
        let link = links.last().expect("a link was opened");
        link.inbound
            .as_ref()
            .expect("link is alive")
            .send(Frame::Text(text.to_string()))
            .unwrap();
    }

    /// Whether the agent sent a close frame on the newest link
    pub(crate) fn latest_closed(&self) -> bool {
        let links = self.links.lock().unwrap();
        links.last().is_some_and(|l| l.closed.load(Ordering::SeqCst))
    }
}

struct MemoryLink {
    backend: Arc<Backend>,
    alive: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    inbound: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        let message: Message = serde_json::from_str(&text).unwrap();
        self.backend.frames.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.closed.store(true, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Refuses the first `failures` opens, then hands out in-memory links
pub(crate) struct ScriptedConnector {
    backend: Arc<Backend>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    pub(crate) fn new(backend: Arc<Backend>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            backend,
            failures_left: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        })
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, _uri: &Url) -> Result<Box<dyn Link>, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let closed = Arc::new(AtomicBool::new(false));
        self.backend.links.lock().unwrap().push(LinkControl {
            alive: alive.clone(),
            closed: closed.clone(),
            inbound: Some(tx),
        });
        Ok(Box::new(MemoryLink {
            backend: self.backend.clone(),
            alive,
            closed,
            inbound: rx,
        }))
    }
}

pub(crate) fn test_host() -> HostInfo {
    HostInfo {
        hostname: "test-host".into(),
        platform: "linux".into(),
        platform_version: "6.1".into(),
    }
}

/// Client wired to a fresh backend that refuses the first `failures` opens
pub(crate) fn scripted_client(
    settings: TransportSettings,
    failures: usize,
) -> (TransportClient, Arc<Backend>, Arc<ScriptedConnector>) {
    let backend = Arc::new(Backend::default());
    let connector = ScriptedConnector::new(backend.clone(), failures);
    let client = TransportClient::new(settings, connector.clone(), test_host());
    (client, backend, connector)
}
