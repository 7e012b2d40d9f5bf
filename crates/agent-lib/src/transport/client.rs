//! Transport client for the backend's real-time channel
//!
//! A single background task owns the link, the [`ConnectionMachine`], the
//! sequence counter and the replay queues. [`TransportClient`] is a cheap
//! front that hands messages to that task and observes its state.
//!
//! Delivery rules:
//! - Every epoch starts with the subscribe handshake as sequence 0.
//! - Sequence numbers are stamped when a message is written, so they are
//!   gapless within an epoch.
//! - A queued message is removed only after its write succeeded; anything
//!   still queued when a link dies is replayed, oldest first, on the next
//!   epoch.
//! - Urgent messages are written before any queued normal message.

use super::state::{ConnectionMachine, ConnectionState, ReconnectPolicy, StateChange};
use super::websocket::{parse_channel_uri, Connector, Frame, Link, WsConnector};
use crate::config::TransportSettings;
use crate::error::{ConnectionError, ProtocolError, SendError};
use crate::health::{components, HealthRegistry};
use crate::observability::AgentMetrics;
use crate::proto::{parse_inbound, ControlMessage, Envelope, HostInfo, Inbound, Outgoing};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Grace used when the client is dropped without an explicit shutdown
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Stand-in deadline for disabled timers
const IDLE: Duration = Duration::from_secs(24 * 60 * 60);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity announced to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub agent_id: String,
    pub agent_version: String,
}

/// Identifies the single logical connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub uri: String,
    pub channel: String,
}

/// Reported through the status callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// Retries exhausted; the client keeps retrying on the persistent interval
    PersistentFailure { attempts: u32 },
    Recovered,
}

type MessageHandler = Arc<dyn Fn(ControlMessage) + Send + Sync>;
type StatusHandler = Arc<dyn Fn(TransportStatus) + Send + Sync>;

/// State shared between the client front and its task
struct Shared {
    state: watch::Sender<ConnectionState>,
    history: Mutex<Vec<StateChange>>,
    on_message: RwLock<Option<MessageHandler>>,
    on_status: RwLock<Option<StatusHandler>>,
    /// Messages accepted by `send` and not yet written
    queued: AtomicUsize,
    closed: AtomicBool,
}

impl Shared {
    fn message_handler(&self) -> Option<MessageHandler> {
        self.on_message
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn status_handler(&self) -> Option<StatusHandler> {
        self.on_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

struct Session {
    handle: ConnectionHandle,
    shutdown: Option<oneshot::Sender<Duration>>,
    task: JoinHandle<()>,
}

pub struct TransportClient {
    settings: TransportSettings,
    connector: Arc<dyn Connector>,
    host: HostInfo,
    shared: Arc<Shared>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
    session: Mutex<Option<Session>>,
    health: HealthRegistry,
    metrics: AgentMetrics,
}

impl TransportClient {
    pub fn new(settings: TransportSettings, connector: Arc<dyn Connector>, host: HostInfo) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            connector,
            host,
            shared: Arc::new(Shared {
                state,
                history: Mutex::new(Vec::new()),
                on_message: RwLock::new(None),
                on_status: RwLock::new(None),
                queued: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            session: Mutex::new(None),
            health: HealthRegistry::new(),
            metrics: AgentMetrics::new(),
        }
    }

    /// Client speaking WebSocket to the backend
    pub fn websocket(settings: TransportSettings, host: HostInfo) -> Self {
        let connector = Arc::new(WsConnector::new(settings.connect_timeout));
        Self::new(settings, connector, host)
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register the inbound control handler
    ///
    /// Invoked on the transport task, once per control frame, in receive
    /// order. Keep it short; hand work off through a channel.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(ControlMessage) + Send + Sync + 'static,
    {
        *self
            .shared
            .on_message
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn on_status<F>(&self, handler: F)
    where
        F: Fn(TransportStatus) + Send + Sync + 'static,
    {
        *self
            .shared
            .on_status
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Open the logical connection
    ///
    /// Returns immediately; the link is opened in the background. Calling
    /// again while a connection exists returns the existing handle and
    /// makes no new attempt.
    pub fn connect(
        &self,
        uri: &str,
        channel: &str,
        credentials: Credentials,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let mut session = lock(&self.session);
        if let Some(existing) = session.as_ref() {
            debug!(
                connection_id = %existing.handle.id,
                state = %self.current_state(),
                "Connection already open, reusing handle"
            );
            return Ok(existing.handle.clone());
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::Closed);
        }

        let url = parse_channel_uri(uri)?;
        let outbox = lock(&self.outbox_rx)
            .take()
            .ok_or(ConnectionError::Closed)?;

        let handle = ConnectionHandle {
            id: Uuid::new_v4(),
            uri: uri.to_string(),
            channel: channel.to_string(),
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = TransportTask {
            connector: Arc::clone(&self.connector),
            uri: url,
            envelope: Envelope {
                agent_id: credentials.agent_id.clone(),
                agent_version: credentials.agent_version.clone(),
                channel: channel.to_string(),
            },
            handshake: Outgoing::subscribe(
                &self.host,
                &credentials.agent_id,
                &credentials.agent_version,
            ),
            heartbeat_interval: self.settings.heartbeat_interval,
            urgent_capacity: self.settings.urgent_capacity.max(1),
            write_timeout: self.settings.connect_timeout,
            machine: ConnectionMachine::new(ReconnectPolicy::from_settings(&self.settings)),
            shared: Arc::clone(&self.shared),
            outbox,
            urgent: VecDeque::new(),
            pending: VecDeque::new(),
            link: None,
            sequence: 0,
            last_write: Instant::now(),
            health: self.health.clone(),
            metrics: self.metrics.clone(),
        };

        info!(
            connection_id = %handle.id,
            uri = %handle.uri,
            channel = %handle.channel,
            "Opening real-time connection"
        );
        *session = Some(Session {
            handle: handle.clone(),
            shutdown: Some(shutdown_tx),
            task: tokio::spawn(task.run(shutdown_rx)),
        });
        Ok(handle)
    }

    /// Queue a message for delivery
    ///
    /// Messages sent before `connect` or during an outage wait in the
    /// replay queue. Normal messages are refused once `queue_capacity`
    /// messages are waiting. Urgent ones are always accepted; beyond
    /// `urgent_capacity` the oldest unsent urgent message is dropped.
    pub fn send(&self, outgoing: Outgoing) -> Result<(), SendError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }

        let capacity = self.settings.queue_capacity;
        if outgoing.is_urgent() {
            self.shared.queued.fetch_add(1, Ordering::AcqRel);
        } else if self
            .shared
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_err()
        {
            return Err(SendError::QueueFull { capacity });
        }

        self.outbox.send(outgoing).map_err(|_| {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            SendError::Closed
        })
    }

    /// Subscribe to connection state changes
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Recent state transitions, oldest first
    pub fn history(&self) -> Vec<StateChange> {
        lock(&self.shared.history).clone()
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        lock(&self.session).as_ref().map(|s| s.handle.clone())
    }

    /// Messages accepted and not yet written
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    /// Flush what the grace period allows, send a disconnect notice and a
    /// close frame, then stop the task
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.closed.store(true, Ordering::Release);
        let session = lock(&self.session).take();
        let Some(mut session) = session else {
            return;
        };

        if let Some(tx) = session.shutdown.take() {
            let _ = tx.send(grace);
        }
        // The task bounds its own close sequence by `grace`
        if timeout(grace + Duration::from_secs(1), &mut session.task)
            .await
            .is_err()
        {
            warn!(grace_ms = grace.as_millis() as u64, "Transport did not stop in time, aborting");
            session.task.abort();
        }
    }
}

/// Next frame of the current link; never resolves without one
async fn recv_frame(link: &mut Option<Box<dyn Link>>) -> Option<Result<Frame, ConnectionError>> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

struct TransportTask {
    connector: Arc<dyn Connector>,
    uri: Url,
    envelope: Envelope,
    handshake: Outgoing,
    heartbeat_interval: Duration,
    urgent_capacity: usize,
    write_timeout: Duration,
    machine: ConnectionMachine,
    shared: Arc<Shared>,
    outbox: mpsc::UnboundedReceiver<Outgoing>,
    urgent: VecDeque<Outgoing>,
    pending: VecDeque<Outgoing>,
    link: Option<Box<dyn Link>>,
    /// Next sequence number of the current epoch
    sequence: u64,
    last_write: Instant,
    health: HealthRegistry,
    metrics: AgentMetrics,
}

impl TransportTask {
    async fn run(mut self, mut shutdown: oneshot::Receiver<Duration>) {
        self.machine.start();
        self.publish().await;
        self.attempt().await;

        loop {
            let retry_at = self.machine.next_retry_at();
            let connected = self.machine.state().is_connected();
            let heartbeat_at = self.last_write + self.heartbeat_interval;
            let idle = Instant::now() + IDLE;

            tokio::select! {
                grace = &mut shutdown => {
                    self.close(grace.unwrap_or(DEFAULT_GRACE)).await;
                    break;
                }
                outgoing = self.outbox.recv() => match outgoing {
                    Some(outgoing) => {
                        self.enqueue(outgoing);
                        self.drain_outbox();
                        self.flush().await;
                    }
                    None => {
                        self.close(DEFAULT_GRACE).await;
                        break;
                    }
                },
                frame = recv_frame(&mut self.link) => self.on_frame(frame).await,
                _ = sleep_until(retry_at.unwrap_or(idle)), if retry_at.is_some() => {
                    self.metrics.inc_reconnect_attempts();
                    self.attempt().await;
                }
                _ = sleep_until(heartbeat_at), if connected => self.heartbeat().await,
            }
        }
    }

    async fn attempt(&mut self) {
        debug!(
            uri = %self.uri,
            attempt = self.machine.attempt() + 1,
            "Opening link"
        );
        match self.connector.open(&self.uri).await {
            Ok(link) => {
                self.link = Some(link);
                self.handshake().await;
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn handshake(&mut self) {
        let epoch = self.machine.link_opened();
        self.publish().await;
        self.sequence = 0;

        let message = self.envelope.seal(&self.handshake, epoch, 0);
        let result = match message.to_json() {
            Ok(text) => self.write(text).await,
            Err(e) => Err(ConnectionError::Handshake(e.to_string())),
        };
        if let Err(e) = result {
            self.fail(e).await;
            return;
        }

        self.sequence = 1;
        let recovered = self.machine.established();
        self.publish().await;
        info!(
            epoch,
            queued = self.urgent.len() + self.pending.len(),
            "Connected to real-time channel"
        );
        if recovered {
            info!("Transport recovered from persistent failure");
            if let Some(handler) = self.shared.status_handler() {
                handler(TransportStatus::Recovered);
            }
        }

        self.drain_outbox();
        self.flush().await;
    }

    fn enqueue(&mut self, outgoing: Outgoing) {
        if outgoing.is_urgent() {
            self.urgent.push_back(outgoing);
            while self.urgent.len() > self.urgent_capacity {
                if let Some(dropped) = self.urgent.pop_front() {
                    self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                    self.metrics.inc_entries_dropped("finding");
                    warn!(
                        event = %dropped.event,
                        ceiling = self.urgent_capacity,
                        "Urgent queue ceiling reached, dropping oldest urgent message"
                    );
                }
            }
        } else {
            self.pending.push_back(outgoing);
        }
    }

    fn drain_outbox(&mut self) {
        while let Ok(outgoing) = self.outbox.try_recv() {
            self.enqueue(outgoing);
        }
    }

    fn front(&self) -> Option<&Outgoing> {
        self.urgent.front().or_else(|| self.pending.front())
    }

    fn pop_front(&mut self) {
        if self.urgent.pop_front().is_none() {
            self.pending.pop_front();
        }
        self.shared.queued.fetch_sub(1, Ordering::AcqRel);
    }

    /// Write queued messages, urgent first, while connected
    async fn flush(&mut self) {
        while self.machine.state().is_connected() {
            let Some(outgoing) = self.front() else {
                break;
            };
            let message = self
                .envelope
                .seal(outgoing, self.machine.epoch(), self.sequence);
            let kind = message.message_type.as_str();

            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, event = %message.event, "Dropping unserializable message");
                    self.pop_front();
                    continue;
                }
            };

            match self.write(text).await {
                Ok(()) => {
                    self.pop_front();
                    self.sequence += 1;
                    self.metrics.inc_messages_sent(kind);
                }
                Err(e) => {
                    self.fail(e).await;
                    break;
                }
            }
        }
        self.metrics
            .set_transport_queue_depth(self.urgent.len() + self.pending.len());
    }

    async fn heartbeat(&mut self) {
        if !self.urgent.is_empty() || !self.pending.is_empty() {
            self.flush().await;
            return;
        }
        let message = self.envelope.seal(
            &Outgoing::heartbeat(),
            self.machine.epoch(),
            self.sequence,
        );
        let result = match message.to_json() {
            Ok(text) => self.write(text).await,
            Err(e) => {
                warn!(error = %e, "Failed to encode heartbeat");
                return;
            }
        };
        match result {
            Ok(()) => {
                self.sequence += 1;
                self.metrics.inc_messages_sent(message.message_type.as_str());
                debug!(sequence_no = message.sequence_no, "Heartbeat sent");
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn write(&mut self, text: String) -> Result<(), ConnectionError> {
        let Some(link) = self.link.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        match timeout(self.write_timeout, link.send_text(text)).await {
            Ok(Ok(())) => {
                self.last_write = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConnectionError::Timeout(self.write_timeout)),
        }
    }

    async fn on_frame(&mut self, frame: Option<Result<Frame, ConnectionError>>) {
        match frame {
            None => self.fail(ConnectionError::Closed).await,
            Some(Err(e)) => self.fail(e).await,
            Some(Ok(Frame::Binary(_))) => {
                warn!(error = %ProtocolError::Binary, "Ignoring inbound frame");
            }
            Some(Ok(Frame::Text(text))) => match parse_inbound(&text) {
                Ok(Inbound::Control(message)) => {
                    info!(command = message.command.name(), "Control message received");
                    match self.shared.message_handler() {
                        Some(handler) => handler(message),
                        None => warn!(
                            command = message.command.name(),
                            "No control handler registered, message dropped"
                        ),
                    }
                }
                Ok(Inbound::Other { message_type }) => {
                    debug!(message_type = %message_type, "Ignoring non-control frame");
                }
                Err(e) => warn!(error = %e, "Ignoring malformed inbound frame"),
            },
        }
    }

    /// Drop the link and schedule the next attempt
    async fn fail(&mut self, err: ConnectionError) {
        self.link = None;
        let was_connected = self.machine.state().is_connected();
        let failure = self.machine.failed(Instant::now());
        self.publish().await;

        if was_connected {
            error!(
                error = %err,
                queued = self.urgent.len() + self.pending.len(),
                retry_in_ms = failure.delay.as_millis() as u64,
                "Connection lost"
            );
        } else {
            error!(
                error = %err,
                attempt = failure.attempt,
                retry_in_ms = failure.delay.as_millis() as u64,
                "Connection attempt failed"
            );
        }

        if failure.became_persistent {
            warn!(
                attempts = failure.attempt,
                retry_interval_secs = failure.delay.as_secs(),
                "Connection retries exhausted, continuing on the persistent interval"
            );
            if let Some(handler) = self.shared.status_handler() {
                handler(TransportStatus::PersistentFailure {
                    attempts: failure.attempt,
                });
            }
        }
    }

    /// Bounded close: flush, disconnect notice, close frame
    async fn close(&mut self, grace: Duration) {
        self.drain_outbox();
        let deadline = Instant::now() + grace;

        if self.machine.state().is_connected() {
            let closing = async {
                self.flush().await;
                if !self.machine.state().is_connected() {
                    return;
                }
                let notice = self.envelope.seal(
                    &Outgoing::disconnect("shutdown"),
                    self.machine.epoch(),
                    self.sequence,
                );
                if let Ok(text) = notice.to_json() {
                    if self.write(text).await.is_ok() {
                        self.sequence += 1;
                    }
                }
                if let Some(link) = self.link.as_mut() {
                    if let Err(e) = link.close().await {
                        debug!(error = %e, "Close frame not delivered");
                    }
                }
            };
            if timeout_at(deadline, closing).await.is_err() {
                warn!(grace_ms = grace.as_millis() as u64, "Grace period elapsed while closing");
            }
        }

        let abandoned = self.urgent.len() + self.pending.len();
        if abandoned > 0 {
            warn!(abandoned, "Unsent messages discarded at shutdown");
        }
        self.link = None;
        self.machine.closed();
        self.publish().await;
        info!("Transport closed");
    }

    /// Expose the machine's state to observers
    async fn publish(&self) {
        let state = self.machine.state();
        self.shared.state.send_replace(state);
        *lock(&self.shared.history) = self.machine.history().cloned().collect();
        self.metrics.set_connection_state(state.code());

        match state {
            ConnectionState::Connected => self.health.set_healthy(components::TRANSPORT).await,
            ConnectionState::Backoff { attempt, .. } if self.machine.is_persistent() => {
                self.health
                    .set_unhealthy(
                        components::TRANSPORT,
                        format!("retries exhausted after {attempt} attempts"),
                    )
                    .await
            }
            ConnectionState::Backoff { attempt, .. } => {
                self.health
                    .set_degraded(components::TRANSPORT, format!("reconnecting, attempt {attempt}"))
                    .await
            }
            ConnectionState::Disconnected => {
                self.health
                    .set_degraded(components::TRANSPORT, "disconnected")
                    .await
            }
            ConnectionState::Connecting => {}
        }
    }
}
