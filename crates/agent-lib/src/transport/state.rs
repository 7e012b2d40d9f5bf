//! Connection state machine
//!
//! [`ConnectionMachine`] holds the only [`ConnectionState`] of the agent and
//! is owned by the transport task. It never sleeps: callers pass the current
//! [`Instant`] in and get the next retry time back, which keeps every
//! transition testable without a real clock.

use crate::config::TransportSettings;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Transitions retained for the status endpoint
const HISTORY_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff { attempt: u32, next_retry_at: Instant },
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Backoff { .. } => "backoff",
        }
    }

    /// Gauge value exported to Prometheus
    pub fn code(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Backoff { .. } => 3,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Connecting => f.write_str("Connecting"),
            ConnectionState::Connected => f.write_str("Connected"),
            ConnectionState::Backoff { attempt, .. } => write!(f, "Backoff({attempt})"),
        }
    }
}

impl Serialize for ConnectionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ConnectionState::Backoff {
                attempt,
                next_retry_at,
            } => {
                let mut s = serializer.serialize_struct("ConnectionState", 3)?;
                s.serialize_field("state", self.name())?;
                s.serialize_field("attempt", attempt)?;
                let retry_in = next_retry_at.saturating_duration_since(Instant::now());
                s.serialize_field("retry_in_ms", &(retry_in.as_millis() as u64))?;
                s.end()
            }
            _ => {
                let mut s = serializer.serialize_struct("ConnectionState", 1)?;
                s.serialize_field("state", self.name())?;
                s.end()
            }
        }
    }
}

/// One recorded transition
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub state: String,
    pub at: DateTime<Utc>,
}

/// Backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub persistent_retry_interval: Duration,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self {
            retries: settings.retries,
            initial_backoff: settings.initial_backoff,
            max_backoff: settings.max_backoff,
            persistent_retry_interval: settings.persistent_retry_interval,
        }
    }

    /// Whether `attempt` consecutive failures exhausted the retry budget
    pub fn is_persistent(&self, attempt: u32) -> bool {
        attempt > self.retries
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.is_persistent(attempt) {
            return self.persistent_retry_interval;
        }
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// What a failure changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failure {
    pub attempt: u32,
    pub delay: Duration,
    /// Set on the failure that exhausted the retry budget
    pub became_persistent: bool,
}

#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    attempt: u32,
    epoch: u64,
    persistent: bool,
    history: VecDeque<StateChange>,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            attempt: 0,
            epoch: 0,
            persistent: false,
            history: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn history(&self) -> impl Iterator<Item = &StateChange> {
        self.history.iter()
    }

    /// Retry deadline while in backoff
    pub fn next_retry_at(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Backoff { next_retry_at, .. } => Some(next_retry_at),
            _ => None,
        }
    }

    fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return false;
        }
        self.state = next;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(StateChange {
            state: next.to_string(),
            at: Utc::now(),
        });
        true
    }

    /// First attempt after start. Later attempts happen in `Backoff`.
    pub fn start(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.transition(ConnectionState::Connecting)
    }

    /// A link opened; the handshake is next and belongs to a new epoch
    pub fn link_opened(&mut self) -> u64 {
        self.epoch += 1;
        self.transition(ConnectionState::Connecting);
        self.epoch
    }

    /// Handshake written. Returns true when this ends a persistent failure.
    pub fn established(&mut self) -> bool {
        self.attempt = 0;
        self.transition(ConnectionState::Connected);
        std::mem::take(&mut self.persistent)
    }

    /// An attempt failed, or the link was lost
    pub fn failed(&mut self, now: Instant) -> Failure {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.policy.delay(self.attempt);
        let became_persistent = self.policy.is_persistent(self.attempt) && !self.persistent;
        if became_persistent {
            self.persistent = true;
        }
        self.transition(ConnectionState::Backoff {
            attempt: self.attempt,
            next_retry_at: now + delay,
        });
        Failure {
            attempt: self.attempt,
            delay,
            became_persistent,
        }
    }

    pub fn closed(&mut self) {
        self.transition(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            persistent_retry_interval: Duration::from_secs(300),
        }
    }

    fn labels(machine: &ConnectionMachine) -> Vec<String> {
        machine.history().map(|c| c.state.clone()).collect()
    }

    #[test]
    fn test_exponential_delay_with_ceiling() {
        let policy = ReconnectPolicy {
            retries: 10,
            ..policy()
        };
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(6), Duration::from_secs(60));
        assert_eq!(policy.delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_persistent_interval_after_retries() {
        let policy = policy();
        assert!(!policy.is_persistent(3));
        assert!(policy.is_persistent(4));
        assert_eq!(policy.delay(4), Duration::from_secs(300));
        assert_eq!(policy.delay(40), Duration::from_secs(300));
    }

    #[test]
    fn test_trace_for_three_failures_then_success() {
        let mut machine = ConnectionMachine::new(policy());
        let t0 = Instant::now();

        assert!(machine.start());
        let first = machine.failed(t0);
        assert_eq!(first.delay, Duration::from_secs(2));
        assert_eq!(machine.next_retry_at(), Some(t0 + Duration::from_secs(2)));
        machine.failed(t0 + Duration::from_secs(2));
        let third = machine.failed(t0 + Duration::from_secs(6));
        assert!(!third.became_persistent);

        assert_eq!(machine.link_opened(), 1);
        assert!(!machine.established());

        assert_eq!(
            labels(&machine),
            vec![
                "Connecting",
                "Backoff(1)",
                "Backoff(2)",
                "Backoff(3)",
                "Connecting",
                "Connected"
            ]
        );
        assert_eq!(machine.attempt(), 0);
    }

    #[test]
    fn test_persistent_failure_reported_once_and_recovered() {
        let mut machine = ConnectionMachine::new(policy());
        let now = Instant::now();
        machine.start();

        let reported: Vec<bool> = (0..6).map(|_| machine.failed(now).became_persistent).collect();
        assert_eq!(reported, vec![false, false, false, true, false, false]);
        assert!(machine.is_persistent());

        machine.link_opened();
        assert!(machine.established());
        assert!(!machine.is_persistent());
    }

    #[test]
    fn test_lost_link_is_attempt_one_of_new_sequence() {
        let mut machine = ConnectionMachine::new(policy());
        let now = Instant::now();
        machine.start();
        machine.failed(now);
        machine.failed(now);
        machine.link_opened();
        machine.established();

        let lost = machine.failed(now);
        assert_eq!(lost.attempt, 1);
        assert_eq!(machine.state().to_string(), "Backoff(1)");

        machine.link_opened();
        assert_eq!(machine.epoch(), 2);
    }

    #[test]
    fn test_state_serializes_for_status() {
        let value = serde_json::to_value(ConnectionState::Connected).unwrap();
        assert_eq!(value, serde_json::json!({ "state": "connected" }));

        let backoff = ConnectionState::Backoff {
            attempt: 2,
            next_retry_at: Instant::now() + Duration::from_secs(4),
        };
        let value = serde_json::to_value(backoff).unwrap();
        assert_eq!(value["state"], "backoff");
        assert_eq!(value["attempt"], 2);
    }
}
