//! Inbound control commands

use crate::config::AgentConfig;
use crate::models::CollectorKind;
use crate::proto::{ControlCommand, ControlMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

/// What the pipeline does after a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Continue,
    /// The base interval changed; the batch flush timer follows it
    RearmFlush,
    Shutdown { reason: String },
}

/// Applies control commands to the running agent
pub struct ControlHandler {
    config: watch::Sender<Arc<AgentConfig>>,
    triggers: HashMap<CollectorKind, Arc<Notify>>,
}

impl ControlHandler {
    pub fn new(
        config: watch::Sender<Arc<AgentConfig>>,
        triggers: HashMap<CollectorKind, Arc<Notify>>,
    ) -> Self {
        Self { config, triggers }
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<AgentConfig> {
        self.config.borrow().clone()
    }

    pub fn apply(&self, message: ControlMessage) -> ControlOutcome {
        match message.command {
            ControlCommand::UpdateInterval {
                interval,
                collector,
            } => {
                let next = self.config().with_interval(collector, interval);
                self.config.send_replace(Arc::new(next));
                info!(
                    collector = collector.map_or("all", |k| k.as_str()),
                    interval_secs = interval.as_secs(),
                    "Applied interval update"
                );
                match collector {
                    None => ControlOutcome::RearmFlush,
                    Some(_) => ControlOutcome::Continue,
                }
            }
            ControlCommand::RunScanNow { collector } => {
                match self.triggers.get(&collector) {
                    Some(trigger) => {
                        info!(collector = %collector, "Running collector on request");
                        trigger.notify_one();
                    }
                    None => warn!(
                        collector = %collector,
                        "Scan requested for a collector that is not enabled"
                    ),
                }
                ControlOutcome::Continue
            }
            ControlCommand::Disconnect => {
                info!("Disconnect requested by backend");
                ControlOutcome::Shutdown {
                    reason: "disconnect requested".to_string(),
                }
            }
            ControlCommand::Unknown { command } => {
                warn!(command = %command, "Ignoring unsupported control command");
                ControlOutcome::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn message(command: ControlCommand) -> ControlMessage {
        ControlMessage {
            command,
            received_at: Utc::now(),
        }
    }

    fn handler() -> (ControlHandler, watch::Receiver<Arc<AgentConfig>>, Arc<Notify>) {
        let (tx, rx) = watch::channel(Arc::new(AgentConfig::default()));
        let trigger = Arc::new(Notify::new());
        let triggers = HashMap::from([(CollectorKind::Security, trigger.clone())]);
        (ControlHandler::new(tx, triggers), rx, trigger)
    }

    #[test]
    fn test_update_interval_publishes_new_snapshot() {
        let (handler, mut rx, _) = handler();
        let before = rx.borrow_and_update().clone();

        let outcome = handler.apply(message(ControlCommand::UpdateInterval {
            interval: Duration::from_secs(5),
            collector: Some(CollectorKind::Security),
        }));

        assert_eq!(outcome, ControlOutcome::Continue);
        assert!(rx.has_changed().unwrap());
        let after = rx.borrow().clone();
        assert_eq!(after.interval_for(CollectorKind::Security), Duration::from_secs(5));
        assert_eq!(before.interval_for(CollectorKind::Security), Duration::from_secs(60));
    }

    #[test]
    fn test_base_interval_update_rearms_flush() {
        let (handler, rx, _) = handler();
        let outcome = handler.apply(message(ControlCommand::UpdateInterval {
            interval: Duration::from_secs(7),
            collector: None,
        }));

        assert_eq!(outcome, ControlOutcome::RearmFlush);
        assert_eq!(rx.borrow().flush_interval(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_run_scan_now_notifies_collector() {
        let (handler, _rx, trigger) = handler();
        let outcome = handler.apply(message(ControlCommand::RunScanNow {
            collector: CollectorKind::Security,
        }));
        assert_eq!(outcome, ControlOutcome::Continue);

        // notify_one stores a permit when nobody is waiting yet
        tokio::time::timeout(Duration::from_secs(1), trigger.notified())
            .await
            .unwrap();

        let outcome = handler.apply(message(ControlCommand::RunScanNow {
            collector: CollectorKind::System,
        }));
        assert_eq!(outcome, ControlOutcome::Continue);
    }

    #[test]
    fn test_disconnect_and_unknown() {
        let (handler, _rx, _) = handler();
        assert!(matches!(
            handler.apply(message(ControlCommand::Disconnect)),
            ControlOutcome::Shutdown { .. }
        ));
        assert_eq!(
            handler.apply(message(ControlCommand::Unknown {
                command: "restart".into()
            })),
            ControlOutcome::Continue
        );
    }
}
