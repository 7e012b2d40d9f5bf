//! End-to-end pipeline scenarios
//!
//! Scripted collectors and analyzers feed a real pipeline wired to the
//! in-memory backend. Time is virtual.

#[cfg(test)]
mod pipeline_tests {
    use crate::analyzer::Analyzer;
    use crate::collector::Collector;
    use crate::config::AgentConfig;
    use crate::error::{AnalyzerError, CollectorError};
    use crate::health::HealthRegistry;
    use crate::models::{CollectorKind, Finding, FindingKind, Payload, Sample, Severity};
    use crate::observability::{AgentMetrics, ForwardedLog, StructuredLogger};
    use crate::orchestrator::{
        samples_message, BufferStats, ControlHandler, Orchestrator, OutboundBuffer, Pipeline,
        ShutdownReport,
    };
    use crate::proto::{events, Message, MessageType};
    use crate::transport::testing::{scripted_client, Backend, ScriptedConnector, URI};
    use crate::transport::{Credentials, TransportClient};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot, watch};
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, Instant};

    /// Emits `{"n": call}` until `limit` calls, then fails
    struct Counter {
        kind: CollectorKind,
        calls: Arc<AtomicUsize>,
        delay: Duration,
        limit: usize,
    }

    #[async_trait]
    impl Collector for Counter {
        fn kind(&self) -> CollectorKind {
            self.kind
        }

        async fn collect(&mut self) -> Result<Sample, CollectorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(self.delay).await;
            if n >= self.limit {
                return Err(CollectorError::new(self.kind, "source exhausted"));
            }
            let mut payload = Payload::new();
            payload.insert("n".into(), Value::from(n as u64));
            Ok(Sample::new(self.kind, payload))
        }
    }

    fn counter(kind: CollectorKind, limit: usize) -> (Box<dyn Collector>, Arc<AtomicUsize>) {
        slow_counter(kind, limit, Duration::ZERO)
    }

    fn slow_counter(
        kind: CollectorKind,
        limit: usize,
        delay: Duration,
    ) -> (Box<dyn Collector>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let collector = Counter {
            kind,
            calls: calls.clone(),
            delay,
            limit,
        };
        (Box::new(collector), calls)
    }

    /// Raises a critical finding on the sample numbered `at`
    struct Tripwire {
        at: u64,
    }

    impl Analyzer for Tripwire {
        fn name(&self) -> &'static str {
            "tripwire"
        }

        fn accepts(&self, kind: CollectorKind) -> bool {
            kind == CollectorKind::System
        }

        fn analyze(&mut self, sample: &Sample) -> Result<Vec<Finding>, AnalyzerError> {
            let n = sample
                .get("n")
                .and_then(Value::as_u64)
                .ok_or_else(|| AnalyzerError::MissingField { field: "n".into() })?;
            if n != self.at {
                return Ok(Vec::new());
            }
            Ok(vec![Finding::new(
                FindingKind::SecurityEvent,
                Severity::Critical,
                sample,
                "tripwire",
                "tripwire",
                "tripwire crossed",
            )
            .with_evidence("n", n)])
        }
    }

    struct Exploding;

    impl Analyzer for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn accepts(&self, _kind: CollectorKind) -> bool {
            true
        }

        fn analyze(&mut self, _sample: &Sample) -> Result<Vec<Finding>, AnalyzerError> {
            panic!("detector bug");
        }
    }

    fn config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.server_id = "srv-1".into();
        config.channel_uri = URI.into();
        config.monitoring_interval = Duration::from_secs(60);
        config
            .interval_overrides
            .insert(CollectorKind::System, Duration::from_secs(1));
        config.collectors.jitter = Duration::ZERO;
        config.collectors.timeout = Duration::from_secs(1);
        config.pipeline.shutdown_grace = Duration::from_secs(2);
        config
    }

    struct Running {
        handle: JoinHandle<anyhow::Result<ShutdownReport>>,
        stop: oneshot::Sender<()>,
        backend: Arc<Backend>,
        connector: Arc<ScriptedConnector>,
    }

    impl Running {
        async fn stop(self) -> ShutdownReport {
            let _ = self.stop.send(());
            self.handle.await.unwrap().unwrap()
        }
    }

    fn start(
        config: AgentConfig,
        collectors: Vec<Box<dyn Collector>>,
        analyzers: Vec<Box<dyn Analyzer>>,
        failures: usize,
        logs: Option<mpsc::Receiver<ForwardedLog>>,
    ) -> Running {
        let (client, backend, connector) = scripted_client(config.transport.clone(), failures);
        let mut builder = Orchestrator::builder(config)
            .collectors(collectors)
            .analyzers(analyzers)
            .transport(client);
        if let Some(logs) = logs {
            builder = builder.forwarded_logs(logs);
        }
        let orchestrator = builder.build().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(orchestrator.run(async move {
            let _ = stopped.await;
        }));
        Running {
            handle,
            stop,
            backend,
            connector,
        }
    }

    /// Sample numbers carried by metrics batches, in delivery order
    fn delivered_samples(frames: &[Message]) -> Vec<u64> {
        frames
            .iter()
            .filter(|m| m.event == events::RESOURCE_MONITORING)
            .flat_map(|m| m.body["samples"].as_array().cloned().unwrap_or_default())
            .filter_map(|s| s["payload"]["n"].as_u64())
            .collect()
    }

    fn data_frames(backend: &Backend) -> Vec<Message> {
        backend
            .frames()
            .into_iter()
            .filter(|m| !matches!(m.message_type, MessageType::Control | MessageType::Heartbeat))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_finding_overtakes_pending_batch() {
        let (collector, _calls) = counter(CollectorKind::System, 100);
        // connected at t=2; samples 3 and 4 are buffered when sample 4 trips
        let running = start(
            config(),
            vec![collector],
            vec![Box::new(Tripwire { at: 4 })],
            1,
            None,
        );

        sleep(Duration::from_secs(6)).await;
        let frames = data_frames(&running.backend);
        let alert_at = frames
            .iter()
            .position(|m| m.event == events::ALERT)
            .unwrap();
        assert_eq!(frames[alert_at].body["severity"], "critical");
        assert_eq!(frames[alert_at].body["findings"][0]["evidence"]["n"], 4);
        assert!(delivered_samples(&frames[..alert_at]).iter().all(|n| *n < 3));
        assert!(delivered_samples(&frames[alert_at + 1..]).is_empty());

        // the batch timer fires at t=60
        sleep(Duration::from_secs(57)).await;
        let frames = data_frames(&running.backend);
        let after = delivered_samples(&frames[alert_at + 1..]);
        assert!(after.contains(&3));
        assert!(after.contains(&4));

        let report = running.stop().await;
        assert_eq!(report.reason, "shutdown signal");
        assert_eq!(report.abandoned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_keeps_newest_samples_and_all_critical_findings() {
        let mut config = config();
        config.pipeline.buffer_max_entries = 10;
        // attempts at t=0, 2, 6, 14 fail; the next one, at t=314, succeeds
        let (collector, calls) = counter(CollectorKind::System, 15);
        let running = start(
            config,
            vec![collector],
            vec![Box::new(Tripwire { at: 3 })],
            4,
            None,
        );

        sleep(Duration::from_secs(300)).await;
        assert!(calls.load(Ordering::SeqCst) >= 15);
        assert!(running.backend.frames().is_empty());

        sleep(Duration::from_secs(20)).await;
        assert_eq!(running.connector.attempts(), 5);

        let frames = data_frames(&running.backend);
        assert_eq!(frames[0].event, events::ALERT);
        assert_eq!(frames[0].body["findings"][0]["evidence"]["n"], 3);
        assert_eq!(delivered_samples(&frames), (5..15).collect::<Vec<_>>());

        let report = running.stop().await;
        assert_eq!(report.discarded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_collector_does_not_delay_others() {
        let mut config = config();
        config.interval_overrides.clear();
        config.monitoring_interval = Duration::from_secs(10);

        let (slow, slow_calls) =
            slow_counter(CollectorKind::System, usize::MAX, Duration::from_secs(60));
        let (fast, fast_calls) = counter(CollectorKind::NetworkTraffic, usize::MAX);
        let running = start(config, vec![slow, fast], Vec::new(), 0, None);

        // both tick at t=0, 10, 20, 30; every slow tick times out
        sleep(Duration::from_secs(35)).await;
        assert_eq!(fast_calls.load(Ordering::SeqCst), 4);
        assert_eq!(slow_calls.load(Ordering::SeqCst), 4);

        let network_batches = running
            .backend
            .frames()
            .iter()
            .filter(|m| m.event == events::NETWORK_TRAFFIC)
            .count();
        assert!(network_batches >= 2);
        assert!(delivered_samples(&running.backend.frames()).is_empty());

        let report = running.stop().await;
        assert_eq!(report.reason, "shutdown signal");
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_commands_drive_collectors() {
        let mut config = config();
        config
            .interval_overrides
            .insert(CollectorKind::System, Duration::from_secs(100));
        let (collector, calls) = counter(CollectorKind::System, usize::MAX);
        let running = start(config, vec![collector], Vec::new(), 0, None);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        running
            .backend
            .push_text(r#"{"type":"control","command":"run-scan-now","params":{"collector":"system"}}"#);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // re-armed at t=2: ticks at 7 and 12
        running.backend.push_text(
            r#"{"type":"control","command":"update-interval","params":{"interval_secs":5,"collector":"system"}}"#,
        );
        sleep(Duration::from_secs(11)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        running
            .backend
            .push_text(r#"{"type":"control","command":"disconnect"}"#);
        let report = running.handle.await.unwrap().unwrap();

        assert_eq!(report.reason, "disconnect requested");
        let last = running.backend.frames().pop().unwrap();
        assert_eq!(last.event, events::DISCONNECT);
        assert!(running.backend.latest_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_analyzer_is_contained() {
        let (collector, _calls) = counter(CollectorKind::System, 100);
        let running = start(
            config(),
            vec![collector],
            vec![Box::new(Exploding), Box::new(Tripwire { at: 1 })],
            0,
            None,
        );

        sleep(Duration::from_secs(3)).await;
        let alerts = running
            .backend
            .frames()
            .iter()
            .filter(|m| m.event == events::ALERT)
            .count();
        assert_eq!(alerts, 1);

        running.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarded_logs_shipped_on_shutdown() {
        let (logs_tx, logs_rx) = mpsc::channel(8);
        let running = start(config(), Vec::new(), Vec::new(), 0, Some(logs_rx));
        let backend = running.backend.clone();

        // connected at t=0; the batch timer would fire at t=60
        sleep(Duration::from_secs(1)).await;
        logs_tx
            .send(ForwardedLog {
                timestamp: Utc::now(),
                level: "WARN".into(),
                target: "secspot_lib::collector".into(),
                message: "system collector failed".into(),
                fields: Default::default(),
            })
            .await
            .unwrap();
        sleep(Duration::from_secs(1)).await;
        assert!(backend.frames_of(MessageType::Log).is_empty());

        let report = running.stop().await;
        assert_eq!(report.flushed, 1);
        assert_eq!(report.discarded, 0);
        assert_eq!(report.remaining, BufferStats::default());

        let shipped = backend
            .frames()
            .into_iter()
            .find(|m| m.event == events::LOGS)
            .unwrap();
        assert_eq!(shipped.message_type, MessageType::Log);
        assert_eq!(shipped.body["source"], "agent");
        assert_eq!(shipped.body["entries"][0]["message"], "system collector failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_backend_reports_leftovers() {
        let (collector, _calls) = counter(CollectorKind::System, 3);
        let running = start(
            config(),
            vec![collector],
            vec![Box::new(Tripwire { at: 1 })],
            usize::MAX,
            None,
        );

        sleep(Duration::from_secs(5)).await;
        let report = running.stop().await;

        assert_eq!(report.flushed, 0);
        assert_eq!(report.remaining.samples, 3);
        assert_eq!(report.remaining.protected, 1);
        assert_eq!(report.discarded, 4);
        let system = report.collectors[&CollectorKind::System];
        assert_eq!(system.samples, 3);
        assert!(system.failures >= 1);
    }

    /// Pipeline wired to `transport` with no analyzers or collectors
    fn bare_pipeline(config: &AgentConfig, transport: Arc<TransportClient>) -> Pipeline {
        let metrics = AgentMetrics::new();
        let (config_tx, _) = watch::channel(Arc::new(config.clone()));
        Pipeline {
            analyzers: Vec::new(),
            buffer: OutboundBuffer::new(&config.pipeline, metrics.clone()),
            transport,
            control: ControlHandler::new(config_tx, HashMap::new()),
            logger: StructuredLogger::new("srv-1"),
            metrics,
            health: HealthRegistry::new(),
            batch_size: config.pipeline.batch_size,
            send_all_logs: false,
            flush_at: Instant::now(),
        }
    }

    fn security_finding(severity: Severity, n: u64) -> Finding {
        let mut payload = Payload::new();
        payload.insert("n".into(), Value::from(n));
        let sample = Sample::new(CollectorKind::Security, payload);
        Finding::new(
            FindingKind::SecurityEvent,
            severity,
            &sample,
            "security",
            format!("rule_{n}"),
            "suspicious activity",
        )
    }

    fn credentials() -> Credentials {
        Credentials {
            agent_id: "srv-1".into(),
            agent_version: "test".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_findings_bounded_while_disconnected() {
        let mut config = config();
        config.pipeline.buffer_max_findings = 3;
        let (client, _backend, _connector) =
            scripted_client(config.transport.clone(), usize::MAX);
        let transport = Arc::new(client);
        transport.connect(URI, "agents", credentials()).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert!(!transport.current_state().is_connected());

        let mut pipeline = bare_pipeline(&config, transport.clone());
        for n in 0..10 {
            pipeline.on_finding(security_finding(Severity::Critical, n));
        }

        assert_eq!(transport.queued(), 0);
        let rules: Vec<&str> = pipeline.buffer.findings().map(Finding::rule).collect();
        assert_eq!(rules, vec!["rule_7", "rule_8", "rule_9"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_findings_stay_buffered() {
        let mut config = config();
        config.transport.queue_capacity = 1;
        let (client, backend, _connector) = scripted_client(config.transport.clone(), 0);
        let transport = Arc::new(client);
        transport.connect(URI, "agents", credentials()).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert!(transport.current_state().is_connected());

        let mut pipeline = bare_pipeline(&config, transport.clone());
        pipeline.buffer.push_finding(security_finding(Severity::High, 0));

        // the only replay slot is taken until the transport task runs
        transport
            .send(samples_message(CollectorKind::System, &[]))
            .unwrap();
        assert_eq!(pipeline.flush(), 0);
        assert_eq!(pipeline.buffer.findings().count(), 1);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(pipeline.flush(), 1);
        assert!(pipeline.buffer.is_empty());

        sleep(Duration::from_secs(1)).await;
        let alerts = backend
            .frames()
            .into_iter()
            .filter(|m| m.event == events::ALERT)
            .collect::<Vec<_>>();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].body["findings"][0]["rule"], "rule_0");
    }
}
