//! Protocol aggregate and its start/stop orchestration.

use super::config::ProtocolConfig;
use super::registry::ProbeRegistry;
use crate::agent::sensing::apply_change;
use crate::agent::{AgentObserver, PromptEvent, ScriptRunner, SensingRunner, SensingState};
use crate::config::DEFAULT_HEALTH_CHECK_INTERVAL;
use crate::context::RuntimeContext;
use crate::datum::{Datum, PARTICIPATION_REPORT_TYPE, PROTOCOL_REPORT_TYPE};
use crate::encryption::SymmetricEncryption;
use crate::error::RuntimeError;
use crate::health::HealthReport;
use crate::probe::{Probe, ProbeHandle, ProbeLinks, ProbeState, ProbeStatus, SettingChange};
use crate::store::{CommitSink, DataStore, StoreSettings};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A protocol's probes, its data store and its running flag.
pub struct Protocol {
    config: ProtocolConfig,
    probes: Vec<Probe>,
    store: Arc<DataStore>,
    running: AtomicBool,
}

impl Protocol {
    /// Build every probe and the data store from a validated document.
    pub fn build(
        config: ProtocolConfig,
        registry: &ProbeRegistry,
        context: &RuntimeContext,
        sink: Arc<dyn CommitSink>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let store = Arc::new(
            DataStore::new(
                StoreSettings {
                    protocol_id: config.id.clone(),
                    commit_interval: config.commit_interval,
                    max_buffered_datums: config.max_buffered_datums,
                },
                sink,
                SymmetricEncryption::new(&config.encryption_key),
            )
            .with_anonymizer(config.anonymizer())
            .with_stats(context.stats().clone()),
        );

        let links = ProbeLinks {
            store: store.clone(),
            scheduler: context.scheduler().clone(),
            device_id: context.device_id().to_string(),
            protocol_id: config.id.clone(),
            participation_horizon: config.participation_horizon,
        };

        let mut probes = Vec::with_capacity(config.probes.len());
        for probe_config in &config.probes {
            let kind = registry.build(probe_config)?;
            let probe = Probe::new(
                probe_config.probe_type.clone(),
                kind,
                probe_config.settings(),
                links.clone(),
            );
            probe.set_enabled(probe_config.enabled);
            probes.push(probe);
        }

        Ok(Self {
            config,
            probes,
            store,
            running: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    pub fn probe(&self, probe_type: &str) -> Option<&Probe> {
        self.probes.iter().find(|p| p.probe_type() == probe_type)
    }

    fn probe_handles(&self) -> Vec<ProbeHandle> {
        self.probes.iter().map(Probe::handle).collect()
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// True while the protocol is executing and at least one probe is running.
    ///
    /// A protocol whose probes have all disabled themselves is not running,
    /// even before a health test halts it.
    pub fn is_running(&self) -> bool {
        self.is_executing() && self.probes.iter().any(|p| p.state() == ProbeState::Running)
    }

    fn is_executing(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Result of a protocol-wide health test.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolHealth {
    pub protocol_id: String,
    pub running: bool,
    pub reports: Vec<HealthReport>,
    /// Components restarted by this test.
    pub restarted: Vec<String>,
}

impl ProtocolHealth {
    pub fn is_healthy(&self) -> bool {
        self.running && self.reports.iter().all(HealthReport::is_healthy)
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.reports.iter().flat_map(HealthReport::lines).collect();
        lines.extend(self.restarted.iter().map(|name| format!("restarted {name}")));
        lines
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtocolStatus {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub pending: usize,
    pub active_producers: usize,
    pub last_commit: Option<DateTime<Utc>>,
    pub prompts_delivered: u64,
    /// `None` without a sensing agent or while halted.
    pub sensing_state: Option<SensingState>,
    pub settings_applied: u64,
    pub probes: Vec<ProbeStatus>,
}

/// Starts and stops everything in a protocol.
///
/// `execute_protocol` and `halt_protocol` are idempotent. Callers should not
/// race them against each other; they are serialized internally regardless.
pub struct ProtocolController {
    protocol: Protocol,
    context: RuntimeContext,
    transition: Mutex<()>,
    runner: Mutex<Option<ScriptRunner>>,
    sensing: Mutex<Option<SensingRunner>>,
    prompt_tx: Sender<PromptEvent>,
    prompt_rx: Receiver<PromptEvent>,
    health_check_interval: Duration,
}

impl ProtocolController {
    pub fn new(protocol: Protocol, context: RuntimeContext) -> Self {
        let (prompt_tx, prompt_rx) = bounded(1_000);
        Self {
            protocol,
            context,
            transition: Mutex::new(()),
            runner: Mutex::new(None),
            sensing: Mutex::new(None),
            prompt_tx,
            prompt_rx,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }

    /// How often the host runs [`test_health`](Self::test_health). Listening
    /// probes' participation is measured against it.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.context
    }

    /// Prompts approved by the protocol's delivery agent.
    pub fn prompts(&self) -> Receiver<PromptEvent> {
        self.prompt_rx.clone()
    }

    /// Initialize every probe, start the store, then start every probe that initialized.
    pub fn execute_protocol(&self) -> Result<(), RuntimeError> {
        let _transition = self.lock_transition();
        if self.protocol.is_executing() {
            debug!(protocol = %self.protocol.id(), "already running");
            return Ok(());
        }
        info!(protocol = %self.protocol.id(), name = %self.protocol.name(), "executing protocol");

        // All initialization finishes before anything is scheduled.
        for probe in self.protocol.probes.iter().filter(|p| p.is_enabled()) {
            // Failures are logged by the probe, which disables itself.
            let _ = probe.initialize();
        }

        self.protocol.store.start()?;

        // The agent observes from the first datum on.
        if let Err(e) = self.start_sensing() {
            self.roll_back();
            return Err(e);
        }

        let mut started = 0;
        for probe in &self.protocol.probes {
            if !probe.is_enabled()
                || !matches!(probe.state(), ProbeState::Initialized | ProbeState::Stopped)
            {
                continue;
            }
            match probe.start() {
                Ok(()) => started += 1,
                Err(e) if e.is_fatal() => {
                    error!(probe = %probe.probe_type(), "{e}");
                    self.roll_back();
                    return Err(e);
                }
                Err(e) => warn!(probe = %probe.probe_type(), "could not start probe: {e}"),
            }
        }

        if started == 0 {
            self.roll_back();
            return Err(RuntimeError::Protocol(format!(
                "no probe of protocol '{}' could be started",
                self.protocol.name()
            )));
        }

        if let Err(e) = self.start_prompts() {
            self.roll_back();
            return Err(e);
        }

        self.protocol.running.store(true, Ordering::SeqCst);
        info!(protocol = %self.protocol.id(), started, "protocol running");
        Ok(())
    }

    /// Stop every running probe, then the store.
    ///
    /// If the store refuses to stop, the error is returned and the protocol
    /// stays marked as running.
    pub fn halt_protocol(&self) -> Result<(), RuntimeError> {
        let _transition = self.lock_transition();
        if !self.protocol.is_executing() {
            return Ok(());
        }
        info!(protocol = %self.protocol.id(), "halting protocol");

        self.stop_agents();
        self.stop_running_probes();

        if let Err(e) = self.protocol.store.stop() {
            error!(protocol = %self.protocol.id(), "{e}");
            return Err(e);
        }

        self.protocol.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.context.stats().save() {
            warn!("could not save transparency stats: {e}");
        }
        info!(protocol = %self.protocol.id(), "protocol halted");
        Ok(())
    }

    /// Stop then start one probe of a running protocol.
    pub fn restart_probe(&self, probe_type: &str) -> Result<(), RuntimeError> {
        let probe = self
            .protocol
            .probe(probe_type)
            .ok_or_else(|| RuntimeError::Protocol(format!("unknown probe type '{probe_type}'")))?;
        if !self.protocol.is_executing() {
            return Err(RuntimeError::InvalidOperation(format!(
                "cannot restart '{probe_type}': protocol is not running"
            )));
        }
        probe.restart()
    }

    /// Test the store and every probe, restarting enabled components that stopped.
    ///
    /// A protocol left without any running probe is halted.
    pub fn test_health(&self) -> ProtocolHealth {
        let mut health = ProtocolHealth {
            protocol_id: self.protocol.id().to_string(),
            running: self.protocol.is_executing(),
            reports: Vec::new(),
            restarted: Vec::new(),
        };
        if !health.running {
            return health;
        }

        let mut store_report = self.protocol.store.test_health();
        if store_report.restart_required {
            match self.protocol.store.start() {
                Ok(()) => health.restarted.push("data store".to_string()),
                Err(e) => store_report.error(format!("restart failed: {e}")),
            }
        }
        health.reports.push(store_report);

        for probe in &self.protocol.probes {
            let mut report = probe.ping();
            if report.is_healthy() && probe.state() == ProbeState::Running {
                probe.record_health_test();
            }
            if report.restart_required && probe.is_enabled() {
                let restarted = match probe.state() {
                    ProbeState::Uninitialized => probe.initialize().and_then(|()| probe.start()),
                    _ => probe.start(),
                };
                match restarted {
                    Ok(()) => {
                        info!(probe = %probe.probe_type(), "restarted by health test");
                        health.restarted.push(probe.probe_type().to_string());
                    }
                    Err(e) => report.error(format!("restart failed: {e}")),
                }
            }
            health.reports.push(report);
        }

        if !self.protocol.is_running() {
            let mut report = HealthReport::new(format!("protocol {}", self.protocol.name()));
            report.error("no probe is running");
            match self.halt_protocol() {
                Ok(()) => {
                    warn!(protocol = %self.protocol.id(), "every probe stopped, protocol halted");
                    health.running = false;
                }
                Err(e) => report.error(format!("halt failed: {e}")),
            }
            health.reports.push(report);
        }

        for line in health.lines() {
            debug!(protocol = %self.protocol.id(), "{line}");
        }
        health
    }

    /// Add a `protocol_report` datum describing the protocol to its own store.
    pub fn report(&self) -> Result<Datum, RuntimeError> {
        let status = self.status();
        let health: Vec<String> = std::iter::once(self.protocol.store.test_health())
            .chain(self.protocol.probes.iter().map(Probe::ping))
            .flat_map(|report| report.lines())
            .collect();

        let payload = json!({
            "protocol_name": status.name,
            "running": status.running,
            "pending": status.pending,
            "active_producers": status.active_producers,
            "probes": serde_json::to_value(&status.probes)?,
            "health": health,
            "stats": serde_json::to_value(self.context.stats().stats())?,
        });
        let payload = match payload {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };

        let datum = Datum::new(PROTOCOL_REPORT_TYPE, payload)
            .with_origin(self.context.device_id(), self.protocol.id());
        self.protocol.store.add_datum(datum.clone());
        Ok(datum)
    }

    /// Apply setting changes to this protocol's probes in order.
    ///
    /// Stops at the first change that names an unknown probe or fails.
    pub fn apply_settings(&self, changes: &[SettingChange]) -> Result<(), RuntimeError> {
        let probes = self.protocol.probe_handles();
        for change in changes {
            apply_change(&probes, change)?;
        }
        Ok(())
    }

    /// Participation of every probe the configuration enabled, by probe type.
    pub fn participation(&self) -> BTreeMap<String, f64> {
        self.protocol
            .probes
            .iter()
            .filter_map(|probe| {
                probe
                    .participation(self.health_check_interval)
                    .map(|value| (probe.probe_type().to_string(), value))
            })
            .collect()
    }

    /// Add a `participation_report` datum to the protocol's store.
    pub fn participation_report(&self) -> Result<Datum, RuntimeError> {
        let payload = json!({
            "participation_horizon_ms": self.protocol.config.participation_horizon.as_millis() as u64,
            "probe_participation": serde_json::to_value(self.participation())?,
        });
        let payload = match payload {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };

        let datum = Datum::new(PARTICIPATION_REPORT_TYPE, payload)
            .with_origin(self.context.device_id(), self.protocol.id());
        self.protocol.store.add_datum(datum.clone());
        Ok(datum)
    }

    pub fn status(&self) -> ProtocolStatus {
        let store = &self.protocol.store;
        let (sensing_state, settings_applied) = self
            .lock_sensing()
            .as_ref()
            .map_or((None, 0), |runner| (Some(runner.agent().state()), runner.applied()));
        ProtocolStatus {
            id: self.protocol.id().to_string(),
            name: self.protocol.name().to_string(),
            running: self.protocol.is_running(),
            pending: store.pending_count(),
            active_producers: store.active_producers(),
            last_commit: store.last_commit(),
            prompts_delivered: self.lock_runner().as_ref().map_or(0, ScriptRunner::delivered),
            sensing_state,
            settings_applied,
            probes: self.protocol.probes.iter().map(Probe::status).collect(),
        }
    }

    fn start_prompts(&self) -> Result<(), RuntimeError> {
        let Some(prompts) = &self.protocol.config.prompts else {
            return Ok(());
        };
        let agent = prompts
            .agent
            .build()
            .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        let runner = ScriptRunner::start(
            self.context.scheduler().clone(),
            self.context.synchronizer().clone(),
            agent,
            self.protocol.id(),
            prompts.interval,
            prompts.decision_timeout,
            self.prompt_tx.clone(),
        )?;
        *self.lock_runner() = Some(runner);
        Ok(())
    }

    fn start_sensing(&self) -> Result<(), RuntimeError> {
        let Some(sensing) = &self.protocol.config.sensing else {
            return Ok(());
        };
        let agent = sensing
            .agent
            .build()
            .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        self.protocol
            .store
            .set_observer(Some(Arc::new(AgentObserver(agent.clone()))));
        let runner = SensingRunner::start(
            self.context.scheduler().clone(),
            agent,
            sensing.action_interval,
            self.protocol.probe_handles(),
        )?;
        *self.lock_sensing() = Some(runner);
        Ok(())
    }

    fn stop_agents(&self) {
        if let Some(mut runner) = self.lock_runner().take() {
            runner.stop();
        }
        if let Some(mut runner) = self.lock_sensing().take() {
            runner.stop();
        }
        self.protocol.store.set_observer(None);
    }

    fn stop_running_probes(&self) {
        for probe in &self.protocol.probes {
            if probe.state() == ProbeState::Running {
                if let Err(e) = probe.stop() {
                    warn!(probe = %probe.probe_type(), "could not stop probe: {e}");
                }
            }
        }
    }

    fn roll_back(&self) {
        self.stop_agents();
        self.stop_running_probes();
        if let Err(e) = self.protocol.store.stop() {
            error!(protocol = %self.protocol.id(), "could not stop data store during roll back: {e}");
        }
    }

    fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_runner(&self) -> MutexGuard<'_, Option<ScriptRunner>> {
        self.runner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_sensing(&self) -> MutexGuard<'_, Option<SensingRunner>> {
        self.sensing.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for ProtocolController {
    fn drop(&mut self) {
        if self.protocol.is_executing() {
            if let Err(e) = self.halt_protocol() {
                error!(protocol = %self.protocol.id(), "could not halt protocol on drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::config::ProbeConfig;
    use crate::store::{EncryptedBatch, SinkError};
    use std::time::Duration;

    struct NullSink;

    impl CommitSink for NullSink {
        fn name(&self) -> &str {
            "null"
        }
        fn commit(&self, _batch: &EncryptedBatch) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn controller(config: ProtocolConfig) -> ProtocolController {
        let context = RuntimeContext::ephemeral("test-device").unwrap();
        let protocol =
            Protocol::build(config, &ProbeRegistry::builtin(), &context, Arc::new(NullSink)).unwrap();
        ProtocolController::new(protocol, context)
    }

    fn random_probe(failure_rate: f64) -> ProbeConfig {
        let mut probe = ProbeConfig::new("simulated.random");
        probe.polling_interval_ms = Some(20);
        probe.parameters = json!({ "failure_rate": failure_rate })
            .as_object()
            .cloned()
            .unwrap();
        probe
    }

    #[test]
    fn test_execute_and_halt() {
        let mut config = ProtocolConfig::new("t");
        config.probes = vec![random_probe(0.0)];
        let controller = controller(config);

        controller.execute_protocol().unwrap();
        assert!(controller.protocol().is_running());
        assert!(controller.protocol().store().is_running());
        assert_eq!(controller.context().scheduler().pending_count(), 1);

        controller.halt_protocol().unwrap();
        assert!(!controller.protocol().is_running());
        assert!(!controller.protocol().store().is_running());
        assert_eq!(controller.context().scheduler().pending_count(), 0);
        controller.halt_protocol().unwrap();
    }

    #[test]
    fn test_execute_fails_without_startable_probes() {
        let mut config = ProtocolConfig::new("t");
        let mut probe = random_probe(0.0);
        probe.parameters = json!({"min": 5.0, "max": 1.0}).as_object().cloned().unwrap();
        config.probes = vec![probe];
        let controller = controller(config);

        assert!(matches!(controller.execute_protocol(), Err(RuntimeError::Protocol(_))));
        assert!(!controller.protocol().is_running());
        assert!(!controller.protocol().store().is_running());
    }

    #[test]
    fn test_restart_probe_requires_running_protocol() {
        let mut config = ProtocolConfig::new("t");
        config.probes = vec![random_probe(0.0)];
        let controller = controller(config);

        assert!(matches!(
            controller.restart_probe("simulated.random"),
            Err(RuntimeError::InvalidOperation(_))
        ));
        controller.execute_protocol().unwrap();
        controller.restart_probe("simulated.random").unwrap();
        assert!(matches!(controller.restart_probe("gps"), Err(RuntimeError::Protocol(_))));
        controller.halt_protocol().unwrap();
    }

    #[test]
    fn test_health_restarts_stopped_enabled_probe() {
        let mut config = ProtocolConfig::new("t");
        config.probes = vec![random_probe(0.0)];
        let controller = controller(config);
        controller.execute_protocol().unwrap();

        let probe = controller.protocol().probe("simulated.random").unwrap();
        probe.stop().unwrap();

        let health = controller.test_health();
        assert_eq!(health.restarted, vec!["simulated.random".to_string()]);
        assert_eq!(probe.state(), ProbeState::Running);
        controller.halt_protocol().unwrap();
    }

    #[test]
    fn test_health_leaves_exhausted_probe_disabled() {
        let mut config = ProtocolConfig::new("t");
        let mut failing = random_probe(1.0);
        failing.failure_threshold = 2;
        let mut healthy = ProbeConfig::new("simulated.stream");
        healthy.parameters = json!({"period_ms": 10}).as_object().cloned().unwrap();
        config.probes = vec![failing, healthy];
        let controller = controller(config);
        controller.execute_protocol().unwrap();

        std::thread::sleep(Duration::from_millis(200));
        let failing = controller.protocol().probe("simulated.random").unwrap();
        assert!(!failing.is_enabled());

        let health = controller.test_health();
        assert!(health.restarted.is_empty());
        assert_eq!(failing.state(), ProbeState::Stopped);
        assert!(controller.protocol().is_running());
        controller.halt_protocol().unwrap();
    }

    #[test]
    fn test_all_probes_exhausted_stops_running_but_keeps_committing() {
        let mut config = ProtocolConfig::new("t");
        config.commit_interval = Duration::from_millis(100);
        let mut failing = random_probe(1.0);
        failing.failure_threshold = 2;
        config.probes = vec![failing];
        let controller = controller(config);
        controller.execute_protocol().unwrap();

        std::thread::sleep(Duration::from_millis(200));
        let probe = controller.protocol().probe("simulated.random").unwrap();
        assert!(!probe.is_enabled());
        assert!(!controller.protocol().is_running());
        assert!(!controller.status().running);

        // Data added after the last producer left still reaches the sink.
        controller.report().unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(controller.protocol().store().pending_count(), 0);

        let health = controller.test_health();
        assert!(!health.running);
        assert!(!health.is_healthy());
        assert!(!controller.protocol().store().is_running());
    }

    #[test]
    fn test_report_adds_protocol_datum() {
        let mut config = ProtocolConfig::new("t");
        config.probes = vec![random_probe(0.0)];
        let controller = controller(config);

        let datum = controller.report().unwrap();
        assert_eq!(datum.probe_type(), PROTOCOL_REPORT_TYPE);
        assert_eq!(datum.protocol_id(), Some(controller.protocol().id()));
        assert_eq!(datum.field("running"), Some(&json!(false)));
        assert_eq!(controller.protocol().store().pending_count(), 1);
    }

    fn constant_probe(value: f64, interval_ms: u64) -> ProbeConfig {
        let mut probe = ProbeConfig::new("simulated.random");
        probe.polling_interval_ms = Some(interval_ms);
        probe.parameters = json!({ "min": value, "max": value })
            .as_object()
            .cloned()
            .unwrap();
        probe
    }

    fn stream_probe() -> ProbeConfig {
        let mut probe = ProbeConfig::new("simulated.stream");
        probe.parameters = json!({"period_ms": 10}).as_object().cloned().unwrap();
        probe
    }

    #[test]
    fn test_sensing_agent_speeds_up_polling() {
        let mut config = ProtocolConfig::new("adaptive");
        config.probes = vec![constant_probe(50.0, 1_000)];
        config.sensing = serde_json::from_value(json!({
            "action_interval_ms": 50,
            "agent": "rule",
            "policy": {
                "statements": [{
                    "id": "busy",
                    "criterion": {
                        "logic": "conjunction",
                        "elements": [{
                            "probe_type": "simulated.random",
                            "field": "value",
                            "aggregation": "most_recent",
                            "relation": "greater_than_or_equal_to",
                            "target": 50
                        }]
                    },
                    "begin_control": [
                        {"probe_type": "simulated.random", "setting": "polling_interval_ms", "value": 20}
                    ]
                }]
            }
        }))
        .unwrap();
        let controller = controller(config);
        controller.execute_protocol().unwrap();

        std::thread::sleep(Duration::from_millis(400));
        let probe = controller.protocol().probe("simulated.random").unwrap();
        assert_eq!(probe.status().polling_interval_ms, Some(20));
        assert_eq!(probe.state(), ProbeState::Running);
        assert!(probe.status().stored >= 5);

        let status = controller.status();
        assert_eq!(status.sensing_state, Some(SensingState::Control));
        assert_eq!(status.settings_applied, 1);

        controller.halt_protocol().unwrap();
        assert_eq!(controller.status().sensing_state, None);
        assert_eq!(controller.context().scheduler().pending_count(), 0);
    }

    #[test]
    fn test_apply_settings() {
        let mut config = ProtocolConfig::new("t");
        config.probes = vec![random_probe(0.0), stream_probe()];
        let controller = controller(config);
        controller.execute_protocol().unwrap();

        controller
            .apply_settings(&[SettingChange::new(
                "simulated.random",
                crate::probe::ProbeSetting::Enabled { value: false },
            )])
            .unwrap();
        let probe = controller.protocol().probe("simulated.random").unwrap();
        assert_eq!(probe.state(), ProbeState::Stopped);
        assert!(controller.protocol().is_running());

        let unknown = SettingChange::new("gps", crate::probe::ProbeSetting::Enabled { value: true });
        assert!(matches!(
            controller.apply_settings(&[unknown]),
            Err(RuntimeError::Protocol(_))
        ));
        controller.halt_protocol().unwrap();
    }

    #[test]
    fn test_participation_report() {
        let mut config = ProtocolConfig::new("t");
        config.participation_horizon = Duration::from_secs(1);
        let mut disabled = stream_probe();
        disabled.enabled = false;
        config.probes = vec![random_probe(0.0), disabled];
        let controller = controller(config);
        controller.execute_protocol().unwrap();
        std::thread::sleep(Duration::from_millis(300));
        controller.halt_protocol().unwrap();

        let datum = controller.participation_report().unwrap();
        assert_eq!(datum.probe_type(), PARTICIPATION_REPORT_TYPE);
        assert_eq!(datum.field("participation_horizon_ms"), Some(&json!(1_000)));

        let participation = datum.field("probe_participation").unwrap();
        assert!(participation.get("simulated.stream").is_none());
        let random = participation["simulated.random"].as_f64().unwrap();
        assert!(random > 0.1 && random <= 1.0, "{random}");
    }

    #[test]
    fn test_health_tests_count_toward_listening_participation() {
        let mut config = ProtocolConfig::new("t");
        config.participation_horizon = Duration::from_secs(1);
        config.probes = vec![stream_probe()];
        let controller = controller(config).with_health_check_interval(Duration::from_millis(250));
        controller.execute_protocol().unwrap();

        assert_eq!(controller.participation()["simulated.stream"], 0.0);
        controller.test_health();
        controller.test_health();
        assert_eq!(controller.participation()["simulated.stream"], 0.5);
        controller.halt_protocol().unwrap();
    }
}
