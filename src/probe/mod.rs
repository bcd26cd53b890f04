//! Lifecycle-managed producers of datums.
//!
//! A [`Probe`] moves through `Uninitialized → Initialized → Running → Stopped`
//! and can be restarted from `Stopped`. Polling probes register a repeating
//! scheduler callback; listening probes subscribe to a push source and drain
//! its channel on a dedicated thread.
//!
//! Failures are classified:
//! - initialization failure disables the probe,
//! - a failed capture cycle is logged and retried on the next cycle,
//! - reaching the consecutive failure threshold disables the probe.
//!
//! Participation is the share of expected activity a probe delivered over the
//! protocol's participation horizon. Polling probes count successful polls
//! against their interval. Listening probes count passed health tests against
//! the health check interval.

pub mod rate;
pub mod setting;
pub mod simulated;
pub mod source;

pub use rate::RateLimiter;
pub use setting::{ProbeSetting, SettingChange};
pub use simulated::{RandomSource, StreamSource};
pub use source::{
    CaptureContext, CaptureError, ListeningSource, PollingSource, RawReading, ReadingEvent,
};

use crate::datum::Datum;
use crate::error::RuntimeError;
use crate::health::HealthReport;
use crate::scheduler::{CallbackHandle, CallbackScheduler, CancelFlag};
use crate::store::DataStore;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Arrival times kept for the observed rate.
const ARRIVAL_WINDOW: usize = 256;

/// How often a listening probe's drain loop checks for cancellation.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Upper bound on activity marks kept for participation.
const MAX_PARTICIPATION_MARKS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

impl std::fmt::Display for ProbeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProbeState::Uninitialized => "uninitialized",
            ProbeState::Initialized => "initialized",
            ProbeState::Running => "running",
            ProbeState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How a probe obtains readings.
#[derive(Clone)]
pub enum ProbeKind {
    Polling {
        source: Arc<dyn PollingSource>,
        interval: Duration,
    },
    Listening {
        source: Arc<dyn ListeningSource>,
    },
}

impl ProbeKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProbeKind::Polling { .. } => "polling",
            ProbeKind::Listening { .. } => "listening",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// `None` is unlimited; `0` drops everything.
    pub max_data_per_second: Option<f64>,
    /// Consecutive failed cycles before the probe disables itself.
    pub failure_threshold: u32,
    /// Upper bound on a single polling capture.
    pub capture_timeout: Duration,
    /// How long `stop` waits for an in-flight capture.
    pub stop_grace: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            max_data_per_second: None,
            failure_threshold: 3,
            capture_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// What a probe is wired to.
#[derive(Clone)]
pub struct ProbeLinks {
    pub store: Arc<DataStore>,
    pub scheduler: Arc<CallbackScheduler>,
    pub device_id: String,
    pub protocol_id: String,
    /// How far back participation looks.
    pub participation_horizon: Duration,
}

/// Point-in-time view of a probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeStatus {
    pub probe_type: String,
    pub kind: &'static str,
    pub state: ProbeState,
    pub enabled: bool,
    pub polling_interval_ms: Option<u64>,
    pub max_data_per_second: Option<f64>,
    pub stored: u64,
    pub dropped_rate_limit: u64,
    pub consecutive_failures: u32,
    pub last_failure: Option<String>,
    pub last_datum_at: Option<DateTime<Utc>>,
    /// Mean rate over recent stored datums.
    pub observed_rate_per_second: Option<f64>,
}

struct Lifecycle {
    state: ProbeState,
    enabled: bool,
    /// Enabled by configuration. Unlike `enabled`, failures never clear it.
    configured: bool,
    cancel: CancelFlag,
    callback: Option<CallbackHandle>,
    listener: Option<JoinHandle<()>>,
    producing: bool,
    started_at: Option<DateTime<Utc>>,
    last_failure: Option<String>,
}

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

struct InFlightGuard<'a>(&'a InFlight);

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        *self.count.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        InFlightGuard(self)
    }

    /// Wait until no capture is running. Returns false on timeout.
    fn wait_idle(&self, grace: Duration) -> bool {
        let count = self.count.lock().unwrap_or_else(|p| p.into_inner());
        let (count, _) = self
            .idle
            .wait_timeout_while(count, grace, |n| *n > 0)
            .unwrap_or_else(|p| p.into_inner());
        *count == 0
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(|p| p.into_inner());
        *count = count.saturating_sub(1);
        self.0.idle.notify_all();
    }
}

struct ProbeCore {
    probe_type: String,
    kind: ProbeKind,
    settings: ProbeSettings,
    links: ProbeLinks,
    lifecycle: Mutex<Lifecycle>,
    limiter: Mutex<RateLimiter>,
    /// Held for reading while datums are emitted; `stop` takes it for writing.
    emit_gate: RwLock<()>,
    in_flight: InFlight,
    /// Zero for listening probes.
    polling_interval_ms: AtomicU64,
    participation: Mutex<VecDeque<DateTime<Utc>>>,
    stored: AtomicU64,
    dropped: AtomicU64,
    consecutive_failures: AtomicU32,
    arrivals: Mutex<VecDeque<DateTime<Utc>>>,
    last_capture: Mutex<Option<DateTime<Utc>>>,
}

/// A lifecycle-managed producer of datums.
pub struct Probe {
    core: Arc<ProbeCore>,
}

impl Probe {
    pub fn new(
        probe_type: impl Into<String>,
        kind: ProbeKind,
        settings: ProbeSettings,
        links: ProbeLinks,
    ) -> Self {
        let limiter = RateLimiter::new(settings.max_data_per_second);
        let polling_interval_ms = match &kind {
            ProbeKind::Polling { interval, .. } => interval.as_millis() as u64,
            ProbeKind::Listening { .. } => 0,
        };
        Self {
            core: Arc::new(ProbeCore {
                probe_type: probe_type.into(),
                kind,
                settings,
                links,
                lifecycle: Mutex::new(Lifecycle {
                    state: ProbeState::Uninitialized,
                    enabled: true,
                    configured: true,
                    cancel: CancelFlag::new(),
                    callback: None,
                    listener: None,
                    producing: false,
                    started_at: None,
                    last_failure: None,
                }),
                limiter: Mutex::new(limiter),
                emit_gate: RwLock::new(()),
                in_flight: InFlight::default(),
                polling_interval_ms: AtomicU64::new(polling_interval_ms),
                participation: Mutex::new(VecDeque::new()),
                stored: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
                arrivals: Mutex::new(VecDeque::with_capacity(ARRIVAL_WINDOW)),
                last_capture: Mutex::new(None),
            }),
        }
    }

    pub fn probe_type(&self) -> &str {
        &self.core.probe_type
    }

    pub fn kind(&self) -> &ProbeKind {
        &self.core.kind
    }

    pub fn state(&self) -> ProbeState {
        self.core.lifecycle().state
    }

    pub fn is_enabled(&self) -> bool {
        self.core.lifecycle().enabled
    }

    /// Enable or disable the probe. A disabled probe cannot be started.
    pub fn set_enabled(&self, enabled: bool) {
        self.core.set_enabled(enabled);
    }

    /// Acquire one-time resources. On failure the probe stays
    /// `Uninitialized` and is disabled.
    pub fn initialize(&self) -> Result<(), RuntimeError> {
        self.core.initialize()
    }

    /// Begin producing. A no-op if already running.
    pub fn start(&self) -> Result<(), RuntimeError> {
        self.core.start()
    }

    /// Stop producing. In-flight captures are cancelled and emit nothing further.
    pub fn stop(&self) -> Result<(), RuntimeError> {
        self.core.stop()
    }

    /// Stop (if running) then start again, feeding the same store.
    pub fn restart(&self) -> Result<(), RuntimeError> {
        if self.state() == ProbeState::Running {
            self.core.stop()?;
        }
        self.core.start()
    }

    pub fn ping(&self) -> HealthReport {
        self.core.ping()
    }

    pub fn status(&self) -> ProbeStatus {
        self.core.status()
    }

    /// Fraction of expected activity within the participation horizon, in `[0, 1]`.
    ///
    /// `None` for a probe the configuration disabled. `health_check_interval`
    /// is the cadence listening probes are measured against.
    pub fn participation(&self, health_check_interval: Duration) -> Option<f64> {
        self.core.participation(health_check_interval)
    }

    /// Note a passed health test. Counts toward a listening probe's participation.
    pub fn record_health_test(&self) {
        if matches!(self.core.kind, ProbeKind::Listening { .. }) && self.state() == ProbeState::Running {
            self.core.mark_participation(Utc::now());
        }
    }

    /// Apply a runtime setting change.
    pub fn apply_setting(&self, setting: &ProbeSetting) -> Result<(), RuntimeError> {
        self.core.apply_setting(setting)
    }

    /// A handle that can change this probe's settings without owning it.
    pub fn handle(&self) -> ProbeHandle {
        ProbeHandle {
            probe_type: self.core.probe_type.clone(),
            core: Arc::downgrade(&self.core),
        }
    }
}

/// Weak reference to a probe, for applying settings from scheduler callbacks.
#[derive(Clone)]
pub struct ProbeHandle {
    probe_type: String,
    core: Weak<ProbeCore>,
}

impl ProbeHandle {
    pub fn probe_type(&self) -> &str {
        &self.probe_type
    }

    /// Fails with [`RuntimeError::InvalidOperation`] once the probe is gone.
    pub fn apply(&self, setting: &ProbeSetting) -> Result<(), RuntimeError> {
        let core = self.core.upgrade().ok_or_else(|| {
            RuntimeError::InvalidOperation(format!("probe '{}' no longer exists", self.probe_type))
        })?;
        core.apply_setting(setting)
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        if self.state() == ProbeState::Running {
            if let Err(e) = self.core.stop() {
                warn!(probe = %self.core.probe_type, "could not stop probe on drop: {e}");
            }
        }
    }
}

impl ProbeCore {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_enabled(&self, enabled: bool) {
        let mut lifecycle = self.lifecycle();
        lifecycle.enabled = enabled;
        lifecycle.configured = enabled;
    }

    fn polling_interval(&self) -> Option<Duration> {
        match self.polling_interval_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn initialize(&self) -> Result<(), RuntimeError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != ProbeState::Uninitialized {
            return Ok(());
        }

        let result = match &self.kind {
            ProbeKind::Polling { source, .. } => source.initialize(),
            ProbeKind::Listening { source } => source.initialize(),
        };

        match result {
            Ok(()) => {
                lifecycle.state = ProbeState::Initialized;
                debug!(probe = %self.probe_type, "probe initialized");
                Ok(())
            }
            Err(reason) => {
                lifecycle.enabled = false;
                lifecycle.last_failure = Some(reason.clone());
                let err = RuntimeError::Initialization {
                    probe: self.probe_type.clone(),
                    reason,
                };
                warn!("{err}; probe disabled");
                Err(err)
            }
        }
    }

    fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        let mut lifecycle = self.lifecycle();
        match lifecycle.state {
            ProbeState::Running => return Ok(()),
            ProbeState::Uninitialized => {
                return Err(RuntimeError::InvalidOperation(format!(
                    "probe '{}' has not been initialized",
                    self.probe_type
                )))
            }
            ProbeState::Initialized | ProbeState::Stopped => {}
        }
        if !lifecycle.enabled {
            return Err(RuntimeError::InvalidOperation(format!(
                "probe '{}' is disabled",
                self.probe_type
            )));
        }

        let cancel = CancelFlag::new();
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.lock_limiter().reset();
        self.links.store.register_producer();

        let started = match &self.kind {
            ProbeKind::Polling { interval, .. } => {
                let interval = self.polling_interval().unwrap_or(*interval);
                self.start_polling(interval, &cancel).map(|handle| {
                    lifecycle.callback = Some(handle);
                })
            }
            ProbeKind::Listening { source } => {
                self.start_listening(source.clone(), &cancel).map(|handle| {
                    lifecycle.listener = Some(handle);
                })
            }
        };
        if let Err(e) = started {
            self.links.store.release_producer();
            return Err(e);
        }

        lifecycle.cancel = cancel;
        lifecycle.producing = true;
        lifecycle.started_at = Some(Utc::now());
        lifecycle.state = ProbeState::Running;
        info!(probe = %self.probe_type, kind = self.kind.label(), "probe started");
        Ok(())
    }

    fn start_polling(
        self: &Arc<Self>,
        interval: Duration,
        cancel: &CancelFlag,
    ) -> Result<CallbackHandle, RuntimeError> {
        let weak: Weak<ProbeCore> = Arc::downgrade(self);
        let run = cancel.clone();
        self.links.scheduler.schedule_repeating(
            &format!("probe-{}", self.probe_type),
            Duration::ZERO,
            interval,
            move |_| {
                if let Some(core) = weak.upgrade() {
                    core.poll_once(&run);
                }
            },
        )
    }

    fn start_listening(
        self: &Arc<Self>,
        source: Arc<dyn ListeningSource>,
        cancel: &CancelFlag,
    ) -> Result<JoinHandle<()>, RuntimeError> {
        let (events, readings) = bounded(10_000);
        source
            .subscribe(events)
            .map_err(|e| RuntimeError::TransientCapture {
                probe: self.probe_type.clone(),
                reason: format!("subscribe failed: {e}"),
            })?;

        let weak = Arc::downgrade(self);
        let run = cancel.clone();
        let drain_source = source.clone();
        thread::Builder::new()
            .name(format!("probe-{}", self.probe_type))
            .spawn(move || drain(weak, drain_source, readings, run))
            .map_err(|e| {
                source.unsubscribe();
                RuntimeError::Io(e)
            })
    }

    fn stop(&self) -> Result<(), RuntimeError> {
        let (listener, producing) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != ProbeState::Running {
                return Err(RuntimeError::InvalidOperation(format!(
                    "probe '{}' is {} and cannot be stopped",
                    self.probe_type, lifecycle.state
                )));
            }
            lifecycle.cancel.cancel();
            if let Some(handle) = lifecycle.callback.take() {
                self.links.scheduler.cancel(&handle);
            }
            lifecycle.state = ProbeState::Stopped;
            (
                lifecycle.listener.take(),
                std::mem::take(&mut lifecycle.producing),
            )
        };

        // Past this point no datum from the old run reaches the store.
        drop(self.emit_gate.write().unwrap_or_else(|p| p.into_inner()));

        if !self.in_flight.wait_idle(self.settings.stop_grace) {
            warn!(
                probe = %self.probe_type,
                grace_ms = self.settings.stop_grace.as_millis() as u64,
                "capture still in flight after grace period, its results will be discarded"
            );
        }
        if let Some(handle) = listener {
            if handle.join().is_err() {
                error!(probe = %self.probe_type, "listener thread panicked");
            }
        }
        if producing {
            self.links.store.release_producer();
        }

        info!(probe = %self.probe_type, "probe stopped");
        Ok(())
    }

    fn poll_once(&self, cancel: &CancelFlag) {
        let ProbeKind::Polling { source, .. } = &self.kind else {
            return;
        };
        let _in_flight = self.in_flight.enter();
        if cancel.is_cancelled() {
            return;
        }

        let timeout = self.settings.capture_timeout;
        let deadline = Instant::now() + timeout;
        let result = source.poll(&CaptureContext { cancel, deadline });
        if cancel.is_cancelled() {
            return;
        }

        match result {
            Ok(_) if Instant::now() > deadline => self.record_failure(CaptureError::Timeout(timeout)),
            Ok(readings) => {
                self.record_success();
                self.mark_participation(Utc::now());
                self.emit(readings, cancel);
            }
            Err(e) => self.record_failure(e),
        }
    }

    fn emit(&self, readings: Vec<RawReading>, cancel: &CancelFlag) {
        let _gate = self.emit_gate.read().unwrap_or_else(|p| p.into_inner());
        if cancel.is_cancelled() {
            return;
        }

        let mut limiter = self.lock_limiter();
        for reading in readings {
            if !limiter.admit(reading.timestamp) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.links.store.stats().record_rate_limited();
                continue;
            }

            let datum = Datum::at(&self.probe_type, reading.timestamp, reading.fields)
                .with_origin(&self.links.device_id, &self.links.protocol_id);
            self.links.store.add_datum(datum);
            self.stored.fetch_add(1, Ordering::Relaxed);

            let mut arrivals = self.arrivals.lock().unwrap_or_else(|p| p.into_inner());
            if arrivals.len() == ARRIVAL_WINDOW {
                arrivals.pop_front();
            }
            arrivals.push_back(reading.timestamp);
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if let Ok(mut last) = self.last_capture.lock() {
            *last = Some(Utc::now());
        }
    }

    fn record_failure(&self, error: CaptureError) {
        self.links.store.stats().record_capture_failure();
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.lifecycle().last_failure = Some(error.to_string());

        let err = RuntimeError::TransientCapture {
            probe: self.probe_type.clone(),
            reason: error.to_string(),
        };
        warn!(failures, "{err}");

        if failures >= self.settings.failure_threshold {
            self.disable_after_exhaustion(failures);
        }
    }

    /// Runs on a capture thread, so it must not wait for captures to finish.
    fn disable_after_exhaustion(&self, failures: u32) {
        let producing = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != ProbeState::Running {
                return;
            }
            lifecycle.enabled = false;
            lifecycle.cancel.cancel();
            if let Some(handle) = lifecycle.callback.take() {
                self.links.scheduler.cancel(&handle);
            }
            // The drain thread exits on its own once cancelled.
            lifecycle.listener.take();
            lifecycle.state = ProbeState::Stopped;
            std::mem::take(&mut lifecycle.producing)
        };
        if producing {
            self.links.store.release_producer();
        }

        let err = RuntimeError::ResourceExhaustion {
            probe: self.probe_type.clone(),
            failures,
        };
        error!("{err}");
    }

    fn ping(&self) -> HealthReport {
        let mut report = HealthReport::new(format!("probe {}", self.probe_type));
        let (state, enabled, started_at, last_failure) = {
            let lifecycle = self.lifecycle();
            (
                lifecycle.state,
                lifecycle.enabled,
                lifecycle.started_at,
                lifecycle.last_failure.clone(),
            )
        };

        if !enabled {
            report.warn(match last_failure {
                Some(reason) => format!("disabled after failure: {reason}"),
                None => "disabled".to_string(),
            });
            return report;
        }
        if state != ProbeState::Running {
            report.error(format!("not running ({state})"));
            report.restart_required = true;
            return report;
        }

        if let Some(interval) = self.polling_interval() {
            let allowed = chrono::Duration::from_std(interval + self.settings.capture_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(1));
            let last = self
                .last_capture
                .lock()
                .ok()
                .and_then(|t| *t)
                .or(started_at);
            if let Some(last) = last {
                if Utc::now() - last > allowed {
                    report.warn(format!(
                        "no successful capture since {}",
                        last.to_rfc3339()
                    ));
                }
            }
        }
        report
    }

    fn status(&self) -> ProbeStatus {
        let (state, enabled, last_failure) = {
            let lifecycle = self.lifecycle();
            (lifecycle.state, lifecycle.enabled, lifecycle.last_failure.clone())
        };
        let arrivals = self.arrivals.lock().unwrap_or_else(|p| p.into_inner());

        let gaps: Vec<f64> = arrivals
            .iter()
            .zip(arrivals.iter().skip(1))
            .map(|(a, b)| (*b - *a).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0)
            .collect();
        let observed_rate_per_second = if gaps.is_empty() {
            None
        } else {
            let mean_gap = gaps.iter().mean();
            (mean_gap > 0.0).then(|| 1.0 / mean_gap)
        };

        ProbeStatus {
            probe_type: self.probe_type.clone(),
            kind: self.kind.label(),
            state,
            enabled,
            polling_interval_ms: self.polling_interval().map(|i| i.as_millis() as u64),
            max_data_per_second: self.lock_limiter().max_per_second(),
            stored: self.stored.load(Ordering::Relaxed),
            dropped_rate_limit: self.dropped.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_failure,
            last_datum_at: arrivals.back().copied(),
            observed_rate_per_second,
        }
    }

    fn lock_limiter(&self) -> MutexGuard<'_, RateLimiter> {
        self.limiter.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_participation(&self) -> MutexGuard<'_, VecDeque<DateTime<Utc>>> {
        self.participation.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn horizon_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let horizon = chrono::Duration::from_std(self.links.participation_horizon)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        now - horizon
    }

    fn mark_participation(&self, at: DateTime<Utc>) {
        let cutoff = self.horizon_start(at);
        let mut marks = self.lock_participation();
        while marks.front().is_some_and(|t| *t < cutoff) {
            marks.pop_front();
        }
        if marks.len() == MAX_PARTICIPATION_MARKS {
            marks.pop_front();
        }
        marks.push_back(at);
    }

    fn participation(&self, health_check_interval: Duration) -> Option<f64> {
        if !self.lifecycle().configured {
            return None;
        }
        let period = self.polling_interval().unwrap_or(health_check_interval);
        let horizon = self.links.participation_horizon;
        if period.is_zero() || horizon.is_zero() {
            return Some(0.0);
        }

        let cutoff = self.horizon_start(Utc::now());
        let observed = self.lock_participation().iter().filter(|t| **t >= cutoff).count();
        let expected = (horizon.as_secs_f64() / period.as_secs_f64()).min(MAX_PARTICIPATION_MARKS as f64);
        Some((observed as f64 / expected).min(1.0))
    }

    fn apply_setting(self: &Arc<Self>, setting: &ProbeSetting) -> Result<(), RuntimeError> {
        let invalid = |reason: String| {
            RuntimeError::InvalidOperation(format!("probe '{}': {reason}", self.probe_type))
        };
        setting.validate().map_err(invalid)?;

        match setting {
            ProbeSetting::MaxDataPerSecond { value } => {
                self.lock_limiter().set_rate(*value);
            }
            ProbeSetting::PollingIntervalMs { value } => {
                if self.polling_interval().is_none() {
                    return Err(invalid("polling interval set on a listening probe".to_string()));
                }
                self.polling_interval_ms.store(*value, Ordering::SeqCst);
                if self.lifecycle().state == ProbeState::Running {
                    self.stop()?;
                    self.start()?;
                }
            }
            ProbeSetting::Enabled { value: false } => {
                self.set_enabled(false);
                if self.lifecycle().state == ProbeState::Running {
                    self.stop()?;
                }
            }
            ProbeSetting::Enabled { value: true } => {
                self.set_enabled(true);
                if self.links.store.is_running() {
                    self.initialize()?;
                    self.start()?;
                }
            }
        }
        info!(probe = %self.probe_type, ?setting, "setting applied");
        Ok(())
    }
}

/// Drain a listening source's channel until cancelled, then unsubscribe.
fn drain(
    core: Weak<ProbeCore>,
    source: Arc<dyn ListeningSource>,
    readings: Receiver<ReadingEvent>,
    cancel: CancelFlag,
) {
    while !cancel.is_cancelled() {
        match readings.recv_timeout(DRAIN_POLL) {
            Ok(event) => {
                let Some(core) = core.upgrade() else {
                    break;
                };
                let _in_flight = core.in_flight.enter();
                match event {
                    Ok(reading) => {
                        core.record_success();
                        core.emit(vec![reading], &cancel);
                    }
                    Err(e) => core.record_failure(e),
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // Dropping the receiver first unblocks a source stuck on a full channel.
    drop(readings);
    source.unsubscribe();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::SymmetricEncryption;
    use crate::scheduler::NoopWakeBackend;
    use crate::store::{EncryptedBatch, SinkError, StoreSettings};
    use crate::store::CommitSink;
    use serde_json::{json, Map};
    use std::sync::atomic::AtomicBool;

    struct NullSink;

    impl CommitSink for NullSink {
        fn name(&self) -> &str {
            "null"
        }
        fn commit(&self, _batch: &EncryptedBatch) -> Result<(), SinkError> {
            Ok(())
        }
    }

    struct ScriptedSource {
        fail_init: bool,
        fail_polls: AtomicBool,
        delay: Duration,
    }

    impl ScriptedSource {
        fn ok() -> Self {
            Self {
                fail_init: false,
                fail_polls: AtomicBool::new(false),
                delay: Duration::ZERO,
            }
        }
    }

    impl PollingSource for ScriptedSource {
        fn initialize(&self) -> Result<(), String> {
            if self.fail_init {
                Err("permission denied".to_string())
            } else {
                Ok(())
            }
        }

        fn poll(&self, _ctx: &CaptureContext<'_>) -> Result<Vec<RawReading>, CaptureError> {
            thread::sleep(self.delay);
            if self.fail_polls.load(Ordering::SeqCst) {
                return Err(CaptureError::Transient("sensor busy".to_string()));
            }
            let mut fields = Map::new();
            fields.insert("x".to_string(), json!(1));
            Ok(vec![RawReading::now(fields)])
        }
    }

    fn links() -> ProbeLinks {
        ProbeLinks {
            store: Arc::new(DataStore::new(
                StoreSettings::default(),
                Arc::new(NullSink),
                SymmetricEncryption::new(""),
            )),
            scheduler: Arc::new(CallbackScheduler::new(Arc::new(NoopWakeBackend)).unwrap()),
            device_id: "device".to_string(),
            protocol_id: "protocol".to_string(),
            participation_horizon: Duration::from_secs(1),
        }
    }

    fn polling(source: ScriptedSource, interval_ms: u64, settings: ProbeSettings) -> (Probe, ProbeLinks) {
        let links = links();
        let probe = Probe::new(
            "scripted",
            ProbeKind::Polling {
                source: Arc::new(source),
                interval: Duration::from_millis(interval_ms),
            },
            settings,
            links.clone(),
        );
        (probe, links)
    }

    #[test]
    fn test_initialization_failure_disables() {
        let source = ScriptedSource {
            fail_init: true,
            ..ScriptedSource::ok()
        };
        let (probe, _) = polling(source, 50, ProbeSettings::default());

        assert!(matches!(probe.initialize(), Err(RuntimeError::Initialization { .. })));
        assert_eq!(probe.state(), ProbeState::Uninitialized);
        assert!(!probe.is_enabled());
        assert!(matches!(probe.start(), Err(RuntimeError::InvalidOperation(_))));
    }

    #[test]
    fn test_start_twice_registers_once() {
        let (probe, links) = polling(ScriptedSource::ok(), 50, ProbeSettings::default());
        probe.initialize().unwrap();
        probe.start().unwrap();
        probe.start().unwrap();

        assert_eq!(probe.state(), ProbeState::Running);
        assert_eq!(links.scheduler.pending_count(), 1);
        assert_eq!(links.store.active_producers(), 1);

        probe.stop().unwrap();
        assert_eq!(probe.state(), ProbeState::Stopped);
        assert_eq!(links.scheduler.pending_count(), 0);
        assert_eq!(links.store.active_producers(), 0);
        assert!(matches!(probe.stop(), Err(RuntimeError::InvalidOperation(_))));
    }

    #[test]
    fn test_polling_produces_datums_with_origin() {
        let (probe, links) = polling(ScriptedSource::ok(), 10, ProbeSettings::default());
        probe.initialize().unwrap();
        probe.start().unwrap();
        thread::sleep(Duration::from_millis(80));
        probe.stop().unwrap();

        let status = probe.status();
        assert!(status.stored >= 2);
        assert_eq!(links.store.pending_count() as u64, status.stored);
        assert!(status.observed_rate_per_second.is_some());
    }

    #[test]
    fn test_consecutive_failures_disable_probe() {
        let source = ScriptedSource::ok();
        source.fail_polls.store(true, Ordering::SeqCst);
        let settings = ProbeSettings {
            failure_threshold: 3,
            ..ProbeSettings::default()
        };
        let (probe, links) = polling(source, 10, settings);
        probe.initialize().unwrap();
        probe.start().unwrap();
        thread::sleep(Duration::from_millis(200));

        assert_eq!(probe.state(), ProbeState::Stopped);
        assert!(!probe.is_enabled());
        assert_eq!(links.store.active_producers(), 0);
        assert_eq!(links.scheduler.pending_count(), 0);
        assert_eq!(probe.status().consecutive_failures, 3);
    }

    #[test]
    fn test_transient_failure_keeps_running() {
        let source = Arc::new(ScriptedSource::ok());
        source.fail_polls.store(true, Ordering::SeqCst);
        let settings = ProbeSettings {
            failure_threshold: 1000,
            ..ProbeSettings::default()
        };
        let links = links();
        let probe = Probe::new(
            "flaky",
            ProbeKind::Polling {
                source: source.clone(),
                interval: Duration::from_millis(10),
            },
            settings,
            links,
        );
        probe.initialize().unwrap();
        probe.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(probe.state(), ProbeState::Running);

        source.fail_polls.store(false, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(probe.status().consecutive_failures, 0);
        probe.stop().unwrap();
    }

    #[test]
    fn test_zero_rate_drops_everything() {
        let settings = ProbeSettings {
            max_data_per_second: Some(0.0),
            ..ProbeSettings::default()
        };
        let (probe, links) = polling(ScriptedSource::ok(), 10, settings);
        probe.initialize().unwrap();
        probe.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        probe.stop().unwrap();

        let status = probe.status();
        assert_eq!(status.stored, 0);
        assert!(status.dropped_rate_limit > 0);
        assert_eq!(links.store.pending_count(), 0);
        assert_eq!(links.store.stats().stats().data_dropped_rate_limit, status.dropped_rate_limit);
    }

    #[test]
    fn test_stop_discards_in_flight_capture() {
        let source = ScriptedSource {
            delay: Duration::from_millis(100),
            ..ScriptedSource::ok()
        };
        let (probe, links) = polling(source, 1000, ProbeSettings::default());
        probe.initialize().unwrap();
        probe.start().unwrap();
        thread::sleep(Duration::from_millis(30));

        probe.stop().unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(links.store.pending_count(), 0);
    }

    #[test]
    fn test_listening_probe_drains_stream() {
        let links = links();
        let probe = Probe::new(
            "stream",
            ProbeKind::Listening {
                source: Arc::new(StreamSource::new(Duration::from_millis(5))),
            },
            ProbeSettings::default(),
            links.clone(),
        );
        probe.initialize().unwrap();
        probe.start().unwrap();
        thread::sleep(Duration::from_millis(80));
        probe.stop().unwrap();

        let after_stop = links.store.pending_count();
        assert!(after_stop >= 2);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(links.store.pending_count(), after_stop);
        assert_eq!(links.store.active_producers(), 0);
    }

    #[test]
    fn test_restart_from_stopped_and_ping() {
        let (probe, _links) = polling(ScriptedSource::ok(), 50, ProbeSettings::default());
        probe.initialize().unwrap();
        probe.start().unwrap();
        probe.stop().unwrap();

        let report = probe.ping();
        assert!(report.restart_required);

        probe.restart().unwrap();
        assert_eq!(probe.state(), ProbeState::Running);
        probe.restart().unwrap();
        assert_eq!(probe.state(), ProbeState::Running);
        assert!(probe.ping().is_healthy());
        probe.stop().unwrap();
    }

    #[test]
    fn test_polling_participation_counts_successful_polls() {
        let (probe, _links) = polling(ScriptedSource::ok(), 100, ProbeSettings::default());
        probe.initialize().unwrap();
        assert_eq!(probe.participation(Duration::from_secs(60)), Some(0.0));

        probe.start().unwrap();
        thread::sleep(Duration::from_millis(450));
        probe.stop().unwrap();

        // Ten polls fit in the one-second horizon; about five ran.
        let participation = probe.participation(Duration::from_secs(60)).unwrap();
        assert!((0.3..=0.6).contains(&participation), "{participation}");

        probe.set_enabled(false);
        assert_eq!(probe.participation(Duration::from_secs(60)), None);
    }

    #[test]
    fn test_exhausted_probe_still_reports_participation() {
        let source = ScriptedSource::ok();
        source.fail_polls.store(true, Ordering::SeqCst);
        let (probe, _links) = polling(source, 10, ProbeSettings::default());
        probe.initialize().unwrap();
        probe.start().unwrap();
        thread::sleep(Duration::from_millis(100));

        assert!(!probe.is_enabled());
        assert_eq!(probe.participation(Duration::from_secs(60)), Some(0.0));
    }

    #[test]
    fn test_listening_participation_counts_health_tests() {
        let probe = Probe::new(
            "stream",
            ProbeKind::Listening {
                source: Arc::new(StreamSource::new(Duration::from_millis(50))),
            },
            ProbeSettings::default(),
            links(),
        );
        probe.initialize().unwrap();

        // Not running: nothing counts.
        probe.record_health_test();
        assert_eq!(probe.participation(Duration::from_millis(250)), Some(0.0));

        probe.start().unwrap();
        probe.record_health_test();
        probe.record_health_test();
        probe.stop().unwrap();

        // Four health tests fit in the horizon; two passed.
        assert_eq!(probe.participation(Duration::from_millis(250)), Some(0.5));
        // Never above full participation.
        assert_eq!(probe.participation(Duration::from_secs(1)), Some(1.0));
    }

    #[test]
    fn test_settings_change_interval_and_rate() {
        let (probe, links) = polling(ScriptedSource::ok(), 1000, ProbeSettings::default());
        probe.initialize().unwrap();
        probe.start().unwrap();

        probe
            .apply_setting(&ProbeSetting::PollingIntervalMs { value: 10 })
            .unwrap();
        assert_eq!(probe.state(), ProbeState::Running);
        assert_eq!(links.scheduler.pending_count(), 1);
        thread::sleep(Duration::from_millis(100));
        assert!(probe.status().stored >= 3);
        assert_eq!(probe.status().polling_interval_ms, Some(10));

        probe
            .apply_setting(&ProbeSetting::MaxDataPerSecond { value: Some(0.0) })
            .unwrap();
        let stored = probe.status().stored;
        thread::sleep(Duration::from_millis(60));
        probe.stop().unwrap();
        let status = probe.status();
        assert!(status.stored <= stored + 1);
        assert_eq!(status.max_data_per_second, Some(0.0));
        assert!(status.dropped_rate_limit > 0);
    }

    #[test]
    fn test_settings_rejected() {
        let (probe, _links) = polling(ScriptedSource::ok(), 50, ProbeSettings::default());
        assert!(matches!(
            probe.apply_setting(&ProbeSetting::PollingIntervalMs { value: 0 }),
            Err(RuntimeError::InvalidOperation(_))
        ));

        let listening = Probe::new(
            "stream",
            ProbeKind::Listening {
                source: Arc::new(StreamSource::new(Duration::from_millis(50))),
            },
            ProbeSettings::default(),
            links(),
        );
        assert!(listening
            .apply_setting(&ProbeSetting::PollingIntervalMs { value: 100 })
            .is_err());
        assert_eq!(listening.status().polling_interval_ms, None);
    }

    #[test]
    fn test_enabled_setting_stops_and_starts() {
        let (probe, links) = polling(ScriptedSource::ok(), 20, ProbeSettings::default());
        links.store.start().unwrap();
        probe.initialize().unwrap();
        probe.start().unwrap();

        let handle = probe.handle();
        handle.apply(&ProbeSetting::Enabled { value: false }).unwrap();
        assert_eq!(probe.state(), ProbeState::Stopped);
        assert!(!probe.is_enabled());
        assert_eq!(probe.participation(Duration::from_secs(60)), None);

        handle.apply(&ProbeSetting::Enabled { value: true }).unwrap();
        assert_eq!(probe.state(), ProbeState::Running);
        probe.stop().unwrap();
        links.store.stop().unwrap();

        drop(probe);
        assert!(handle.apply(&ProbeSetting::Enabled { value: true }).is_err());
    }
}
