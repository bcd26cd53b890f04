//! Buffered commit engine.
//!
//! Probes append to a [`DataStore`] from any thread. One background worker
//! wakes every commit interval (or on [`DataStore::commit`]), swaps the buffer
//! for an empty one, anonymizes, serializes and encrypts the removed batch and
//! hands it to a [`CommitSink`]. A failed batch goes back to the front of the
//! buffer for the next cycle.
//!
//! The buffer is capped. When the cap is exceeded the oldest datums are
//! dropped and counted in the transparency log.
//!
//! A [`DatumObserver`] sees every datum as it is added, before anonymization.

pub mod sink;

pub use sink::{CommitSink, EncryptedBatch, FileSink, SinkError};

use crate::datum::{Anonymizer, Datum};
use crate::encryption::SymmetricEncryption;
use crate::error::RuntimeError;
use crate::health::HealthReport;
use crate::transparency::{create_shared_log, SharedTransparencyLog};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default cap on buffered datums.
pub const DEFAULT_MAX_BUFFERED: usize = 100_000;

/// Commit cadence and buffer bound.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub protocol_id: String,
    pub commit_interval: Duration,
    pub max_buffered_datums: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            protocol_id: String::new(),
            commit_interval: Duration::from_secs(60),
            max_buffered_datums: DEFAULT_MAX_BUFFERED,
        }
    }
}

/// Sees each datum added to a store.
///
/// Called on the producing thread, so implementations must not block.
pub trait DatumObserver: Send + Sync {
    fn observe(&self, datum: &Datum);
}

enum Trigger {
    Commit,
    Shutdown,
}

struct Worker {
    trigger: Sender<Trigger>,
    handle: JoinHandle<()>,
}

/// Everything a commit cycle touches. Cloned into the worker thread.
#[derive(Clone)]
struct CommitEngine {
    settings: StoreSettings,
    buffer: Arc<Mutex<VecDeque<Datum>>>,
    cycle: Arc<Mutex<()>>,
    last_commit: Arc<Mutex<Option<DateTime<Utc>>>>,
    anonymizer: Arc<Anonymizer>,
    encryption: SymmetricEncryption,
    sink: Arc<dyn CommitSink>,
    stats: SharedTransparencyLog,
}

/// Buffers datums and runs an independent commit cycle.
pub struct DataStore {
    engine: CommitEngine,
    producers: Arc<AtomicUsize>,
    worker: Mutex<Option<Worker>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    observer: RwLock<Option<Arc<dyn DatumObserver>>>,
}

impl DataStore {
    pub fn new(
        settings: StoreSettings,
        sink: Arc<dyn CommitSink>,
        encryption: SymmetricEncryption,
    ) -> Self {
        Self {
            engine: CommitEngine {
                settings,
                buffer: Arc::new(Mutex::new(VecDeque::new())),
                cycle: Arc::new(Mutex::new(())),
                last_commit: Arc::new(Mutex::new(None)),
                anonymizer: Arc::new(Anonymizer::new()),
                encryption,
                sink,
                stats: create_shared_log(),
            },
            producers: Arc::new(AtomicUsize::new(0)),
            worker: Mutex::new(None),
            started_at: Mutex::new(None),
            observer: RwLock::new(None),
        }
    }

    /// Field transforms applied to every datum before serialization.
    pub fn with_anonymizer(mut self, anonymizer: Anonymizer) -> Self {
        self.engine.anonymizer = Arc::new(anonymizer);
        self
    }

    pub fn with_stats(mut self, stats: SharedTransparencyLog) -> Self {
        self.engine.stats = stats;
        self
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.engine.settings
    }

    pub fn stats(&self) -> &SharedTransparencyLog {
        &self.engine.stats
    }

    /// Replace the observer. `None` removes it.
    pub fn set_observer(&self, observer: Option<Arc<dyn DatumObserver>>) {
        *self.observer.write().unwrap_or_else(|p| p.into_inner()) = observer;
    }

    /// Append a datum. Holds the buffer lock only for the push.
    pub fn add_datum(&self, datum: Datum) {
        let observer = self.observer.read().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(observer) = observer {
            observer.observe(&datum);
        }

        let dropped = {
            let mut buffer = self.engine.lock_buffer();
            buffer.push_back(datum);
            self.engine.enforce_cap(&mut buffer)
        };
        self.engine.stats.record_stored();
        self.engine.report_overflow(dropped);
    }

    /// Wake the commit worker now instead of waiting for the interval.
    pub fn commit(&self) -> Result<(), RuntimeError> {
        let worker = self.lock_worker();
        let Some(worker) = worker.as_ref() else {
            return Err(RuntimeError::InvalidOperation(
                "commit requested but the data store is not running".to_string(),
            ));
        };
        // A full trigger queue already guarantees a pending cycle.
        let _ = worker.trigger.try_send(Trigger::Commit);
        Ok(())
    }

    /// Start the commit worker. Does nothing if it is already running.
    pub fn start(&self) -> Result<(), RuntimeError> {
        let mut worker = self.lock_worker();
        if worker.is_some() {
            return Ok(());
        }

        let (trigger, triggers) = bounded(16);
        let engine = self.engine.clone();
        let handle = thread::Builder::new()
            .name(format!("datastore-{}", self.engine.settings.protocol_id))
            .spawn(move || {
                let interval = engine.settings.commit_interval;
                loop {
                    match triggers.recv_timeout(interval) {
                        // Empty buffers are skipped inside the cycle.
                        Err(RecvTimeoutError::Timeout) | Ok(Trigger::Commit) => engine.run_cycle(),
                        Ok(Trigger::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            engine.run_cycle();
                            break;
                        }
                    }
                }
                debug!("commit worker exited");
            })?;

        *worker = Some(Worker { trigger, handle });
        if let Ok(mut started) = self.started_at.lock() {
            *started = Some(Utc::now());
        }
        info!(
            protocol = %self.engine.settings.protocol_id,
            interval_ms = self.engine.settings.commit_interval.as_millis() as u64,
            "data store started"
        );
        Ok(())
    }

    /// Stop the commit worker after one final cycle.
    ///
    /// Refused with [`RuntimeError::InvalidOperation`] while any producer is
    /// still registered.
    pub fn stop(&self) -> Result<(), RuntimeError> {
        let active = self.producers.load(Ordering::SeqCst);
        if active > 0 {
            return Err(RuntimeError::InvalidOperation(format!(
                "data store must keep running: {active} probe(s) still active"
            )));
        }

        let Some(worker) = self.lock_worker().take() else {
            return Ok(());
        };
        self.shutdown_worker(worker);
        info!(protocol = %self.engine.settings.protocol_id, "data store stopped");
        Ok(())
    }

    fn shutdown_worker(&self, worker: Worker) {
        let _ = worker.trigger.send(Trigger::Shutdown);
        if worker.handle.join().is_err() {
            error!("commit worker panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker().is_some()
    }

    /// Called by a probe when it starts producing.
    pub fn register_producer(&self) {
        self.producers.fetch_add(1, Ordering::SeqCst);
    }

    /// Called by a probe once it can no longer produce.
    pub fn release_producer(&self) {
        let _ = self
            .producers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// True while at least one producer is registered.
    pub fn needs_to_be_running(&self) -> bool {
        self.producers.load(Ordering::SeqCst) > 0
    }

    pub fn active_producers(&self) -> usize {
        self.producers.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.engine.lock_buffer().len()
    }

    pub fn last_commit(&self) -> Option<DateTime<Utc>> {
        self.engine.last_commit.lock().ok().and_then(|t| *t)
    }

    pub fn test_health(&self) -> HealthReport {
        let mut report = HealthReport::new(format!("data store {}", self.engine.settings.protocol_id));

        if !self.is_running() {
            report.error("commit worker is not running");
            report.restart_required = true;
            return report;
        }

        let pending = self.pending_count();
        let cap = self.engine.settings.max_buffered_datums;
        if pending * 10 >= cap * 9 {
            report.warn(format!("buffer is near capacity ({pending}/{cap})"));
        }

        let interval = chrono::Duration::from_std(self.engine.settings.commit_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let reference = self
            .last_commit()
            .or_else(|| self.started_at.lock().ok().and_then(|t| *t));
        if let Some(reference) = reference {
            if pending > 0 && Utc::now() - reference > interval {
                report.warn(format!(
                    "no successful commit since {} with {pending} datum(s) pending",
                    reference.to_rfc3339()
                ));
            }
        }
        report
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for DataStore {
    fn drop(&mut self) {
        if let Some(worker) = self.lock_worker().take() {
            self.shutdown_worker(worker);
        }
    }
}

impl CommitEngine {
    fn lock_buffer(&self) -> MutexGuard<'_, VecDeque<Datum>> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop the oldest datums above the cap. Returns how many were dropped.
    fn enforce_cap(&self, buffer: &mut VecDeque<Datum>) -> usize {
        let excess = buffer.len().saturating_sub(self.settings.max_buffered_datums);
        buffer.drain(..excess);
        excess
    }

    fn report_overflow(&self, dropped: usize) {
        if dropped > 0 {
            self.stats.record_overflow(dropped as u64);
            warn!(
                protocol = %self.settings.protocol_id,
                dropped,
                cap = self.settings.max_buffered_datums,
                "buffer full, dropped oldest datums"
            );
        }
    }

    fn run_cycle(&self) {
        let _cycle = self.cycle.lock().unwrap_or_else(|p| p.into_inner());

        let batch: Vec<Datum> = std::mem::take(&mut *self.lock_buffer()).into();
        if batch.is_empty() {
            debug!(protocol = %self.settings.protocol_id, "nothing to commit");
            return;
        }

        match self.seal(&batch) {
            Ok(sealed) => match self.sink.commit(&sealed) {
                Ok(()) => {
                    self.stats.record_commit(sealed.datum_count as u64);
                    if let Ok(mut last) = self.last_commit.lock() {
                        *last = Some(sealed.created_at);
                    }
                    debug!(
                        batch = %sealed.id,
                        count = sealed.datum_count,
                        sink = self.sink.name(),
                        "committed batch"
                    );
                }
                Err(e) => {
                    let err = RuntimeError::CommitSink {
                        sink: self.sink.name().to_string(),
                        reason: e.to_string(),
                    };
                    warn!(batch = %sealed.id, count = batch.len(), "{err}; retrying next cycle");
                    self.stats.record_commit_failure();
                    self.requeue(batch);
                }
            },
            Err(e) => {
                error!("could not seal batch: {e}");
                self.stats.record_commit_failure();
                self.requeue(batch);
            }
        }
    }

    fn seal(&self, batch: &[Datum]) -> Result<EncryptedBatch, RuntimeError> {
        let anonymized: Vec<Datum> = batch.iter().map(|d| self.anonymizer.apply(d)).collect();
        let json = serde_json::to_vec(&anonymized)?;
        let ciphertext = self.encryption.encrypt(&json)?;

        Ok(EncryptedBatch {
            id: Uuid::new_v4(),
            protocol_id: self.settings.protocol_id.clone(),
            datum_count: batch.len(),
            created_at: Utc::now(),
            ciphertext,
        })
    }

    /// Put a failed batch back ahead of anything added since the swap.
    fn requeue(&self, batch: Vec<Datum>) {
        let dropped = {
            let mut buffer = self.lock_buffer();
            for datum in batch.into_iter().rev() {
                buffer.push_front(datum);
            }
            self.enforce_cap(&mut buffer)
        };
        self.report_overflow(dropped);
    }
}
