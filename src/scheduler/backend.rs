//! OS scheduling backends.
//!
//! The scheduler registers every callback with a [`WakeBackend`] so that a
//! platform alarm can bring the process back after suspension. Desktop hosts
//! have no such alarm API; [`NoopWakeBackend`] accepts every request and
//! [`FileWakeBackend`] journals pending wakes to disk.

use super::CallbackId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Opaque handle returned by a backend for a registered wake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeHandle(pub String);

/// Platform alarm/notification API used to survive process suspension.
pub trait WakeBackend: Send + Sync {
    /// Register a wake at `at`, repeating every `repeat` if set.
    fn schedule_wake(
        &self,
        id: CallbackId,
        at: DateTime<Utc>,
        repeat: Option<Duration>,
    ) -> Result<WakeHandle, String>;

    /// Remove a previously registered wake. Unknown handles are ignored.
    fn cancel_wake(&self, handle: &WakeHandle);
}

/// A backend for hosts that never suspend the process.
#[derive(Debug, Default)]
pub struct NoopWakeBackend;

impl WakeBackend for NoopWakeBackend {
    fn schedule_wake(
        &self,
        id: CallbackId,
        _at: DateTime<Utc>,
        _repeat: Option<Duration>,
    ) -> Result<WakeHandle, String> {
        Ok(WakeHandle(id.to_string()))
    }

    fn cancel_wake(&self, _handle: &WakeHandle) {}
}

/// A pending wake as written to the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeRecord {
    pub at: DateTime<Utc>,
    pub repeat_ms: Option<u64>,
}

/// Journals pending wakes to a JSON file so an external launcher can
/// restart the host when one comes due.
pub struct FileWakeBackend {
    path: PathBuf,
    records: Mutex<BTreeMap<String, WakeRecord>>,
}

impl FileWakeBackend {
    /// Open (or create) the journal at `path`.
    ///
    /// One-shot wakes that came due before `open` are dropped and the journal
    /// rewritten. Repeating and future wakes are kept.
    pub fn open(path: PathBuf) -> Result<Self, String> {
        let mut records: BTreeMap<String, WakeRecord> = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| e.to_string())?;
            serde_json::from_str(&content).map_err(|e| e.to_string())?
        } else {
            BTreeMap::new()
        };

        let now = Utc::now();
        let before = records.len();
        records.retain(|_, record| record.repeat_ms.is_some() || record.at > now);

        let backend = Self {
            path,
            records: Mutex::new(BTreeMap::new()),
        };
        if records.len() != before {
            tracing::debug!(pruned = before - records.len(), "dropped overdue wakes");
            backend.persist(&records)?;
        }
        if let Ok(mut slot) = backend.records.lock() {
            *slot = records;
        }
        Ok(backend)
    }

    /// Snapshot of the journaled wakes.
    pub fn records(&self) -> BTreeMap<String, WakeRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    fn persist(&self, records: &BTreeMap<String, WakeRecord>) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let json = serde_json::to_string_pretty(records).map_err(|e| e.to_string())?;
        std::fs::write(&self.path, json).map_err(|e| e.to_string())
    }
}

impl WakeBackend for FileWakeBackend {
    fn schedule_wake(
        &self,
        id: CallbackId,
        at: DateTime<Utc>,
        repeat: Option<Duration>,
    ) -> Result<WakeHandle, String> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| "wake journal lock poisoned".to_string())?;

        let key = id.to_string();
        records.insert(
            key.clone(),
            WakeRecord {
                at,
                repeat_ms: repeat.map(|r| r.as_millis() as u64),
            },
        );

        if let Err(e) = self.persist(&records) {
            records.remove(&key);
            return Err(format!("could not write wake journal {:?}: {e}", self.path));
        }
        Ok(WakeHandle(key))
    }

    fn cancel_wake(&self, handle: &WakeHandle) {
        let Ok(mut records) = self.records.lock() else {
            return;
        };
        if records.remove(&handle.0).is_some() {
            if let Err(e) = self.persist(&records) {
                tracing::warn!("could not update wake journal: {e}");
            }
        }
    }
}
