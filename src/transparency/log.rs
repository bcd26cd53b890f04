//! Collection statistics log.
//!
//! Counts are kept in atomics so every probe, the commit worker and the
//! scheduler can record into one shared log without locking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Collection statistics for the current session.
#[derive(Debug)]
pub struct TransparencyLog {
    /// Datums accepted into a DataStore buffer
    data_stored: AtomicU64,
    /// Datums dropped by a probe's rate limit
    data_dropped_rate_limit: AtomicU64,
    /// Datums dropped by the buffer overflow policy
    data_dropped_overflow: AtomicU64,
    /// Datums handed to a sink successfully
    data_committed: AtomicU64,
    /// Successful sink calls
    commits_succeeded: AtomicU64,
    /// Failed sink calls
    commits_failed: AtomicU64,
    /// Failed capture cycles across all probes
    capture_failures: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl TransparencyLog {
    /// Create a new transparency log.
    pub fn new() -> Self {
        Self {
            data_stored: AtomicU64::new(0),
            data_dropped_rate_limit: AtomicU64::new(0),
            data_dropped_overflow: AtomicU64::new(0),
            data_committed: AtomicU64::new(0),
            commits_succeeded: AtomicU64::new(0),
            commits_failed: AtomicU64::new(0),
            capture_failures: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a transparency log that continues from persisted totals.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            warn!("could not load previous transparency stats: {e}");
        }

        log
    }

    pub fn record_stored(&self) {
        self.data_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.data_dropped_rate_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self, count: u64) {
        self.data_dropped_overflow.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a successful commit of `count` datums.
    pub fn record_commit(&self, count: u64) {
        self.commits_succeeded.fetch_add(1, Ordering::Relaxed);
        self.data_committed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_commit_failure(&self) {
        self.commits_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_failure(&self) {
        self.capture_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> TransparencyStats {
        TransparencyStats {
            data_stored: self.data_stored.load(Ordering::Relaxed),
            data_dropped_rate_limit: self.data_dropped_rate_limit.load(Ordering::Relaxed),
            data_dropped_overflow: self.data_dropped_overflow.load(Ordering::Relaxed),
            data_committed: self.data_committed.load(Ordering::Relaxed),
            commits_succeeded: self.commits_succeeded.load(Ordering::Relaxed),
            commits_failed: self.commits_failed.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Collection Statistics:\n\
             - Data stored: {}\n\
             - Data dropped (rate limit): {}\n\
             - Data dropped (buffer overflow): {}\n\
             - Data committed: {}\n\
             - Commits: {} ok, {} failed\n\
             - Capture failures: {}\n\
             - Session duration: {} seconds",
            stats.data_stored,
            stats.data_dropped_rate_limit,
            stats.data_dropped_overflow,
            stats.data_committed,
            stats.commits_succeeded,
            stats.commits_failed,
            stats.capture_failures,
            stats.session_duration_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                data_stored: stats.data_stored,
                data_dropped_rate_limit: stats.data_dropped_rate_limit,
                data_dropped_overflow: stats.data_dropped_overflow,
                data_committed: stats.data_committed,
                commits_succeeded: stats.commits_succeeded,
                commits_failed: stats.commits_failed,
                capture_failures: stats.capture_failures,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.data_stored
                    .store(persisted.data_stored, Ordering::Relaxed);
                self.data_dropped_rate_limit
                    .store(persisted.data_dropped_rate_limit, Ordering::Relaxed);
                self.data_dropped_overflow
                    .store(persisted.data_dropped_overflow, Ordering::Relaxed);
                self.data_committed
                    .store(persisted.data_committed, Ordering::Relaxed);
                self.commits_succeeded
                    .store(persisted.commits_succeeded, Ordering::Relaxed);
                self.commits_failed
                    .store(persisted.commits_failed, Ordering::Relaxed);
                self.capture_failures
                    .store(persisted.capture_failures, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Reset all counters.
    pub fn reset(&self) {
        for counter in [
            &self.data_stored,
            &self.data_dropped_rate_limit,
            &self.data_dropped_overflow,
            &self.data_committed,
            &self.commits_succeeded,
            &self.commits_failed,
            &self.capture_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of transparency statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyStats {
    pub data_stored: u64,
    pub data_dropped_rate_limit: u64,
    pub data_dropped_overflow: u64,
    pub data_committed: u64,
    pub commits_succeeded: u64,
    pub commits_failed: u64,
    pub capture_failures: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    #[serde(default)]
    data_stored: u64,
    #[serde(default)]
    data_dropped_rate_limit: u64,
    #[serde(default)]
    data_dropped_overflow: u64,
    #[serde(default)]
    data_committed: u64,
    #[serde(default)]
    commits_succeeded: u64,
    #[serde(default)]
    commits_failed: u64,
    #[serde(default)]
    capture_failures: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared transparency log.
pub type SharedTransparencyLog = Arc<TransparencyLog>;

/// Create a new shared transparency log.
pub fn create_shared_log() -> SharedTransparencyLog {
    Arc::new(TransparencyLog::new())
}

/// Create a new shared transparency log with persistence.
pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedTransparencyLog {
    Arc::new(TransparencyLog::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting() {
        let log = TransparencyLog::new();

        log.record_stored();
        log.record_stored();
        log.record_rate_limited();
        log.record_commit(2);
        log.record_commit_failure();

        let stats = log.stats();
        assert_eq!(stats.data_stored, 2);
        assert_eq!(stats.data_dropped_rate_limit, 1);
        assert_eq!(stats.data_committed, 2);
        assert_eq!(stats.commits_succeeded, 1);
        assert_eq!(stats.commits_failed, 1);
    }

    #[test]
    fn test_reset() {
        let log = TransparencyLog::new();
        log.record_overflow(40);
        log.record_capture_failure();
        log.reset();

        let stats = log.stats();
        assert_eq!(stats.data_dropped_overflow, 0);
        assert_eq!(stats.capture_failures, 0);
    }

    #[test]
    fn test_persistence_continues_totals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transparency.json");

        let log = TransparencyLog::with_persistence(path.clone());
        log.record_commit(7);
        log.save().unwrap();

        let reloaded = TransparencyLog::with_persistence(path);
        assert_eq!(reloaded.stats().data_committed, 7);
        assert_eq!(reloaded.stats().commits_succeeded, 1);
    }

    #[test]
    fn test_summary_format() {
        let summary = TransparencyLog::new().summary();
        assert!(summary.contains("Data stored"));
        assert!(summary.contains("buffer overflow"));
        assert!(summary.contains("Commits"));
    }
}
