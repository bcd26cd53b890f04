//! Error taxonomy for the sensing runtime.
//!
//! Probe- and commit-level failures are recovered locally and logged; lifecycle
//! contract violations and scheduler persistence failures surface to the caller
//! as [`RuntimeError`].

use crate::config::ConfigError;
use crate::encryption::EncryptionError;
use thiserror::Error;

/// Errors that cross a public lifecycle boundary.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Permission or hardware missing. The probe is disabled, siblings continue.
    #[error("probe '{probe}' failed to initialize: {reason}")]
    Initialization { probe: String, reason: String },

    /// A single capture cycle failed. Retried on the next cycle.
    #[error("probe '{probe}' capture failed: {reason}")]
    TransientCapture { probe: String, reason: String },

    /// Too many consecutive capture failures; the probe has been disabled.
    #[error("probe '{probe}' disabled after {failures} consecutive capture failures")]
    ResourceExhaustion { probe: String, failures: u32 },

    /// The commit sink rejected a batch. The batch stays buffered.
    #[error("commit sink '{sink}' failed: {reason}")]
    CommitSink { sink: String, reason: String },

    /// A lifecycle contract was violated (e.g. stopping a store that must keep running).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The OS wake backend could not persist a callback; timed semantics are lost.
    #[error("scheduler persistence failed: {0}")]
    SchedulerPersistence(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Whether the error must be treated as fatal by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::InvalidOperation(_) | RuntimeError::SchedulerPersistence(_)
        )
    }
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
