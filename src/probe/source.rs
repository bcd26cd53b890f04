//! Capture sources: the native collaborators probes consume.
//!
//! A polling source is asked for readings on every scheduler tick. A listening
//! source pushes readings onto a channel from its own thread; the probe drains
//! that channel, so native delivery never runs probe code directly.

use crate::scheduler::CancelFlag;
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde_json::{Map, Value};
use std::time::Instant;
use thiserror::Error;

/// A reading as delivered by a source, before it becomes a datum.
#[derive(Debug, Clone)]
pub struct RawReading {
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

impl RawReading {
    pub fn now(fields: Map<String, Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            fields,
        }
    }
}

/// A failed capture cycle.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("{0}")]
    Transient(String),
    #[error("capture timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// What a listening source pushes: a reading or a failure.
pub type ReadingEvent = Result<RawReading, CaptureError>;

/// Passed to [`PollingSource::poll`].
pub struct CaptureContext<'a> {
    pub cancel: &'a CancelFlag,
    /// The poll should return by this instant. Results arriving later are discarded.
    pub deadline: Instant,
}

impl CaptureContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A source read on a fixed interval.
pub trait PollingSource: Send + Sync {
    /// One-time resource acquisition (permissions, hardware handles).
    fn initialize(&self) -> Result<(), String> {
        Ok(())
    }

    fn poll(&self, ctx: &CaptureContext<'_>) -> Result<Vec<RawReading>, CaptureError>;
}

/// A source that pushes readings as they happen.
pub trait ListeningSource: Send + Sync {
    fn initialize(&self) -> Result<(), String> {
        Ok(())
    }

    /// Begin delivering events on `events` until [`unsubscribe`](Self::unsubscribe).
    fn subscribe(&self, events: Sender<ReadingEvent>) -> Result<(), CaptureError>;

    fn unsubscribe(&self);
}
