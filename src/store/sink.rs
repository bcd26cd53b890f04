//! Commit sinks: where encrypted batches go.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a sink. Any error means the batch was not accepted.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("batch rejected: {0}")]
    Rejected(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A serialized, encrypted set of datums from one commit cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedBatch {
    pub id: Uuid,
    pub protocol_id: String,
    pub datum_count: usize,
    pub created_at: DateTime<Utc>,
    /// `nonce || ciphertext || tag` of the JSON array of datums.
    #[serde(skip)]
    pub ciphertext: Vec<u8>,
}

impl EncryptedBatch {
    /// File name used by sinks that write one file per batch.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.bin",
            self.created_at.format("%Y%m%dT%H%M%S%.3fZ"),
            self.id
        )
    }
}

/// External collaborator that accepts committed batches.
pub trait CommitSink: Send + Sync {
    fn name(&self) -> &str;
    fn commit(&self, batch: &EncryptedBatch) -> Result<(), SinkError>;
}

/// Writes each batch to its own file in a directory.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CommitSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn commit(&self, batch: &EncryptedBatch) -> Result<(), SinkError> {
        std::fs::create_dir_all(&self.dir)?;

        // Write then rename so a reader never sees a partial batch.
        let target = self.dir.join(batch.file_name());
        let partial = target.with_extension("partial");
        std::fs::write(&partial, &batch.ciphertext)?;
        std::fs::rename(&partial, &target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sink_writes_one_file_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("batches"));

        for _ in 0..2 {
            let batch = EncryptedBatch {
                id: Uuid::new_v4(),
                protocol_id: "p".into(),
                datum_count: 1,
                created_at: Utc::now(),
                ciphertext: vec![1, 2, 3],
            };
            sink.commit(&batch).unwrap();
            assert_eq!(std::fs::read(sink.dir().join(batch.file_name())).unwrap(), vec![1, 2, 3]);
        }

        let files: Vec<_> = std::fs::read_dir(sink.dir()).unwrap().collect();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_file_sink_reports_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let sink = FileSink::new(&blocker);
        let batch = EncryptedBatch {
            id: Uuid::new_v4(),
            protocol_id: "p".into(),
            datum_count: 0,
            created_at: Utc::now(),
            ciphertext: Vec::new(),
        };
        assert!(matches!(sink.commit(&batch), Err(SinkError::Io(_))));
    }
}
