//! Checkpoint and manuscript persistence contracts.
//!
//! The orchestrator only sees the two traits here. Checkpoints are an
//! append-only logical log per job, idempotent by `(job_id, phase_tag)`; the
//! latest (highest `seq`) is canonical. Manuscripts are written exactly once
//! on success.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::InMemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Checkpoint, Manuscript};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Append-only checkpoint log.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Durable before return. Writing the same `(job_id, phase_tag)` twice
    /// replaces the earlier record.
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    /// The canonical (highest-seq) checkpoint for a job, if any.
    async fn read_latest_checkpoint(&self, job_id: &str)
        -> Result<Option<Checkpoint>, StorageError>;
}

/// Destination for finished books.
#[async_trait]
pub trait ManuscriptSink: Send + Sync {
    async fn write_manuscript(&self, manuscript: &Manuscript) -> Result<(), StorageError>;
}
