//! File-backed checkpoint store and manuscript sink.
//!
//! Layout under the storage root:
//!   jobs/<job_id>/checkpoints/<phase_tag>.json   one file per phase tag
//!   jobs/<job_id>/latest.json                    canonical checkpoint
//!   manuscripts/<job_id>.json
//!
//! Every write goes through a temp file and an atomic rename, so a crashed
//! worker never leaves a torn checkpoint behind. All filesystem calls are
//! `tokio::fs`; checkpoint writes sit on the scene loop's hot path and must
//! not stall runtime workers.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::models::{Checkpoint, Manuscript};

use super::{CheckpointStore, ManuscriptSink, StorageError};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join("jobs").join(sanitize(job_id))
    }

    async fn write_atomic(path: &Path, json: &str) -> Result<(), StorageError> {
        let parent = path.parent().expect("storage paths have parents");
        fs::create_dir_all(parent).await?;
        let temp = parent.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("file")
        ));
        fs::write(&temp, json).await?;
        fs::rename(&temp, path).await?;
        Ok(())
    }
}

/// Phase tags and job ids become file names; keep them path-safe.
fn sanitize(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
        .collect()
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let dir = self.job_dir(&checkpoint.job_id);
        let json = serde_json::to_string_pretty(checkpoint)?;

        let log_file = dir
            .join("checkpoints")
            .join(format!("{}.json", sanitize(&checkpoint.phase_tag)));
        Self::write_atomic(&log_file, &json).await?;
        Self::write_atomic(&dir.join("latest.json"), &json).await?;
        Ok(())
    }

    async fn read_latest_checkpoint(
        &self,
        job_id: &str,
    ) -> Result<Option<Checkpoint>, StorageError> {
        let path = self.job_dir(job_id).join("latest.json");
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&json)?))
    }
}

#[async_trait]
impl ManuscriptSink for FileStore {
    async fn write_manuscript(&self, manuscript: &Manuscript) -> Result<(), StorageError> {
        let path = self
            .root
            .join("manuscripts")
            .join(format!("{}.json", sanitize(&manuscript.job_id)));
        let json = serde_json::to_string_pretty(manuscript)?;
        Self::write_atomic(&path, &json).await
    }
}
