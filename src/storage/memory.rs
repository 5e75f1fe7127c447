//! In-memory store for tests and single-process runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::models::{Checkpoint, Manuscript};

use super::{CheckpointStore, ManuscriptSink, StorageError};

#[derive(Default)]
pub struct InMemoryStore {
    /// Per-job checkpoint log keyed by phase tag (idempotent writes)
    checkpoints: Mutex<HashMap<String, HashMap<String, Checkpoint>>>,
    manuscripts: Mutex<HashMap<String, Manuscript>>,
    manuscript_writes: Mutex<HashMap<String, usize>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manuscript(&self, job_id: &str) -> Option<Manuscript> {
        self.manuscripts.lock().unwrap().get(job_id).cloned()
    }

    /// How many times a manuscript was written for this job.
    pub fn manuscript_write_count(&self, job_id: &str) -> usize {
        self.manuscript_writes
            .lock()
            .unwrap()
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn checkpoint_count(&self, job_id: &str) -> usize {
        self.checkpoints
            .lock()
            .unwrap()
            .get(job_id)
            .map(|log| log.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.checkpoints
            .lock()
            .unwrap()
            .entry(checkpoint.job_id.clone())
            .or_default()
            .insert(checkpoint.phase_tag.clone(), checkpoint.clone());
        Ok(())
    }

    async fn read_latest_checkpoint(
        &self,
        job_id: &str,
    ) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap()
            .get(job_id)
            .and_then(|log| log.values().max_by_key(|c| c.seq).cloned()))
    }
}

#[async_trait]
impl ManuscriptSink for InMemoryStore {
    async fn write_manuscript(&self, manuscript: &Manuscript) -> Result<(), StorageError> {
        *self
            .manuscript_writes
            .lock()
            .unwrap()
            .entry(manuscript.job_id.clone())
            .or_insert(0) += 1;
        self.manuscripts
            .lock()
            .unwrap()
            .insert(manuscript.job_id.clone(), manuscript.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NarrativeState;

    #[tokio::test]
    async fn test_latest_is_highest_seq() {
        let store = InMemoryStore::new();
        let state = NarrativeState::new("p".into(), "g".into(), 9_000, "t".into(), "A".into());
        store
            .write_checkpoint(&Checkpoint::new("j", "init", 0, state.clone(), vec![]))
            .await
            .unwrap();
        store
            .write_checkpoint(&Checkpoint::new("j", "a1.c1.s2", 2, state.clone(), vec![]))
            .await
            .unwrap();
        store
            .write_checkpoint(&Checkpoint::new("j", "a1.c1.s1", 1, state, vec![]))
            .await
            .unwrap();

        let latest = store.read_latest_checkpoint("j").await.unwrap().unwrap();
        assert_eq!(latest.phase_tag, "a1.c1.s2");
        assert_eq!(store.checkpoint_count("j"), 3);
    }
}
