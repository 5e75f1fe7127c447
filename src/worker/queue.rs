//! Job queue contract and the in-memory implementation.
//!
//! The queue owns the job records; the worker transitions them
//! queued → running → (succeeded | failed) and reports progress through the
//! queue, never directly. A lease guarantees at-most-one active worker per
//! job; cancellation travels as a token attached to the lease.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::{JobInput, JobRecord, JobStatus};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("unknown job: {0}")]
    UnknownJob(String),
}

/// A job handed to exactly one worker, with its cancellation signal.
pub struct LeasedJob {
    pub record: JobRecord,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a queued record. The API layer creates the record before
    /// enqueueing.
    async fn enqueue(&self, record: JobRecord) -> Result<(), QueueError>;

    /// Take the next queued job, transitioning it to running. Returns None
    /// when the queue is empty.
    async fn lease(&self) -> Result<Option<LeasedJob>, QueueError>;

    /// Keep-alive: refresh the lease so stalled-job detection stays quiet.
    async fn extend_lease(&self, job_id: &str) -> Result<(), QueueError>;

    /// Best-effort progress update.
    async fn update_progress(
        &self,
        job_id: &str,
        percent: u8,
        message: &str,
    ) -> Result<(), QueueError>;

    /// Terminal transition. Must not be dropped.
    async fn complete(
        &self,
        job_id: &str,
        status: JobStatus,
        message: &str,
        error: Option<String>,
    ) -> Result<(), QueueError>;

    async fn record(&self, job_id: &str) -> Result<Option<JobRecord>, QueueError>;
}

// ============================================================================
// In-memory queue
// ============================================================================

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<String>,
    records: HashMap<String, JobRecord>,
    cancels: HashMap<String, CancellationToken>,
    leases: HashMap<String, Instant>,
}

/// Single-process FIFO queue for local operation and tests.
#[derive(Default)]
pub struct InMemoryQueue {
    inner: Mutex<QueueInner>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for callers that submit input directly.
    pub async fn submit(&self, job_id: &str, input: JobInput) -> Result<(), QueueError> {
        self.enqueue(JobRecord::new(job_id.to_string(), input)).await
    }

    /// Signal cancellation for a running job. Honored at the job's next LLM
    /// call boundary.
    pub fn cancel(&self, job_id: &str) {
        if let Some(token) = self.inner.lock().unwrap().cancels.get(job_id) {
            token.cancel();
        }
    }

    /// The cancellation token for a job, pre-creating it if the job has not
    /// been leased yet.
    pub fn cancel_token(&self, job_id: &str) -> CancellationToken {
        self.inner
            .lock()
            .unwrap()
            .cancels
            .entry(job_id.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, record: JobRecord) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.push_back(record.id.clone());
        inner.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn lease(&self) -> Result<Option<LeasedJob>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(job_id) = inner.pending.pop_front() else {
            return Ok(None);
        };
        let cancel = inner.cancels.entry(job_id.clone()).or_default().clone();
        inner.leases.insert(job_id.clone(), Instant::now());
        let record = inner
            .records
            .get_mut(&job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.clone()))?;
        record.status = JobStatus::Running;
        record.touch();
        Ok(Some(LeasedJob {
            record: record.clone(),
            cancel,
        }))
    }

    async fn extend_lease(&self, job_id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.leases.get_mut(job_id) {
            Some(lease) => {
                *lease = Instant::now();
                Ok(())
            }
            None => Err(QueueError::UnknownJob(job_id.to_string())),
        }
    }

    async fn update_progress(
        &self,
        job_id: &str,
        percent: u8,
        message: &str,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        // Monotonic at the record too, in case updates arrive reordered.
        record.progress = record.progress.max(percent.min(100));
        record.message = message.to_string();
        record.touch();
        Ok(())
    }

    async fn complete(
        &self,
        job_id: &str,
        status: JobStatus,
        message: &str,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.leases.remove(job_id);
        // The token's life ends with the run; a re-enqueued job gets a fresh one.
        inner.cancels.remove(job_id);
        let record = inner
            .records
            .get_mut(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        record.status = status;
        if status == JobStatus::Succeeded {
            record.progress = 100;
        }
        record.message = message.to_string();
        record.error = error;
        record.touch();
        Ok(())
    }

    async fn record(&self, job_id: &str) -> Result<Option<JobRecord>, QueueError> {
        Ok(self.inner.lock().unwrap().records.get(job_id).cloned())
    }
}
