//! The job queue worker.
//!
//! Pulls jobs from the queue under bounded concurrency (default 1: a single
//! job saturates LLM rate limits, and state mutation within a job is strictly
//! sequential), runs the orchestrator with a wall-clock ceiling, forwards
//! progress, keeps the job lease alive, and writes the terminal status.
//! Jobs that already have a checkpoint resume automatically.

pub mod queue;

pub use queue::{InMemoryQueue, JobQueue, LeasedJob, QueueError};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agents::{LlmEditor, LlmPlanner, LlmValidator, LlmWriter};
use crate::config::EngineConfig;
use crate::llm::{LlmClient, MeteredLlm};
use crate::models::JobStatus;
use crate::orchestrator::{Orchestrator, ProgressSender};
use crate::storage::{CheckpointStore, ManuscriptSink};

/// How long an idle worker waits before polling the queue again.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    checkpoints: Arc<dyn CheckpointStore>,
    manuscripts: Arc<dyn ManuscriptSink>,
    llm: Arc<dyn LlmClient>,
    config: EngineConfig,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        checkpoints: Arc<dyn CheckpointStore>,
        manuscripts: Arc<dyn ManuscriptSink>,
        llm: Arc<dyn LlmClient>,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue,
            checkpoints,
            manuscripts,
            llm,
            config,
        }
    }

    /// Consume the queue until shutdown is signalled, then drain in-flight
    /// jobs.
    pub async fn run(&self, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.worker.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();
        info!(
            concurrency = self.config.worker.concurrency,
            "worker consuming queue"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => {
                    permit.expect("semaphore never closed")
                }
            };

            match self.queue.lease().await {
                Ok(Some(leased)) => {
                    let worker = self.clone();
                    tasks.spawn(async move {
                        worker.process(leased).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    warn!("queue lease failed: {e}");
                    tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                }
            }
        }

        info!("worker draining in-flight jobs");
        while tasks.join_next().await.is_some() {}
    }

    /// Process queued jobs until the queue is empty, then return. Used by the
    /// inline `run` command and tests.
    pub async fn run_until_idle(&self) {
        while let Ok(Some(leased)) = self.queue.lease().await {
            self.process(leased).await;
        }
    }

    /// Run one leased job to a terminal status.
    async fn process(&self, leased: LeasedJob) {
        let job_id = leased.record.id.clone();
        let input = leased.record.input.clone();
        info!(%job_id, mode = ?input.mode, "job leased");

        // Per-job metered client so manuscript stats can report token spend.
        let meter = Arc::new(MeteredLlm::new(self.llm.clone()));
        let llm: Arc<dyn LlmClient> = meter.clone();
        let limits = self.config.limits.clone();
        let orchestrator = Orchestrator::new(
            Arc::new(LlmPlanner::new(llm.clone(), limits.clone())),
            Arc::new(LlmWriter::new(llm.clone(), input.voice.clone())),
            Arc::new(LlmEditor::new(llm.clone(), limits.clone())),
            Arc::new(LlmValidator::new(llm, limits.clone())),
            self.checkpoints.clone(),
            self.manuscripts.clone(),
            limits.clone(),
        )
        .with_usage_meter(meter);

        // Progress forwarder: best-effort, consumed off the orchestrator's
        // channel.
        let (progress, mut progress_rx) = ProgressSender::channel();
        let forwarder_queue = self.queue.clone();
        let forwarder_job = job_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(update) = progress_rx.recv().await {
                let _ = forwarder_queue
                    .update_progress(&forwarder_job, update.percent, &update.message)
                    .await;
            }
        });

        // Lease keep-alive for the duration of the job.
        let keepalive_queue = self.queue.clone();
        let keepalive_job = job_id.clone();
        let keepalive_interval = Duration::from_secs(self.config.worker.lease_keepalive_secs);
        let keepalive = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive_interval);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                if keepalive_queue.extend_lease(&keepalive_job).await.is_err() {
                    break;
                }
            }
        });

        let ceiling = limits.wall_clock_ceiling(input.mode);
        let result = tokio::time::timeout(
            ceiling,
            orchestrator.run_job(&job_id, &input, &progress, &leased.cancel),
        )
        .await;

        keepalive.abort();
        drop(progress);
        let _ = forwarder.await;

        let completion = match result {
            Ok(Ok(outcome)) => {
                let message = if outcome.warnings.is_empty() {
                    format!("manuscript complete: {} words", outcome.manuscript.stats.word_count)
                } else {
                    format!(
                        "manuscript complete: {} words; {}",
                        outcome.manuscript.stats.word_count,
                        outcome.warnings.join("; ")
                    )
                };
                info!(%job_id, "job succeeded");
                (JobStatus::Succeeded, message, None)
            }
            Ok(Err(e)) => {
                warn!(%job_id, tag = e.tag(), "job failed: {e}");
                (
                    JobStatus::Failed,
                    String::new(),
                    Some(format!("{}: {e}", e.tag())),
                )
            }
            Err(_) => {
                warn!(%job_id, ?ceiling, "job exceeded wall-clock ceiling");
                (
                    JobStatus::Failed,
                    String::new(),
                    Some(format!(
                        "wall-clock: job exceeded its {}s ceiling",
                        ceiling.as_secs()
                    )),
                )
            }
        };

        // Terminal record updates must land even if progress updates dropped.
        if let Err(e) = self
            .queue
            .complete(&job_id, completion.0, &completion.1, completion.2)
            .await
        {
            error!(%job_id, "failed to write terminal job status: {e}");
        }
    }
}
