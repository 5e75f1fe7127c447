//! The per-job state machine: init, acts, validate, assemble.
//!
//! One orchestrator drives one job at a time. All narrative-state mutation
//! happens here, on a single task: agents propose, the orchestrator applies.
//! A checkpoint is written after every accepted scene, so a crashed job can
//! resume from the latest checkpoint and replay nothing.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{story_summary, ActOutline, Editor, Planner, Validator, Writer};
use crate::config::LimitsConfig;
use crate::llm::{LlmError, MeteredLlm};
use crate::models::{
    count_words, AcceptedScene, ChapterBuffer, Checkpoint, EditorEvaluation, JobInput, Manuscript,
    ManuscriptStats, Mode, NarrativeState, PatchError, RawScene, SceneFingerprint, SceneId,
};
use crate::storage::{CheckpointStore, ManuscriptSink, StorageError};

use super::progress::ProgressSender;

// Progress spans per phase: init 0-10, acts 10-80, validate 80-95,
// assemble 95-100.
const PROGRESS_INIT_DONE: u8 = 10;
const PROGRESS_ACTS_DONE: u8 = 80;
const PROGRESS_VALIDATE_DONE: u8 = 95;

// ============================================================================
// Errors
// ============================================================================

/// Orchestrator roll-up error. Each variant carries a stable classification
/// tag surfaced in the job record.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("job cancelled")]
    Cancelled,
    #[error("no forward progress: {0} consecutive scenes dropped")]
    NoForwardProgress(u32),
    #[error("internal: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn tag(&self) -> &'static str {
        match self {
            EngineError::Llm(e) => e.tag(),
            EngineError::Storage(_) => "storage",
            EngineError::Cancelled => "cancelled",
            EngineError::NoForwardProgress(_) => "no-forward-progress",
            EngineError::Internal(_) => "internal",
        }
    }
}

// ============================================================================
// Run bookkeeping
// ============================================================================

/// What a completed job hands back to the worker.
#[derive(Debug)]
pub struct JobOutcome {
    pub manuscript: Manuscript,
    /// Non-fatal incidents (lossy accepts, validation issues) for the job
    /// record message
    pub warnings: Vec<String>,
}

/// Mutable bookkeeping for one running job.
struct RunState {
    state: NarrativeState,
    outlines: Vec<ActOutline>,
    accepted: Vec<AcceptedScene>,
    chapter: ChapterBuffer,
    /// Checkpoint sequence, monotonically increasing
    seq: u64,
    consecutive_drops: u32,
    warnings: Vec<String>,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    planner: Arc<dyn Planner>,
    writer: Arc<dyn Writer>,
    editor: Arc<dyn Editor>,
    validator: Arc<dyn Validator>,
    checkpoints: Arc<dyn CheckpointStore>,
    manuscripts: Arc<dyn ManuscriptSink>,
    limits: LimitsConfig,
    usage_meter: Option<Arc<MeteredLlm>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        planner: Arc<dyn Planner>,
        writer: Arc<dyn Writer>,
        editor: Arc<dyn Editor>,
        validator: Arc<dyn Validator>,
        checkpoints: Arc<dyn CheckpointStore>,
        manuscripts: Arc<dyn ManuscriptSink>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            planner,
            writer,
            editor,
            validator,
            checkpoints,
            manuscripts,
            limits,
            usage_meter: None,
        }
    }

    /// Attach a metered LLM wrapper so manuscript stats can report token
    /// spend.
    pub fn with_usage_meter(mut self, meter: Arc<MeteredLlm>) -> Self {
        self.usage_meter = Some(meter);
        self
    }

    /// Drive one job to completion. Starts fresh, or resumes from the latest
    /// checkpoint when one exists.
    pub async fn run_job(
        &self,
        job_id: &str,
        input: &JobInput,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, EngineError> {
        let mut run = match self.checkpoints.read_latest_checkpoint(job_id).await? {
            Some(checkpoint) => {
                info!(
                    job_id,
                    phase_tag = %checkpoint.phase_tag,
                    "resuming from checkpoint"
                );
                self.restore(checkpoint)
            }
            None => self.initialize(job_id, input, progress, cancel).await?,
        };

        // Outlines are not persisted; a resumed run re-derives them from the
        // restored state.
        if run.outlines.is_empty() {
            self.check_cancel(cancel)?;
            run.outlines = self.planner.generate_act_outlines(&run.state).await?;
        }
        progress.send(PROGRESS_INIT_DONE, "plan ready");

        self.run_acts(&mut run, job_id, input, progress, cancel)
            .await?;
        progress.send(PROGRESS_ACTS_DONE, "all acts written");

        self.validate_book(&mut run, job_id, progress, cancel).await?;
        progress.send(PROGRESS_VALIDATE_DONE, "structure validated");

        let manuscript = self.assemble(&mut run, job_id, cancel).await?;
        progress.send(100, "manuscript complete");

        Ok(JobOutcome {
            manuscript,
            warnings: run.warnings,
        })
    }

    // ========================================================================
    // Phase: init
    // ========================================================================

    async fn initialize(
        &self,
        job_id: &str,
        input: &JobInput,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<RunState, EngineError> {
        progress.send(0, "planning the book");
        self.check_cancel(cancel)?;

        let state = self.planner.derive_initial_state(input).await?;
        self.check_cancel(cancel)?;
        let outlines = self.planner.generate_act_outlines(&state).await?;

        info!(
            job_id,
            acts = state.structure.acts_total,
            target = state.target_length_words,
            "initialized narrative state"
        );
        let mut run = RunState {
            chapter: ChapterBuffer::new(state.structure.chapter_index),
            state,
            outlines,
            accepted: Vec::new(),
            seq: 0,
            consecutive_drops: 0,
            warnings: Vec::new(),
        };
        self.write_checkpoint(&mut run, job_id, "init").await?;
        Ok(run)
    }

    fn restore(&self, checkpoint: Checkpoint) -> RunState {
        let state = checkpoint.narrative_state;
        let accepted = checkpoint.accepted_scenes;

        // Rebuild the open chapter buffer from the accepted-scene log.
        let mut chapter = ChapterBuffer::new(state.structure.chapter_index);
        for scene in accepted
            .iter()
            .filter(|s| s.chapter_index == state.structure.chapter_index)
        {
            chapter.push_scene(scene.title.clone(), scene.content.clone(), scene.word_count);
        }

        RunState {
            state,
            outlines: Vec::new(),
            accepted,
            chapter,
            seq: checkpoint.seq,
            consecutive_drops: 0,
            warnings: Vec::new(),
        }
    }

    // ========================================================================
    // Phase: acts
    // ========================================================================

    async fn run_acts(
        &self,
        run: &mut RunState,
        job_id: &str,
        input: &JobInput,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        while run.state.structure.act_index < run.state.structure.acts_total
            || !run.state.act_complete()
        {
            if run.state.structure.act_index == 0 || run.state.act_complete() {
                self.close_act_if_open(run, cancel).await?;

                let next = run.state.structure.act_index as usize;
                let outline = run.outlines.get(next).cloned().ok_or_else(|| {
                    EngineError::Internal(format!("no outline for act {}", next + 1))
                })?;
                run.state.begin_act(
                    outline.goal.clone(),
                    outline.open_questions.clone(),
                    outline.close_conditions.clone(),
                );
                info!(
                    job_id,
                    act = run.state.structure.act_index,
                    words_target = run.state.act_state.act_words_target,
                    "beginning act"
                );
            }

            self.check_cancel(cancel)?;
            self.run_scene(run, job_id, input, cancel).await?;

            let percent = acts_progress(run.state.structure.words_written, run.state.target_length_words);
            progress.send(
                percent,
                format!(
                    "act {} of {}: {} words written",
                    run.state.structure.act_index,
                    run.state.structure.acts_total,
                    run.state.structure.words_written
                ),
            );
        }

        // The final act closes here; earlier acts close as their successor
        // begins.
        self.close_act_if_open(run, cancel).await?;
        Ok(())
    }

    /// Act-level validation for the act just finished. Non-fatal: issues go
    /// into the warnings list.
    async fn close_act_if_open(
        &self,
        run: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if run.state.structure.act_index == 0 {
            return Ok(());
        }
        self.check_cancel(cancel)?;
        let summary = run.state.summaries.current_act.clone();
        let report = self.validator.validate_act(&run.state, &summary).await?;
        if !report.valid {
            warn!(
                act = run.state.structure.act_index,
                issues = ?report.issues,
                "act closed with validation issues"
            );
            run.warnings.push(format!(
                "act {} validation: {}",
                run.state.structure.act_index,
                report.issues.join("; ")
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Phase: scene loop (the hottest path)
    // ========================================================================

    async fn run_scene(
        &self,
        run: &mut RunState,
        job_id: &str,
        input: &JobInput,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if run.chapter.should_roll(self.limits.chapter_roll_threshold) {
            self.roll_chapter(run);
        }

        let scene_id = SceneId {
            act: run.state.structure.act_index,
            chapter: run.state.structure.chapter_index,
            scene: run.state.structure.scene_index + 1,
        };
        let outline_index = (run.state.structure.act_index - 1) as usize;
        let outline = run
            .outlines
            .get(outline_index)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("no outline for act {}", scene_id.act)))?;

        self.check_cancel(cancel)?;
        let brief = self.planner.generate_scene_brief(&run.state, &outline).await?;
        self.check_cancel(cancel)?;
        let mut attempt = self.writer.generate_scene(&run.state, &brief, scene_id).await?;

        // Draft mode skips the editor entirely: weaker repetition protection,
        // half the wall clock.
        if input.mode == Mode::Draft {
            let fingerprint = SceneFingerprint::minimal(&scene_id.to_string());
            let title = attempt.scene_title.clone();
            let content = attempt.content.clone();
            self.accept_scene(run, job_id, scene_id, title, content, fingerprint)
                .await?;
            return Ok(());
        }

        let mut instructions: Vec<String> = Vec::new();
        for round in 1..=self.limits.max_scene_regenerations {
            self.check_cancel(cancel)?;
            let evaluation = self.editor.evaluate_scene(&attempt, scene_id, &run.state).await?;
            debug!(%scene_id, round, decision = evaluation.tag(), "editor decision");

            match evaluation {
                EditorEvaluation::Accept {
                    edited_text,
                    fingerprint,
                    state_patch,
                } => match run.state.apply_patch(&state_patch) {
                    Ok(()) => {
                        let title = attempt.scene_title.clone();
                        self.accept_scene(run, job_id, scene_id, title, edited_text, fingerprint)
                            .await?;
                        return Ok(());
                    }
                    Err(PatchError::EscalationExhausted) => {
                        // Invariant violation is a regeneration trigger, not
                        // a crash.
                        instructions.push(
                            "the escalation budget is spent; the scene must not raise stakes"
                                .to_string(),
                        );
                    }
                },
                EditorEvaluation::Regenerate { instructions: i }
                | EditorEvaluation::Rewrite { instructions: i } => {
                    instructions.push(i);
                }
                EditorEvaluation::Drop { reason } => {
                    run.consecutive_drops += 1;
                    info!(%scene_id, %reason, drops = run.consecutive_drops, "scene dropped");
                    if run.consecutive_drops >= self.limits.max_consecutive_drops {
                        return Err(EngineError::NoForwardProgress(run.consecutive_drops));
                    }
                    return Ok(());
                }
                EditorEvaluation::Merge { reason } => {
                    self.merge_scene(run, job_id, scene_id, &attempt, &reason).await?;
                    return Ok(());
                }
            }

            if round < self.limits.max_scene_regenerations {
                self.check_cancel(cancel)?;
                attempt = self
                    .writer
                    .regenerate_scene(&run.state, &brief, scene_id, &instructions, &attempt)
                    .await?;
            }
        }

        // Retry budget exhausted: keep the last raw attempt rather than stall
        // the book.
        warn!(%scene_id, "retry budget exhausted, lossy-accepting raw scene");
        run.warnings.push(format!(
            "lossy-accept: scene {} kept after {} failed evaluations",
            scene_id, self.limits.max_scene_regenerations
        ));
        let fingerprint = SceneFingerprint::minimal(&scene_id.to_string());
        let title = attempt.scene_title.clone();
        let content = attempt.content.clone();
        self.accept_scene(run, job_id, scene_id, title, content, fingerprint)
            .await?;
        Ok(())
    }

    async fn accept_scene(
        &self,
        run: &mut RunState,
        job_id: &str,
        scene_id: SceneId,
        title: String,
        text: String,
        fingerprint: SceneFingerprint,
    ) -> Result<(), EngineError> {
        let word_count = count_words(&text);
        run.chapter.push_scene(title.clone(), text.clone(), word_count);
        run.state.record_scene_words(word_count);
        run.state.structure.scene_index += 1;
        run.state
            .repetition_registry
            .record(fingerprint, self.limits.fingerprint_window_size);
        run.accepted.push(AcceptedScene {
            scene_id: scene_id.to_string(),
            chapter_index: run.state.structure.chapter_index,
            title,
            content: text,
            word_count,
        });
        run.consecutive_drops = 0;

        if let Some(violation) = run
            .state
            .invariant_violation(self.limits.fingerprint_window_size, self.limits.act_overshoot_tolerance)
        {
            // Should be unreachable; made loud instead of silent.
            warn!(%scene_id, %violation, "narrative state invariant violated after accept");
        }

        self.write_checkpoint(run, job_id, &scene_id.to_string()).await?;
        info!(
            %scene_id,
            word_count,
            total_words = run.state.structure.words_written,
            "scene accepted"
        );
        Ok(())
    }

    /// MERGE: fold the scene into the previous one in this chapter; the scene
    /// index does not advance and no fingerprint is registered.
    async fn merge_scene(
        &self,
        run: &mut RunState,
        job_id: &str,
        scene_id: SceneId,
        attempt: &RawScene,
        reason: &str,
    ) -> Result<(), EngineError> {
        if !run.chapter.merge_into_last(&attempt.content, attempt.word_count) {
            // Nothing this chapter to merge into; the scene stands alone.
            let fingerprint = SceneFingerprint::minimal(&scene_id.to_string());
            return self
                .accept_scene(
                    run,
                    job_id,
                    scene_id,
                    attempt.scene_title.clone(),
                    attempt.content.clone(),
                    fingerprint,
                )
                .await;
        }

        run.state.record_scene_words(attempt.word_count);
        if let Some(last) = run.accepted.last_mut() {
            last.content.push_str("\n\n");
            last.content.push_str(&attempt.content);
            last.word_count += attempt.word_count;
        }
        run.consecutive_drops = 0;

        let tag = format!("{}.m{}", scene_id, run.seq + 1);
        self.write_checkpoint(run, job_id, &tag).await?;
        info!(%scene_id, reason, "scene merged into predecessor");
        Ok(())
    }

    fn roll_chapter(&self, run: &mut RunState) {
        info!(
            chapter = run.state.structure.chapter_index,
            words = run.chapter.total_words,
            "chapter closed"
        );
        run.state.structure.chapter_index += 1;
        run.chapter = ChapterBuffer::new(run.state.structure.chapter_index);
    }

    // ========================================================================
    // Phase: validate
    // ========================================================================

    /// Book-level validation. Non-fatal today: issues are logged into the job
    /// message. The scene loop stays re-enterable from here if a future
    /// revision decides to regenerate the tail instead.
    async fn validate_book(
        &self,
        run: &mut RunState,
        job_id: &str,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        progress.send(PROGRESS_ACTS_DONE, "validating book structure");
        self.check_cancel(cancel)?;

        let summary = story_summary(&run.state);
        let report = self.validator.validate_book(&run.state, &summary).await?;
        if !report.valid {
            warn!(job_id, issues = ?report.issues, "book validation found issues");
            run.warnings
                .push(format!("book validation: {}", report.issues.join("; ")));
        }

        self.write_checkpoint(run, job_id, "validated").await?;
        Ok(())
    }

    // ========================================================================
    // Phase: assemble
    // ========================================================================

    async fn assemble(
        &self,
        run: &mut RunState,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Manuscript, EngineError> {
        self.check_cancel(cancel)?;
        let front = self.planner.generate_front_matter(&run.state).await?;

        // Concatenate by chapter, in accepted order.
        let mut content = String::new();
        let mut chapter_count = 0;
        let mut current_chapter = 0;
        for scene in &run.accepted {
            if scene.chapter_index != current_chapter {
                current_chapter = scene.chapter_index;
                chapter_count += 1;
                if !content.is_empty() {
                    content.push_str("\n\n");
                }
                content.push_str(&format!("Chapter {current_chapter}\n\n"));
            } else {
                content.push_str("\n\n");
            }
            content.push_str(&scene.content);
        }

        let usage = self.usage_meter.as_ref().map(|m| m.usage()).unwrap_or_default();
        let manuscript = Manuscript {
            job_id: job_id.to_string(),
            title: front.title,
            blurb: front.blurb,
            content,
            stats: ManuscriptStats {
                word_count: run.state.structure.words_written,
                chapter_count,
                scene_count: run.accepted.len() as u32,
                act_count: run.state.structure.acts_total,
                llm_input_tokens: usage.input_tokens,
                llm_output_tokens: usage.output_tokens,
            },
        };

        self.check_cancel(cancel)?;
        self.manuscripts.write_manuscript(&manuscript).await?;
        info!(
            job_id,
            words = manuscript.stats.word_count,
            chapters = manuscript.stats.chapter_count,
            scenes = manuscript.stats.scene_count,
            "manuscript persisted"
        );
        Ok(manuscript)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn write_checkpoint(
        &self,
        run: &mut RunState,
        job_id: &str,
        phase_tag: &str,
    ) -> Result<(), EngineError> {
        run.seq += 1;
        let checkpoint = Checkpoint::new(
            job_id,
            phase_tag,
            run.seq,
            run.state.clone(),
            run.accepted.clone(),
        );
        self.checkpoints.write_checkpoint(&checkpoint).await?;
        Ok(())
    }

    /// Cancellation is honored at call boundaries: between LLM calls and
    /// before each scene, never mid-write.
    fn check_cancel(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

/// Acts-phase progress: proportional to words written, clamped to the
/// 10-80 span.
fn acts_progress(words_written: u32, target: u32) -> u8 {
    if target == 0 {
        return PROGRESS_ACTS_DONE;
    }
    let span = (PROGRESS_ACTS_DONE - PROGRESS_INIT_DONE) as u64;
    let scaled = PROGRESS_INIT_DONE as u64 + span * words_written.min(target) as u64 / target as u64;
    scaled.min(PROGRESS_ACTS_DONE as u64) as u8
}
