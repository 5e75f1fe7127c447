//! End-to-end tests for the generation engine over deterministic scripted
//! agents. The LLM never enters the picture: the planner, writer, editor and
//! validator stubs produce the same output for the same state every time, so
//! whole-job behaviors (word accounting, repetition registry, retries, drops,
//! resume, cancellation) are exact assertions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tale_forge::agents::{
    ActOutline, Editor, FrontMatter, Planner, ValidationReport, Validator, Writer,
};
use tale_forge::config::LimitsConfig;
use tale_forge::llm::LlmError;
use tale_forge::models::{
    EditorEvaluation, JobInput, Mode, NarrativeState, PatchOp, RawScene, SceneBrief,
    SceneFingerprint, SceneId, StatePatch,
};
use tale_forge::orchestrator::{EngineError, Orchestrator, ProgressSender};
use tale_forge::storage::{CheckpointStore, InMemoryStore};

// ============================================================================
// Scripted agents
// ============================================================================

#[derive(Default)]
struct ScriptedPlanner {
    brief_calls: AtomicUsize,
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn derive_initial_state(&self, input: &JobInput) -> Result<NarrativeState, LlmError> {
        Ok(NarrativeState::new(
            input.prompt.clone(),
            input.genre.clone(),
            input.target_length_words,
            "Letters carry second lives".to_string(),
            "Maren".to_string(),
        ))
    }

    async fn generate_act_outlines(
        &self,
        state: &NarrativeState,
    ) -> Result<Vec<ActOutline>, LlmError> {
        Ok((1..=state.structure.acts_total)
            .map(|act| ActOutline {
                goal: format!("Act {act} goal"),
                key_beats: vec![format!("act {act} beat")],
                close_conditions: vec![format!("act {act} turns")],
                open_questions: vec![format!("act {act} question")],
            })
            .collect())
    }

    async fn generate_scene_brief(
        &self,
        state: &NarrativeState,
        act_outline: &ActOutline,
    ) -> Result<SceneBrief, LlmError> {
        self.brief_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = state
            .act_state
            .act_words_target
            .saturating_sub(state.act_state.act_words_written);
        Ok(SceneBrief {
            goal: act_outline.goal.clone(),
            pov: "Maren".to_string(),
            setting: "the coast".to_string(),
            obligatory_beats: vec![],
            forbidden_repetitions: vec![],
            word_target: remaining.clamp(400, 1200),
        })
    }

    async fn generate_front_matter(
        &self,
        _state: &NarrativeState,
    ) -> Result<FrontMatter, LlmError> {
        Ok(FrontMatter {
            title: "The Second Life of Letters".to_string(),
            blurb: "A quiet librarian finds a correspondence that refuses to stay past."
                .to_string(),
        })
    }
}

#[derive(Default)]
struct ScriptedWriter {
    calls: AtomicUsize,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ScriptedWriter {
    /// Exactly `words` tokens; the first names the attempt so rewritten text
    /// is distinguishable.
    fn content(words: u32, seq: usize, attempt: u32) -> String {
        let mut tokens = vec![format!("attempt{attempt}")];
        for i in 1..words {
            tokens.push(format!("w{seq}n{i}"));
        }
        tokens.join(" ")
    }

    fn scene(&self, brief: &SceneBrief, scene_id: SceneId, attempt: u32) -> RawScene {
        let seq = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        RawScene {
            scene_id: scene_id.to_string(),
            scene_title: format!("Scene {scene_id}"),
            pov: brief.pov.clone(),
            content: Self::content(brief.word_target, seq, attempt),
            word_count: brief.word_target,
        }
    }
}

#[async_trait]
impl Writer for ScriptedWriter {
    async fn generate_scene(
        &self,
        _state: &NarrativeState,
        brief: &SceneBrief,
        scene_id: SceneId,
    ) -> Result<RawScene, LlmError> {
        self.attempts
            .lock()
            .unwrap()
            .insert(scene_id.to_string(), 1);
        Ok(self.scene(brief, scene_id, 1))
    }

    async fn regenerate_scene(
        &self,
        _state: &NarrativeState,
        brief: &SceneBrief,
        scene_id: SceneId,
        extra_constraints: &[String],
        _previous_attempt: &RawScene,
    ) -> Result<RawScene, LlmError> {
        assert!(
            !extra_constraints.is_empty(),
            "regeneration always carries instructions"
        );
        let mut attempts = self.attempts.lock().unwrap();
        let attempt = attempts.entry(scene_id.to_string()).or_insert(1);
        *attempt += 1;
        let attempt = *attempt;
        drop(attempts);
        Ok(self.scene(brief, scene_id, attempt))
    }
}

/// Behavior of the scripted editor, keyed by the ordinal of the scene being
/// evaluated (`scene_index + 1`, which only advances on accept).
enum EditorBehavior {
    AlwaysAccept,
    /// Rewrite the first evaluation of scene `ordinal`, accept after
    RewriteOnceAt(u32),
    /// Drop every odd-numbered evaluation
    DropOddEvaluations,
    /// Regenerate every evaluation of scene `ordinal`
    RegenerateAllAt(u32),
    AlwaysDrop,
}

struct ScriptedEditor {
    behavior: EditorBehavior,
    calls: AtomicUsize,
    per_scene: Mutex<HashMap<String, u32>>,
    /// Fail fatally when this scene ordinal is first evaluated (simulated crash)
    fail_at_ordinal: Option<u32>,
    /// Cancel this token right after accepting scene `n`
    cancel_after: Option<(u32, CancellationToken)>,
}

impl ScriptedEditor {
    fn new(behavior: EditorBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            per_scene: Mutex::new(HashMap::new()),
            fail_at_ordinal: None,
            cancel_after: None,
        }
    }

    fn failing_at(mut self, ordinal: u32) -> Self {
        self.fail_at_ordinal = Some(ordinal);
        self
    }

    fn cancelling_after(mut self, ordinal: u32, token: CancellationToken) -> Self {
        self.cancel_after = Some((ordinal, token));
        self
    }

    /// Deterministic accept: fingerprint and patch derive from the scene id,
    /// so interrupted and uninterrupted runs converge on the same state.
    fn accept(&self, raw: &RawScene, scene_id: SceneId, state: &NarrativeState) -> EditorEvaluation {
        let ordinal = state.structure.scene_index + 1;
        let mut ops = vec![
            PatchOp::TickTransformation {
                name: "Maren".to_string(),
                to: (0.03 * ordinal as f32).min(1.0),
            },
            PatchOp::UpdateActSummary {
                summary: format!("The story has reached scene {scene_id}."),
            },
        ];
        if ordinal == 10 {
            ops.push(PatchOp::MarkIrreversibleLoss {
                name: "Maren".to_string(),
            });
        }
        if let Some((after, token)) = &self.cancel_after {
            if ordinal == *after {
                token.cancel();
            }
        }
        EditorEvaluation::Accept {
            edited_text: raw.content.clone(),
            fingerprint: SceneFingerprint {
                scene_id: scene_id.to_string(),
                narrative_function: format!("advance-{scene_id}"),
                new_information: vec![format!("information {scene_id}")],
                pov: raw.pov.clone(),
                location_tag: "coast".to_string(),
                beat_shape_signature: "build".to_string(),
            },
            state_patch: StatePatch { ops },
        }
    }
}

#[async_trait]
impl Editor for ScriptedEditor {
    async fn evaluate_scene(
        &self,
        raw_scene: &RawScene,
        scene_id: SceneId,
        state: &NarrativeState,
    ) -> Result<EditorEvaluation, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let ordinal = state.structure.scene_index + 1;
        if self.fail_at_ordinal == Some(ordinal) {
            return Err(LlmError::Fatal("provider credentials revoked".to_string()));
        }
        let evals_of_scene = {
            let mut per_scene = self.per_scene.lock().unwrap();
            let count = per_scene.entry(format!("{ordinal}")).or_insert(0);
            *count += 1;
            *count
        };

        Ok(match &self.behavior {
            EditorBehavior::AlwaysAccept => self.accept(raw_scene, scene_id, state),
            EditorBehavior::RewriteOnceAt(target) => {
                if ordinal == *target && evals_of_scene == 1 {
                    EditorEvaluation::Rewrite {
                        instructions: "duplicate reveal; deliver new information instead"
                            .to_string(),
                    }
                } else {
                    self.accept(raw_scene, scene_id, state)
                }
            }
            EditorBehavior::DropOddEvaluations => {
                if call % 2 == 1 {
                    EditorEvaluation::Drop {
                        reason: "no new narrative function".to_string(),
                    }
                } else {
                    self.accept(raw_scene, scene_id, state)
                }
            }
            EditorBehavior::RegenerateAllAt(target) => {
                if ordinal == *target {
                    EditorEvaluation::Regenerate {
                        instructions: "the stakes of the scene are unreadable".to_string(),
                    }
                } else {
                    self.accept(raw_scene, scene_id, state)
                }
            }
            EditorBehavior::AlwaysDrop => EditorEvaluation::Drop {
                reason: "nothing new".to_string(),
            },
        })
    }
}

#[derive(Default)]
struct ScriptedValidator {
    calls: AtomicUsize,
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate_act(
        &self,
        _state: &NarrativeState,
        _act_summary: &str,
    ) -> Result<ValidationReport, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ValidationReport {
            valid: true,
            issues: vec![],
        })
    }

    async fn validate_book(
        &self,
        _state: &NarrativeState,
        _book_summary: &str,
    ) -> Result<ValidationReport, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ValidationReport {
            valid: true,
            issues: vec![],
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    planner: Arc<ScriptedPlanner>,
    writer: Arc<ScriptedWriter>,
    editor: Arc<ScriptedEditor>,
    store: Arc<InMemoryStore>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new(editor: ScriptedEditor) -> Self {
        Self::with_store(editor, Arc::new(InMemoryStore::new()))
    }

    fn with_store(editor: ScriptedEditor, store: Arc<InMemoryStore>) -> Self {
        let planner = Arc::new(ScriptedPlanner::default());
        let writer = Arc::new(ScriptedWriter::default());
        let editor = Arc::new(editor);
        let orchestrator = Orchestrator::new(
            planner.clone(),
            writer.clone(),
            editor.clone(),
            Arc::new(ScriptedValidator::default()),
            store.clone(),
            store.clone(),
            LimitsConfig::default(),
        );
        Self {
            planner,
            writer,
            editor,
            store,
            orchestrator,
        }
    }
}

fn input(target: u32, mode: Mode) -> JobInput {
    JobInput {
        prompt: "A quiet librarian discovers a second life in letters.".to_string(),
        genre: "literary_fiction".to_string(),
        target_length_words: target,
        voice: None,
        mode,
    }
}

// ============================================================================
// Scenario 1: draft-mode happy path
// ============================================================================

#[tokio::test]
async fn draft_mode_happy_path() {
    let harness = Harness::new(ScriptedEditor::new(EditorBehavior::AlwaysAccept));
    let (progress, mut progress_rx) = ProgressSender::channel();
    let cancel = CancellationToken::new();

    let outcome = harness
        .orchestrator
        .run_job("draft-1", &input(30_000, Mode::Draft), &progress, &cancel)
        .await
        .expect("draft job succeeds");

    // Draft mode never consults the editor.
    assert_eq!(harness.editor.calls.load(Ordering::SeqCst), 0);

    let stats = &outcome.manuscript.stats;
    assert!(
        (24_000..=36_000).contains(&stats.word_count),
        "word count {} outside +/-20% of target",
        stats.word_count
    );
    assert!(
        (8..=10).contains(&stats.chapter_count),
        "unexpected chapter count {}",
        stats.chapter_count
    );
    assert_eq!(stats.act_count, 3);
    assert!(outcome.warnings.is_empty());
    assert_eq!(harness.store.manuscript_write_count("draft-1"), 1);

    // Progress is monotonically non-decreasing and terminal.
    let mut last = 0;
    while let Ok(update) = progress_rx.try_recv() {
        assert!(update.percent >= last, "progress went backwards");
        last = update.percent;
    }
    assert_eq!(last, 100);

    // Final state invariants hold.
    let latest = harness
        .store
        .read_latest_checkpoint("draft-1")
        .await
        .unwrap()
        .unwrap();
    assert!(latest.narrative_state.invariant_violation(20, 0.15).is_none());
    assert_eq!(latest.narrative_state.structure.words_written, stats.word_count);
}

// ============================================================================
// Scenario 2: polished mode with one forced rewrite
// ============================================================================

#[tokio::test]
async fn polished_mode_forced_rewrite() {
    let harness = Harness::new(ScriptedEditor::new(EditorBehavior::RewriteOnceAt(7)));
    let (progress, _rx) = ProgressSender::channel();
    let cancel = CancellationToken::new();

    let outcome = harness
        .orchestrator
        .run_job("polish-1", &input(30_000, Mode::Polished), &progress, &cancel)
        .await
        .expect("polished job succeeds");

    let latest = harness
        .store
        .read_latest_checkpoint("polish-1")
        .await
        .unwrap()
        .unwrap();

    // Scene 7's final text is the second attempt, not the first.
    let scene7 = &latest.accepted_scenes[6];
    assert!(scene7.content.contains("attempt2"));
    assert!(!scene7.content.contains("attempt1"));
    // Every other scene kept its first draft.
    assert!(latest.accepted_scenes[5].content.contains("attempt1"));

    // The registry ring is capped at the window, not the scene count.
    let registry = &latest.narrative_state.repetition_registry;
    assert_eq!(
        registry.recent_fingerprints.len(),
        latest.accepted_scenes.len().min(20)
    );
    assert_eq!(registry.recent_fingerprints.len(), 20);

    assert!(outcome.warnings.is_empty());
}

// ============================================================================
// Scenario 3: DROP convergence
// ============================================================================

#[tokio::test]
async fn drop_convergence() {
    let harness = Harness::new(ScriptedEditor::new(EditorBehavior::DropOddEvaluations));
    let (progress, _rx) = ProgressSender::channel();
    let cancel = CancellationToken::new();

    let outcome = harness
        .orchestrator
        .run_job("drops-1", &input(30_000, Mode::Polished), &progress, &cancel)
        .await
        .expect("job converges despite drops");

    let stats = &outcome.manuscript.stats;
    assert!(
        (24_000..=36_000).contains(&stats.word_count),
        "accepted scenes compensate for drops, got {}",
        stats.word_count
    );

    // More drafts were attempted than scenes persisted.
    let attempted = harness.writer.calls.load(Ordering::SeqCst);
    assert!(attempted as u32 > stats.scene_count);
}

// ============================================================================
// Scenario 4: editor retry exhaustion
// ============================================================================

#[tokio::test]
async fn retry_exhaustion_lossy_accepts() {
    let harness = Harness::new(ScriptedEditor::new(EditorBehavior::RegenerateAllAt(12)));
    let (progress, _rx) = ProgressSender::channel();
    let cancel = CancellationToken::new();

    let outcome = harness
        .orchestrator
        .run_job("lossy-1", &input(30_000, Mode::Polished), &progress, &cancel)
        .await
        .expect("job succeeds with lossy accept");

    assert!(
        outcome.warnings.iter().any(|w| w.contains("lossy-accept")),
        "warnings: {:?}",
        outcome.warnings
    );

    let latest = harness
        .store
        .read_latest_checkpoint("lossy-1")
        .await
        .unwrap()
        .unwrap();
    // Scene 12 is the raw text of the third attempt (initial + 2 regenerations).
    let scene12 = &latest.accepted_scenes[11];
    assert!(scene12.content.contains("attempt3"));
    assert_eq!(harness.store.manuscript_write_count("lossy-1"), 1);
}

// ============================================================================
// Scenario 5: resume from checkpoint
// ============================================================================

#[tokio::test]
async fn resume_from_checkpoint_matches_uninterrupted_run() {
    // Control: an uninterrupted run of the same job shape.
    let control = Harness::new(ScriptedEditor::new(EditorBehavior::AlwaysAccept));
    let (progress, _rx) = ProgressSender::channel();
    control
        .orchestrator
        .run_job(
            "control",
            &input(30_000, Mode::Polished),
            &progress,
            &CancellationToken::new(),
        )
        .await
        .expect("control run succeeds");
    let control_final = control
        .store
        .read_latest_checkpoint("control")
        .await
        .unwrap()
        .unwrap();

    // Crash run: the editor dies fatally when scene 16 is first evaluated.
    let store = Arc::new(InMemoryStore::new());
    let crashed = Harness::with_store(
        ScriptedEditor::new(EditorBehavior::AlwaysAccept).failing_at(16),
        store.clone(),
    );
    let (progress, _rx) = ProgressSender::channel();
    let err = crashed
        .orchestrator
        .run_job(
            "resumable",
            &input(30_000, Mode::Polished),
            &progress,
            &CancellationToken::new(),
        )
        .await
        .expect_err("job crashes at scene 16");
    assert_eq!(err.tag(), "fatal");

    let at_crash = store
        .read_latest_checkpoint("resumable")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(at_crash.accepted_scenes.len(), 15);

    // Resume with a healthy editor over the same store.
    let resumed = Harness::with_store(
        ScriptedEditor::new(EditorBehavior::AlwaysAccept),
        store.clone(),
    );
    let (progress, _rx) = ProgressSender::channel();
    let outcome = resumed
        .orchestrator
        .run_job(
            "resumable",
            &input(30_000, Mode::Polished),
            &progress,
            &CancellationToken::new(),
        )
        .await
        .expect("resumed run completes");

    // The resumed run planned only the remaining scenes.
    let control_briefs = control.planner.brief_calls.load(Ordering::SeqCst);
    let resumed_briefs = resumed.planner.brief_calls.load(Ordering::SeqCst);
    assert_eq!(resumed_briefs, control_briefs - 15);

    // Totals and final narrative state match the uninterrupted run exactly.
    let resumed_final = store
        .read_latest_checkpoint("resumable")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        resumed_final.accepted_scenes.len(),
        control_final.accepted_scenes.len()
    );
    assert_eq!(resumed_final.narrative_state, control_final.narrative_state);
    assert_eq!(
        outcome.manuscript.stats.word_count,
        control_final.narrative_state.structure.words_written
    );
}

// ============================================================================
// Scenario 6: cancellation
// ============================================================================

#[tokio::test]
async fn cancellation_is_honored_at_scene_boundary() {
    let cancel = CancellationToken::new();
    let harness = Harness::new(
        ScriptedEditor::new(EditorBehavior::AlwaysAccept).cancelling_after(5, cancel.clone()),
    );
    let (progress, _rx) = ProgressSender::channel();

    let err = harness
        .orchestrator
        .run_job("cancel-1", &input(30_000, Mode::Polished), &progress, &cancel)
        .await
        .expect_err("cancelled job fails");
    assert_eq!(err.tag(), "cancelled");

    // The scene-5 checkpoint is preserved; nothing from scene 6 exists.
    let latest = harness
        .store
        .read_latest_checkpoint("cancel-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.accepted_scenes.len(), 5);
    assert!(latest.phase_tag.ends_with("s5"));

    // No partial manuscript reaches the sink.
    assert_eq!(harness.store.manuscript_write_count("cancel-1"), 0);
}

// ============================================================================
// No forward progress
// ============================================================================

#[tokio::test]
async fn consecutive_drops_fail_the_job() {
    let harness = Harness::new(ScriptedEditor::new(EditorBehavior::AlwaysDrop));
    let (progress, _rx) = ProgressSender::channel();
    let cancel = CancellationToken::new();

    let err = harness
        .orchestrator
        .run_job("stuck-1", &input(30_000, Mode::Polished), &progress, &cancel)
        .await
        .expect_err("job fails for lack of progress");

    assert_eq!(err.tag(), "no-forward-progress");
    assert!(matches!(err, EngineError::NoForwardProgress(5)));
    assert_eq!(harness.store.manuscript_write_count("stuck-1"), 0);
}

// ============================================================================
// Boundary behaviors: act ladder edges
// ============================================================================

#[tokio::test]
async fn minimum_target_yields_single_act_book() {
    let harness = Harness::new(ScriptedEditor::new(EditorBehavior::AlwaysAccept));
    let (progress, _rx) = ProgressSender::channel();
    let cancel = CancellationToken::new();

    let outcome = harness
        .orchestrator
        .run_job("tiny-1", &input(5_000, Mode::Draft), &progress, &cancel)
        .await
        .expect("small book succeeds");

    assert_eq!(outcome.manuscript.stats.act_count, 1);
    assert!(outcome.manuscript.stats.chapter_count >= 1);
}

#[tokio::test]
async fn large_target_yields_five_acts() {
    let harness = Harness::new(ScriptedEditor::new(EditorBehavior::AlwaysAccept));
    let (progress, _rx) = ProgressSender::channel();
    let cancel = CancellationToken::new();

    let outcome = harness
        .orchestrator
        .run_job("epic-1", &input(150_000, Mode::Draft), &progress, &cancel)
        .await
        .expect("large book succeeds");

    assert_eq!(outcome.manuscript.stats.act_count, 5);
    assert!((120_000..=180_000).contains(&outcome.manuscript.stats.word_count));
}
