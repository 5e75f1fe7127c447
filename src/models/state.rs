//! NarrativeState - the single source of truth threaded through every agent call.
//!
//! The state is created once per job, mutated only through typed [`StatePatch`]
//! application plus the orchestrator-owned position/word counters, and
//! discarded after the manuscript is persisted. Patches are a closed set of
//! operations whose application is total and invariant-preserving: character
//! transformation is monotonic-max, irreversible loss is monotonic-OR, and
//! unresolved questions shrink only through explicit resolution ops.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::scene::SceneFingerprint;

/// Current schema version for serialized state.
/// Bump when adding/removing/modifying fields.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Act count as a deterministic function of the word target.
///
/// Ladder: 1 act for novellas up to 10k words, then 2/3/4 acts at the
/// 25k/60k/120k steps, 5 acts for anything longer.
pub fn acts_for_target(target_length_words: u32) -> u32 {
    match target_length_words {
        0..=10_000 => 1,
        10_001..=25_000 => 2,
        25_001..=60_000 => 3,
        60_001..=120_000 => 4,
        _ => 5,
    }
}

// ============================================================================
// Sub-records
// ============================================================================

/// Book-level position counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructureState {
    /// Total number of acts for this book (fixed at init)
    pub acts_total: u32,
    /// Current act, 1-indexed
    pub act_index: u32,
    /// Current chapter, 1-indexed, monotonic across acts
    pub chapter_index: u32,
    /// Current scene within the book, 1-indexed
    pub scene_index: u32,
    /// Total accepted words across all acts
    pub words_written: u32,
    /// Accepted words of each completed act, in order
    #[serde(default)]
    pub prior_act_words: Vec<u32>,
}

/// State of the act currently being written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActState {
    /// What this act must accomplish
    pub act_goal: String,
    /// Questions this act is expected to keep in play
    #[serde(default)]
    pub act_open_questions: Vec<String>,
    /// Conditions that must be met before the act can close
    #[serde(default)]
    pub act_close_conditions: Vec<String>,
    /// Word budget for this act
    pub act_words_target: u32,
    /// Accepted words so far in this act
    pub act_words_written: u32,
}

/// Per-character continuity record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterState {
    /// Arc progress in [0, 1]; monotonically non-decreasing
    pub transformation: f32,
    /// Once true, never reverts
    pub irreversible_loss: bool,
    /// Costs this character has paid, in story order
    #[serde(default)]
    pub costs_incurred: Vec<String>,
}

/// Bounded ring of recent fingerprints plus intentionally recurring motifs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepetitionRegistry {
    /// Most recent accepted-scene fingerprints, oldest first
    #[serde(default)]
    pub recent_fingerprints: Vec<SceneFingerprint>,
    /// Narrative functions that are allowed to recur
    #[serde(default)]
    pub motifs: Vec<String>,
}

impl RepetitionRegistry {
    /// Append a fingerprint and trim the ring to `window` entries.
    pub fn record(&mut self, fingerprint: SceneFingerprint, window: usize) {
        self.recent_fingerprints.push(fingerprint);
        if self.recent_fingerprints.len() > window {
            let excess = self.recent_fingerprints.len() - window;
            self.recent_fingerprints.drain(..excess);
        }
    }

    /// Find a registered fingerprint that `candidate` repeats, if any.
    ///
    /// Two fingerprints repeat when they share a narrative function and their
    /// new-information overlap reaches `similarity_threshold` (token Jaccard).
    /// Motif functions are exempt.
    pub fn find_repetition(
        &self,
        candidate: &SceneFingerprint,
        similarity_threshold: f64,
    ) -> Option<&SceneFingerprint> {
        if self.is_motif(&candidate.narrative_function) {
            return None;
        }
        self.recent_fingerprints.iter().find(|prior| {
            prior.narrative_function == candidate.narrative_function
                && prior.new_information_similarity(candidate) >= similarity_threshold
        })
    }

    /// Whether a narrative function is an intentionally recurring motif.
    pub fn is_motif(&self, narrative_function: &str) -> bool {
        self.motifs
            .iter()
            .any(|m| m.eq_ignore_ascii_case(narrative_function))
    }
}

/// Discrete pool of stake-escalation tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationBudget {
    pub remaining: u32,
}

/// Compressed recaps carried into every prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summaries {
    /// Rolling recap of the act in progress
    pub current_act: String,
    /// One recap per completed act, in order
    #[serde(default)]
    pub prior_acts: Vec<String>,
}

// ============================================================================
// Patch operations
// ============================================================================

/// One invariant-preserving mutation proposed by the Editor.
///
/// Application is total: ops referencing unknown characters create them, ops
/// that would regress a monotonic field degrade to no-ops, and resolution of
/// an unknown question is ignored. The single failure mode is escalation
/// underflow, which the orchestrator converts into a regeneration trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Raise a character's transformation (monotonic max, clamped to [0, 1])
    TickTransformation { name: String, to: f32 },
    /// Mark a character's loss as irreversible (monotonic OR)
    MarkIrreversibleLoss { name: String },
    /// Record a cost the character paid in this scene
    AddCost { name: String, cost: String },
    /// Open a new narrative question
    AddUnresolvedQuestion { question: String },
    /// Explicitly resolve an open narrative question
    ResolveQuestion { question: String },
    /// Spend one stake-escalation token
    ConsumeEscalation,
    /// Mark an act close condition as satisfied
    SatisfyCloseCondition { condition: String },
    /// Register an intentionally recurring motif
    AddMotif { motif: String },
    /// Replace the rolling recap of the current act
    UpdateActSummary { summary: String },
}

/// Ordered set of patch operations from one accepted scene.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    pub ops: Vec<PatchOp>,
}

impl StatePatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Failure applying a patch. Not a crash: the orchestrator treats this as a
/// regeneration trigger for the offending scene.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PatchError {
    #[error("escalation budget exhausted: scene consumes a token but none remain")]
    EscalationExhausted,
}

// ============================================================================
// NarrativeState
// ============================================================================

/// The mutable record threaded through every agent call for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeState {
    /// Schema version for migration support
    pub schema_version: u32,
    /// Original user prompt (immutable)
    pub prompt: String,
    /// Genre tag (immutable)
    pub genre: String,
    /// Word-count goal (immutable)
    pub target_length_words: u32,
    /// One-sentence thematic claim, set once at init
    pub theme_thesis: String,
    /// Name of the protagonist seeded at init
    pub protagonist: String,
    pub structure: StructureState,
    pub act_state: ActState,
    /// Character continuity, keyed by name
    #[serde(default)]
    pub characters: BTreeMap<String, CharacterState>,
    pub repetition_registry: RepetitionRegistry,
    pub escalation_budget: EscalationBudget,
    /// Open narrative questions, oldest first
    #[serde(default)]
    pub unresolved_questions: Vec<String>,
    pub summaries: Summaries,
}

impl NarrativeState {
    /// Seed a fresh state for a job. The planner fills `theme_thesis` and the
    /// protagonist entry; everything else starts zeroed.
    pub fn new(
        prompt: String,
        genre: String,
        target_length_words: u32,
        theme_thesis: String,
        protagonist: String,
    ) -> Self {
        let acts_total = acts_for_target(target_length_words);
        let mut characters = BTreeMap::new();
        characters.insert(protagonist.clone(), CharacterState::default());

        Self {
            schema_version: STATE_SCHEMA_VERSION,
            prompt,
            genre,
            target_length_words,
            theme_thesis,
            protagonist,
            structure: StructureState {
                acts_total,
                act_index: 0,
                chapter_index: 1,
                scene_index: 0,
                words_written: 0,
                prior_act_words: Vec::new(),
            },
            act_state: ActState::default(),
            characters,
            repetition_registry: RepetitionRegistry::default(),
            escalation_budget: EscalationBudget {
                remaining: acts_total * 2,
            },
            unresolved_questions: Vec::new(),
            summaries: Summaries::default(),
        }
    }

    /// Apply an editor-proposed patch. Monotonic fields never regress; the
    /// only error is escalation underflow.
    pub fn apply_patch(&mut self, patch: &StatePatch) -> Result<(), PatchError> {
        // Validate before mutating so a failed patch leaves the state intact.
        let escalations = patch
            .ops
            .iter()
            .filter(|op| matches!(op, PatchOp::ConsumeEscalation))
            .count() as u32;
        if escalations > self.escalation_budget.remaining {
            return Err(PatchError::EscalationExhausted);
        }

        for op in &patch.ops {
            match op {
                PatchOp::TickTransformation { name, to } => {
                    let entry = self.characters.entry(name.clone()).or_default();
                    entry.transformation = entry.transformation.max(to.clamp(0.0, 1.0));
                }
                PatchOp::MarkIrreversibleLoss { name } => {
                    self.characters.entry(name.clone()).or_default().irreversible_loss = true;
                }
                PatchOp::AddCost { name, cost } => {
                    self.characters
                        .entry(name.clone())
                        .or_default()
                        .costs_incurred
                        .push(cost.clone());
                }
                PatchOp::AddUnresolvedQuestion { question } => {
                    if !self.unresolved_questions.contains(question) {
                        self.unresolved_questions.push(question.clone());
                    }
                }
                PatchOp::ResolveQuestion { question } => {
                    self.unresolved_questions.retain(|q| q != question);
                }
                PatchOp::ConsumeEscalation => {
                    self.escalation_budget.remaining -= 1;
                }
                PatchOp::SatisfyCloseCondition { condition } => {
                    self.act_state.act_close_conditions.retain(|c| c != condition);
                }
                PatchOp::AddMotif { motif } => {
                    if !self.repetition_registry.motifs.contains(motif) {
                        self.repetition_registry.motifs.push(motif.clone());
                    }
                }
                PatchOp::UpdateActSummary { summary } => {
                    self.summaries.current_act = summary.clone();
                }
            }
        }
        Ok(())
    }

    /// Whether a proposed patch would contradict character continuity.
    ///
    /// Patches cannot express a regression directly (application is
    /// monotonic), so this detects the editor *intending* one: a
    /// transformation tick strictly below the character's current value.
    pub fn patch_regresses_character(&self, patch: &StatePatch) -> Option<String> {
        for op in &patch.ops {
            if let PatchOp::TickTransformation { name, to } = op {
                if let Some(existing) = self.characters.get(name) {
                    if *to < existing.transformation {
                        return Some(name.clone());
                    }
                }
            }
        }
        None
    }

    /// Record accepted words against both the book and act counters.
    pub fn record_scene_words(&mut self, words: u32) {
        self.structure.words_written = self.structure.words_written.saturating_add(words);
        self.act_state.act_words_written =
            self.act_state.act_words_written.saturating_add(words);
    }

    /// Enter the next act, folding the finished act into history.
    pub fn begin_act(&mut self, act_goal: String, open_questions: Vec<String>, close_conditions: Vec<String>) {
        if self.structure.act_index > 0 {
            self.structure
                .prior_act_words
                .push(self.act_state.act_words_written);
            if !self.summaries.current_act.is_empty() {
                self.summaries
                    .prior_acts
                    .push(std::mem::take(&mut self.summaries.current_act));
            }
        }
        self.structure.act_index += 1;
        let remaining_acts = self
            .structure
            .acts_total
            .saturating_sub(self.structure.act_index - 1)
            .max(1);
        let remaining_words = self
            .target_length_words
            .saturating_sub(self.structure.words_written);
        self.act_state = ActState {
            act_goal,
            act_open_questions: open_questions,
            act_close_conditions: close_conditions,
            act_words_target: remaining_words / remaining_acts,
            act_words_written: 0,
        };
    }

    /// Whether the current act has met its word budget.
    pub fn act_complete(&self) -> bool {
        self.act_state.act_words_written >= self.act_state.act_words_target
    }

    /// Check the cross-field invariants that must hold after any accepted
    /// scene. Returns a description of the first violation found.
    pub fn invariant_violation(&self, window: usize, act_overshoot_tolerance: f64) -> Option<String> {
        let act_sum: u32 = self
            .structure
            .prior_act_words
            .iter()
            .sum::<u32>()
            .saturating_add(self.act_state.act_words_written);
        if self.structure.words_written != act_sum {
            return Some(format!(
                "words_written {} != sum of act words {}",
                self.structure.words_written, act_sum
            ));
        }
        let act_ceiling =
            (self.act_state.act_words_target as f64 * (1.0 + act_overshoot_tolerance)) as u32;
        if self.act_state.act_words_target > 0 && self.act_state.act_words_written > act_ceiling {
            return Some(format!(
                "act {} wrote {} words against a {} target (ceiling {})",
                self.structure.act_index,
                self.act_state.act_words_written,
                self.act_state.act_words_target,
                act_ceiling
            ));
        }
        if self.repetition_registry.recent_fingerprints.len() > window {
            return Some(format!(
                "fingerprint ring holds {} entries, window is {}",
                self.repetition_registry.recent_fingerprints.len(),
                window
            ));
        }
        for (name, character) in &self.characters {
            if !(0.0..=1.0).contains(&character.transformation) {
                return Some(format!(
                    "character {name} transformation {} out of range",
                    character.transformation
                ));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state() -> NarrativeState {
        NarrativeState::new(
            "A lighthouse keeper who cannot sleep".into(),
            "literary_fiction".into(),
            30_000,
            "Rest is earned by letting go".into(),
            "Maren".into(),
        )
    }

    #[test]
    fn test_acts_ladder() {
        assert_eq!(acts_for_target(5_000), 1);
        assert_eq!(acts_for_target(10_000), 1);
        assert_eq!(acts_for_target(20_000), 2);
        assert_eq!(acts_for_target(30_000), 3);
        assert_eq!(acts_for_target(60_000), 3);
        assert_eq!(acts_for_target(120_000), 4);
        assert_eq!(acts_for_target(150_000), 5);
    }

    #[test]
    fn test_new_state_seeds_protagonist_and_budget() {
        let s = state();
        assert_eq!(s.structure.acts_total, 3);
        assert_eq!(s.escalation_budget.remaining, 6);
        let protagonist = s.characters.get("Maren").unwrap();
        assert_eq!(protagonist.transformation, 0.0);
        assert!(!protagonist.irreversible_loss);
    }

    #[test]
    fn test_transformation_is_monotonic_max() {
        let mut s = state();
        s.apply_patch(&StatePatch {
            ops: vec![PatchOp::TickTransformation {
                name: "Maren".into(),
                to: 0.4,
            }],
        })
        .unwrap();
        assert_eq!(s.characters["Maren"].transformation, 0.4);

        // A lower tick degrades to a no-op.
        s.apply_patch(&StatePatch {
            ops: vec![PatchOp::TickTransformation {
                name: "Maren".into(),
                to: 0.2,
            }],
        })
        .unwrap();
        assert_eq!(s.characters["Maren"].transformation, 0.4);
    }

    #[test]
    fn test_irreversible_loss_never_reverts() {
        let mut s = state();
        s.apply_patch(&StatePatch {
            ops: vec![PatchOp::MarkIrreversibleLoss {
                name: "Maren".into(),
            }],
        })
        .unwrap();
        assert!(s.characters["Maren"].irreversible_loss);
        // No patch op can unset it; re-marking is idempotent.
        s.apply_patch(&StatePatch {
            ops: vec![PatchOp::MarkIrreversibleLoss {
                name: "Maren".into(),
            }],
        })
        .unwrap();
        assert!(s.characters["Maren"].irreversible_loss);
    }

    #[test]
    fn test_questions_shrink_only_through_resolution() {
        let mut s = state();
        s.apply_patch(&StatePatch {
            ops: vec![
                PatchOp::AddUnresolvedQuestion {
                    question: "Who lights the lamp?".into(),
                },
                PatchOp::AddUnresolvedQuestion {
                    question: "Why did the ship turn back?".into(),
                },
            ],
        })
        .unwrap();
        assert_eq!(s.unresolved_questions.len(), 2);

        // Resolving an unknown question is a no-op, not a silent drop of others.
        s.apply_patch(&StatePatch {
            ops: vec![PatchOp::ResolveQuestion {
                question: "Unasked question".into(),
            }],
        })
        .unwrap();
        assert_eq!(s.unresolved_questions.len(), 2);

        s.apply_patch(&StatePatch {
            ops: vec![PatchOp::ResolveQuestion {
                question: "Who lights the lamp?".into(),
            }],
        })
        .unwrap();
        assert_eq!(s.unresolved_questions, vec!["Why did the ship turn back?"]);
    }

    #[test]
    fn test_escalation_underflow_is_typed_and_leaves_state_intact() {
        let mut s = state();
        s.escalation_budget.remaining = 0;
        let patch = StatePatch {
            ops: vec![
                PatchOp::AddUnresolvedQuestion {
                    question: "A new thread".into(),
                },
                PatchOp::ConsumeEscalation,
            ],
        };
        let err = s.apply_patch(&patch).unwrap_err();
        assert_eq!(err, PatchError::EscalationExhausted);
        // The failed patch applied nothing.
        assert!(s.unresolved_questions.is_empty());
    }

    #[test]
    fn test_fingerprint_ring_trims_to_window() {
        let mut registry = RepetitionRegistry::default();
        for i in 0..30 {
            registry.record(
                SceneFingerprint::minimal(&format!("scene-{i}")),
                20,
            );
        }
        assert_eq!(registry.recent_fingerprints.len(), 20);
        // Oldest entries were trimmed.
        assert_eq!(registry.recent_fingerprints[0].scene_id, "scene-10");
    }

    #[test]
    fn test_begin_act_folds_history_and_rebalances_budget() {
        let mut s = state();
        s.begin_act("Introduce the lighthouse".into(), vec![], vec![]);
        assert_eq!(s.structure.act_index, 1);
        assert_eq!(s.act_state.act_words_target, 10_000);

        s.record_scene_words(12_000);
        s.begin_act("Lose the lamp".into(), vec![], vec![]);
        assert_eq!(s.structure.act_index, 2);
        assert_eq!(s.structure.prior_act_words, vec![12_000]);
        // Remaining 18k over 2 acts.
        assert_eq!(s.act_state.act_words_target, 9_000);
        assert!(s.invariant_violation(20, 0.15).is_none());
    }

    #[test]
    fn test_words_invariant_tracks_across_acts() {
        let mut s = state();
        s.begin_act("Act one".into(), vec![], vec![]);
        s.record_scene_words(900);
        s.record_scene_words(1_100);
        assert_eq!(s.structure.words_written, 2_000);
        assert_eq!(s.act_state.act_words_written, 2_000);
        assert!(s.invariant_violation(20, 0.15).is_none());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut s = state();
        s.begin_act("Act one".into(), vec!["q1".into()], vec!["c1".into()]);
        s.record_scene_words(800);
        s.repetition_registry
            .record(SceneFingerprint::minimal("1.1.1"), 20);
        let json = serde_json::to_string(&s).unwrap();
        let back: NarrativeState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    proptest! {
        /// Transformation never decreases under any tick sequence.
        #[test]
        fn prop_transformation_monotonic(ticks in proptest::collection::vec(-1.0f32..2.0, 0..40)) {
            let mut s = state();
            let mut last = 0.0f32;
            for to in ticks {
                s.apply_patch(&StatePatch {
                    ops: vec![PatchOp::TickTransformation { name: "Maren".into(), to }],
                }).unwrap();
                let now = s.characters["Maren"].transformation;
                prop_assert!(now >= last);
                prop_assert!((0.0..=1.0).contains(&now));
                last = now;
            }
        }

        /// Loss stays set once set, regardless of later ops.
        #[test]
        fn prop_loss_monotonic(ops in proptest::collection::vec(0usize..4, 1..30)) {
            let mut s = state();
            let mut seen_loss = false;
            for op in ops {
                let patch = match op {
                    0 => PatchOp::MarkIrreversibleLoss { name: "Maren".into() },
                    1 => PatchOp::TickTransformation { name: "Maren".into(), to: 0.5 },
                    2 => PatchOp::AddCost { name: "Maren".into(), cost: "sleep".into() },
                    _ => PatchOp::AddUnresolvedQuestion { question: "q".into() },
                };
                if matches!(patch, PatchOp::MarkIrreversibleLoss { .. }) {
                    seen_loss = true;
                }
                s.apply_patch(&StatePatch { ops: vec![patch] }).unwrap();
                if seen_loss {
                    prop_assert!(s.characters["Maren"].irreversible_loss);
                }
            }
        }

        /// The fingerprint ring never exceeds its window.
        #[test]
        fn prop_ring_bounded(count in 0usize..100, window in 1usize..40) {
            let mut registry = RepetitionRegistry::default();
            for i in 0..count {
                registry.record(SceneFingerprint::minimal(&format!("s{i}")), window);
                prop_assert!(registry.recent_fingerprints.len() <= window);
            }
        }
    }
}
