//! LLM-backed editor: the decision point of the scene loop.
//!
//! The LLM produces an *assessment* of the draft (tentative fingerprint,
//! structural contributions, character changes, polished text); the terminal
//! decision is computed locally by [`decide`], a pure function over the
//! assessment and the narrative state. Decision precedence: DROP, then
//! REGENERATE, then REWRITE, then MERGE; ACCEPT only when nothing blocks.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::LimitsConfig;
use crate::llm::{JsonRequest, LlmClient, LlmError};
use crate::models::{
    EditorEvaluation, NarrativeState, PatchOp, RawScene, SceneFingerprint, SceneId, StatePatch,
};

use super::prompts::{self, EDITOR_SYSTEM};
use super::Editor;

// ============================================================================
// Assessment payload
// ============================================================================

/// What the LLM reports about a draft scene. Closed record; the decision
/// logic consumes this and nothing else.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SceneAssessment {
    pub fingerprint: AssessedFingerprint,
    /// The scene with sentence-level polish applied
    pub edited_text: String,
    /// Open close conditions this scene advances, quoted exactly
    #[serde(default)]
    pub advances_close_conditions: Vec<String>,
    #[serde(default)]
    pub introduces_questions: Vec<String>,
    #[serde(default)]
    pub resolves_questions: Vec<String>,
    /// Whether the scene raises stakes a discrete step
    #[serde(default)]
    pub uses_escalation: bool,
    #[serde(default)]
    pub character_changes: Vec<CharacterChange>,
    /// Elements deliberately set up to recur (exempt from repetition checks)
    #[serde(default)]
    pub establishes_motifs: Vec<String>,
    /// Story-so-far recap updated with this scene
    #[serde(default)]
    pub act_summary: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssessedFingerprint {
    pub narrative_function: String,
    #[serde(default)]
    pub new_information: Vec<String>,
    #[serde(default)]
    pub location_tag: String,
    #[serde(default)]
    pub beat_shape_signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CharacterChange {
    pub name: String,
    /// New absolute transformation in [0,1], when the scene moves the arc
    #[serde(default)]
    pub transformation: Option<f32>,
    /// Some(true): a loss becomes irreversible here.
    /// Some(false): the scene claims to undo one — an integrity violation.
    #[serde(default)]
    pub irreversible_loss: Option<bool>,
    #[serde(default)]
    pub costs: Vec<String>,
}

fn assessment_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "fingerprint": {
                "type": "object",
                "properties": {
                    "narrative_function": {"type": "string", "minLength": 1},
                    "new_information": {"type": "array", "items": {"type": "string"}},
                    "location_tag": {"type": "string"},
                    "beat_shape_signature": {"type": "string"}
                },
                "required": ["narrative_function"]
            },
            "edited_text": {"type": "string", "minLength": 1},
            "advances_close_conditions": {"type": "array", "items": {"type": "string"}},
            "introduces_questions": {"type": "array", "items": {"type": "string"}},
            "resolves_questions": {"type": "array", "items": {"type": "string"}},
            "uses_escalation": {"type": "boolean"},
            "character_changes": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "minLength": 1},
                        "transformation": {"type": ["number", "null"]},
                        "irreversible_loss": {"type": ["boolean", "null"]},
                        "costs": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["name"]
                }
            },
            "establishes_motifs": {"type": "array", "items": {"type": "string"}},
            "act_summary": {"type": "string"}
        },
        "required": ["fingerprint", "edited_text"]
    })
}

// ============================================================================
// Decision logic
// ============================================================================

/// First character-integrity violation in the assessment, if any.
fn character_violation(assessment: &SceneAssessment, state: &NarrativeState) -> Option<String> {
    for change in &assessment.character_changes {
        let Some(existing) = state.characters.get(&change.name) else {
            continue;
        };
        if let Some(to) = change.transformation {
            if to < existing.transformation {
                return Some(format!(
                    "{} regresses from transformation {:.2} to {:.2}; arcs only move forward",
                    change.name, existing.transformation, to
                ));
            }
        }
        if change.irreversible_loss == Some(false) && existing.irreversible_loss {
            return Some(format!(
                "{}'s loss was irreversible and cannot be undone",
                change.name
            ));
        }
    }
    None
}

/// Assemble the state patch for an accepted scene.
fn build_patch(
    assessment: &SceneAssessment,
    advances: &[String],
    resolves: &[String],
) -> StatePatch {
    let mut ops = Vec::new();
    for question in &assessment.introduces_questions {
        ops.push(PatchOp::AddUnresolvedQuestion {
            question: question.clone(),
        });
    }
    for question in resolves {
        ops.push(PatchOp::ResolveQuestion {
            question: question.clone(),
        });
    }
    for condition in advances {
        ops.push(PatchOp::SatisfyCloseCondition {
            condition: condition.clone(),
        });
    }
    if assessment.uses_escalation {
        ops.push(PatchOp::ConsumeEscalation);
    }
    for change in &assessment.character_changes {
        if let Some(to) = change.transformation {
            ops.push(PatchOp::TickTransformation {
                name: change.name.clone(),
                to,
            });
        }
        if change.irreversible_loss == Some(true) {
            ops.push(PatchOp::MarkIrreversibleLoss {
                name: change.name.clone(),
            });
        }
        for cost in &change.costs {
            ops.push(PatchOp::AddCost {
                name: change.name.clone(),
                cost: cost.clone(),
            });
        }
    }
    for motif in &assessment.establishes_motifs {
        ops.push(PatchOp::AddMotif {
            motif: motif.clone(),
        });
    }
    if !assessment.act_summary.is_empty() {
        ops.push(PatchOp::UpdateActSummary {
            summary: assessment.act_summary.clone(),
        });
    }
    StatePatch { ops }
}

/// Terminal decision for one assessed scene. Pure; all LLM judgment is
/// already folded into `assessment`.
pub fn decide(
    assessment: &SceneAssessment,
    raw_scene: &RawScene,
    scene_id: SceneId,
    state: &NarrativeState,
    limits: &LimitsConfig,
) -> EditorEvaluation {
    let fingerprint = SceneFingerprint {
        scene_id: scene_id.to_string(),
        narrative_function: assessment.fingerprint.narrative_function.clone(),
        new_information: assessment.fingerprint.new_information.clone(),
        pov: raw_scene.pov.clone(),
        location_tag: assessment.fingerprint.location_tag.clone(),
        beat_shape_signature: assessment.fingerprint.beat_shape_signature.clone(),
    };

    // Contributions only count against what is actually open in the state.
    let advances: Vec<String> = assessment
        .advances_close_conditions
        .iter()
        .filter(|c| state.act_state.act_close_conditions.contains(c))
        .cloned()
        .collect();
    let resolves: Vec<String> = assessment
        .resolves_questions
        .iter()
        .filter(|q| state.unresolved_questions.contains(q))
        .cloned()
        .collect();
    let structurally_sound =
        !advances.is_empty() || !resolves.is_empty() || !assessment.introduces_questions.is_empty();

    let repetition = state
        .repetition_registry
        .find_repetition(&fingerprint, limits.repetition_similarity_threshold);

    // A repeated scene with no structural contribution has no new narrative
    // function at all. DROP dominates MERGE.
    if let Some(prior) = repetition {
        if !structurally_sound {
            return EditorEvaluation::Drop {
                reason: format!(
                    "repeats {} ({}) and adds no new narrative function",
                    prior.scene_id, prior.narrative_function
                ),
            };
        }
    }

    if let Some(violation) = character_violation(assessment, state) {
        return EditorEvaluation::Regenerate {
            instructions: format!("character integrity: {violation}"),
        };
    }

    if !structurally_sound {
        if raw_scene.word_count >= limits.scene_min_words {
            return EditorEvaluation::Regenerate {
                instructions: "the scene advances no act close condition and neither opens nor \
                               resolves an unresolved question; give it a structural job"
                    .to_string(),
            };
        }
        return EditorEvaluation::Merge {
            reason: "small scene with no structural contribution of its own".to_string(),
        };
    }

    if let Some(prior) = repetition {
        return EditorEvaluation::Rewrite {
            instructions: format!(
                "duplicates scene {}: same narrative function ({}) covering the same information; \
                 keep the structural contribution but deliver it through different events",
                prior.scene_id, prior.narrative_function
            ),
        };
    }

    if assessment.uses_escalation && state.escalation_budget.remaining == 0 {
        return EditorEvaluation::Rewrite {
            instructions: "the escalation budget is spent; de-escalate and let the scene work \
                           through consequence instead of raised stakes"
                .to_string(),
        };
    }

    EditorEvaluation::Accept {
        edited_text: assessment.edited_text.clone(),
        fingerprint,
        state_patch: build_patch(assessment, &advances, &resolves),
    }
}

// ============================================================================
// LLM-backed editor
// ============================================================================

pub struct LlmEditor {
    llm: Arc<dyn LlmClient>,
    limits: LimitsConfig,
}

impl LlmEditor {
    pub fn new(llm: Arc<dyn LlmClient>, limits: LimitsConfig) -> Self {
        Self { llm, limits }
    }
}

#[async_trait]
impl Editor for LlmEditor {
    async fn evaluate_scene(
        &self,
        raw_scene: &RawScene,
        scene_id: SceneId,
        state: &NarrativeState,
    ) -> Result<EditorEvaluation, LlmError> {
        let characters: Vec<_> = state
            .characters
            .iter()
            .map(|(name, c)| {
                json!({
                    "name": name,
                    "transformation": c.transformation,
                    "irreversible_loss": c.irreversible_loss,
                })
            })
            .collect();
        let user_prompt = prompts::render(
            "assess_scene",
            json!({
                "content": raw_scene.content,
                "word_count": raw_scene.word_count,
                "pov": raw_scene.pov,
                "close_conditions": state.act_state.act_close_conditions,
                "unresolved_questions": state.unresolved_questions,
                "characters": characters,
                "escalation_remaining": state.escalation_budget.remaining,
            }),
        )?;
        let response = self
            .llm
            .generate_json(JsonRequest {
                system_prompt: EDITOR_SYSTEM.to_string(),
                user_prompt,
                schema: assessment_schema(),
                context_tag: format!("editor/{scene_id}"),
            })
            .await?;
        let assessment: SceneAssessment = response.parse()?;

        let evaluation = decide(&assessment, raw_scene, scene_id, state, &self.limits);
        debug!(%scene_id, decision = evaluation.tag(), "evaluated scene");
        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> LimitsConfig {
        LimitsConfig::default()
    }

    fn state() -> NarrativeState {
        let mut s = NarrativeState::new(
            "prompt".into(),
            "mystery".into(),
            30_000,
            "thesis".into(),
            "Ada".into(),
        );
        s.begin_act(
            "Establish the debt".into(),
            vec![],
            vec!["Ada learns who holds the debt".into()],
        );
        s.unresolved_questions.push("Who sent the letters?".into());
        s
    }

    fn raw(words: u32) -> RawScene {
        RawScene {
            scene_id: "a1.c1.s2".into(),
            scene_title: "The Ledger".into(),
            pov: "Ada".into(),
            content: "word ".repeat(words as usize),
            word_count: words,
        }
    }

    fn sound_assessment() -> SceneAssessment {
        SceneAssessment {
            fingerprint: AssessedFingerprint {
                narrative_function: "reveal".into(),
                new_information: vec!["the ledger names the harbormaster".into()],
                location_tag: "counting-house".into(),
                beat_shape_signature: "quiet-build-break".into(),
            },
            edited_text: "Polished scene text.".into(),
            advances_close_conditions: vec!["Ada learns who holds the debt".into()],
            ..SceneAssessment::default()
        }
    }

    fn scene_id() -> SceneId {
        SceneId {
            act: 1,
            chapter: 1,
            scene: 2,
        }
    }

    #[test]
    fn test_clean_scene_is_accepted_with_patch_and_fingerprint() {
        let eval = decide(&sound_assessment(), &raw(900), scene_id(), &state(), &limits());
        match eval {
            EditorEvaluation::Accept {
                edited_text,
                fingerprint,
                state_patch,
            } => {
                assert_eq!(edited_text, "Polished scene text.");
                assert_eq!(fingerprint.narrative_function, "reveal");
                assert_eq!(fingerprint.scene_id, "a1.c1.s2");
                assert!(state_patch.ops.contains(&PatchOp::SatisfyCloseCondition {
                    condition: "Ada learns who holds the debt".into()
                }));
            }
            other => panic!("expected accept, got {}", other.tag()),
        }
    }

    #[test]
    fn test_repetition_of_sound_scene_is_rewrite() {
        let mut s = state();
        // Register a prior scene with the same function and information.
        s.repetition_registry.record(
            SceneFingerprint {
                scene_id: "a1.c1.s1".into(),
                narrative_function: "reveal".into(),
                new_information: vec!["the ledger names the harbormaster".into()],
                pov: "Ada".into(),
                location_tag: "counting-house".into(),
                beat_shape_signature: "quiet-build-break".into(),
            },
            20,
        );
        let eval = decide(&sound_assessment(), &raw(900), scene_id(), &s, &limits());
        match eval {
            EditorEvaluation::Rewrite { instructions } => {
                assert!(instructions.contains("a1.c1.s1"));
            }
            other => panic!("expected rewrite, got {}", other.tag()),
        }
    }

    #[test]
    fn test_repetition_with_no_new_function_is_drop() {
        let mut s = state();
        s.repetition_registry.record(
            SceneFingerprint {
                scene_id: "a1.c1.s1".into(),
                narrative_function: "mood".into(),
                new_information: vec!["fog on the harbor".into()],
                pov: "Ada".into(),
                location_tag: "pier".into(),
                beat_shape_signature: "quiet".into(),
            },
            20,
        );
        let assessment = SceneAssessment {
            fingerprint: AssessedFingerprint {
                narrative_function: "mood".into(),
                new_information: vec!["fog on the harbor".into()],
                ..AssessedFingerprint::default()
            },
            edited_text: "text".into(),
            ..SceneAssessment::default()
        };
        // Only the fingerprint's info counts as "new"; it is all repeated and
        // the scene contributes nothing structural.
        let eval = decide(&assessment, &raw(900), scene_id(), &s, &limits());
        assert!(matches!(eval, EditorEvaluation::Drop { .. }));
    }

    #[test]
    fn test_motif_repetition_is_permitted() {
        let mut s = state();
        s.repetition_registry.motifs.push("reveal".into());
        s.repetition_registry.record(
            SceneFingerprint {
                scene_id: "a1.c1.s1".into(),
                narrative_function: "reveal".into(),
                new_information: vec!["the ledger names the harbormaster".into()],
                pov: "Ada".into(),
                location_tag: "counting-house".into(),
                beat_shape_signature: "quiet-build-break".into(),
            },
            20,
        );
        let eval = decide(&sound_assessment(), &raw(900), scene_id(), &s, &limits());
        assert!(matches!(eval, EditorEvaluation::Accept { .. }));
    }

    #[test]
    fn test_unsound_large_scene_is_regenerate() {
        let assessment = SceneAssessment {
            fingerprint: AssessedFingerprint {
                narrative_function: "digression".into(),
                new_information: vec!["a recipe for chowder".into()],
                ..AssessedFingerprint::default()
            },
            edited_text: "text".into(),
            ..SceneAssessment::default()
        };
        let eval = decide(&assessment, &raw(900), scene_id(), &state(), &limits());
        match eval {
            EditorEvaluation::Regenerate { instructions } => {
                assert!(instructions.contains("structural"));
            }
            other => panic!("expected regenerate, got {}", other.tag()),
        }
    }

    #[test]
    fn test_unsound_small_scene_is_merge() {
        let assessment = SceneAssessment {
            fingerprint: AssessedFingerprint {
                narrative_function: "transition".into(),
                new_information: vec!["dawn comes".into()],
                ..AssessedFingerprint::default()
            },
            edited_text: "text".into(),
            ..SceneAssessment::default()
        };
        let eval = decide(&assessment, &raw(200), scene_id(), &state(), &limits());
        assert!(matches!(eval, EditorEvaluation::Merge { .. }));
    }

    #[test]
    fn test_transformation_regression_forces_regenerate() {
        let mut s = state();
        s.characters.get_mut("Ada").unwrap().transformation = 0.5;
        let mut assessment = sound_assessment();
        assessment.character_changes = vec![CharacterChange {
            name: "Ada".into(),
            transformation: Some(0.2),
            irreversible_loss: None,
            costs: vec![],
        }];
        let eval = decide(&assessment, &raw(900), scene_id(), &s, &limits());
        match eval {
            EditorEvaluation::Regenerate { instructions } => {
                assert!(instructions.contains("character integrity"));
            }
            other => panic!("expected regenerate, got {}", other.tag()),
        }
    }

    #[test]
    fn test_undoing_irreversible_loss_forces_regenerate() {
        let mut s = state();
        s.characters.get_mut("Ada").unwrap().irreversible_loss = true;
        let mut assessment = sound_assessment();
        assessment.character_changes = vec![CharacterChange {
            name: "Ada".into(),
            transformation: None,
            irreversible_loss: Some(false),
            costs: vec![],
        }];
        let eval = decide(&assessment, &raw(900), scene_id(), &s, &limits());
        assert!(matches!(eval, EditorEvaluation::Regenerate { .. }));
    }

    #[test]
    fn test_regenerate_dominates_rewrite() {
        // Both a repetition (rewrite trigger) and a character violation
        // (regenerate trigger) apply; regenerate wins.
        let mut s = state();
        s.characters.get_mut("Ada").unwrap().transformation = 0.5;
        s.repetition_registry.record(
            SceneFingerprint {
                scene_id: "a1.c1.s1".into(),
                narrative_function: "reveal".into(),
                new_information: vec!["the ledger names the harbormaster".into()],
                pov: "Ada".into(),
                location_tag: "counting-house".into(),
                beat_shape_signature: "quiet-build-break".into(),
            },
            20,
        );
        let mut assessment = sound_assessment();
        assessment.character_changes = vec![CharacterChange {
            name: "Ada".into(),
            transformation: Some(0.1),
            irreversible_loss: None,
            costs: vec![],
        }];
        let eval = decide(&assessment, &raw(900), scene_id(), &s, &limits());
        assert!(matches!(eval, EditorEvaluation::Regenerate { .. }));
    }

    #[test]
    fn test_escalation_without_budget_is_rewrite() {
        let mut s = state();
        s.escalation_budget.remaining = 0;
        let mut assessment = sound_assessment();
        assessment.uses_escalation = true;
        let eval = decide(&assessment, &raw(900), scene_id(), &s, &limits());
        match eval {
            EditorEvaluation::Rewrite { instructions } => {
                assert!(instructions.contains("de-escalate"));
            }
            other => panic!("expected rewrite, got {}", other.tag()),
        }
    }

    #[test]
    fn test_legitimate_escalation_is_patched() {
        let mut assessment = sound_assessment();
        assessment.uses_escalation = true;
        let eval = decide(&assessment, &raw(900), scene_id(), &state(), &limits());
        match eval {
            EditorEvaluation::Accept { state_patch, .. } => {
                assert!(state_patch.ops.contains(&PatchOp::ConsumeEscalation));
            }
            other => panic!("expected accept, got {}", other.tag()),
        }
    }

    #[test]
    fn test_patch_only_resolves_questions_that_exist() {
        let mut assessment = sound_assessment();
        assessment.resolves_questions = vec![
            "Who sent the letters?".into(),
            "A question nobody asked".into(),
        ];
        let eval = decide(&assessment, &raw(900), scene_id(), &state(), &limits());
        match eval {
            EditorEvaluation::Accept { state_patch, .. } => {
                assert!(state_patch.ops.contains(&PatchOp::ResolveQuestion {
                    question: "Who sent the letters?".into()
                }));
                assert!(!state_patch.ops.iter().any(|op| matches!(
                    op,
                    PatchOp::ResolveQuestion { question } if question == "A question nobody asked"
                )));
            }
            other => panic!("expected accept, got {}", other.tag()),
        }
    }
}
