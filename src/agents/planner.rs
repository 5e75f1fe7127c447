//! LLM-backed planner: initial state, act outlines, scene briefs, front matter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::config::LimitsConfig;
use crate::llm::{JsonRequest, LlmClient, LlmError};
use crate::models::{JobInput, NarrativeState, SceneBrief};

use super::prompts::{self, PLANNER_SYSTEM};
use super::{story_summary, ActOutline, FrontMatter, Planner};

pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    limits: LimitsConfig,
}

#[derive(Debug, Deserialize)]
struct InitialStatePayload {
    theme_thesis: String,
    protagonist: String,
}

#[derive(Debug, Deserialize)]
struct ActOutlinesPayload {
    acts: Vec<ActOutline>,
}

#[derive(Debug, Deserialize)]
struct SceneBriefPayload {
    goal: String,
    pov: String,
    setting: String,
    #[serde(default)]
    obligatory_beats: Vec<String>,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, limits: LimitsConfig) -> Self {
        Self { llm, limits }
    }

    /// Forbidden functions and reveals derived from the registry ring,
    /// motifs excluded.
    fn forbidden_repetitions(state: &NarrativeState) -> Vec<String> {
        let registry = &state.repetition_registry;
        let mut forbidden = Vec::new();
        for fingerprint in &registry.recent_fingerprints {
            if registry.is_motif(&fingerprint.narrative_function) {
                continue;
            }
            let function = format!("narrative function: {}", fingerprint.narrative_function);
            if !forbidden.contains(&function) && fingerprint.narrative_function != "unknown" {
                forbidden.push(function);
            }
            for reveal in &fingerprint.new_information {
                let entry = format!("reveal: {reveal}");
                if !forbidden.contains(&entry) {
                    forbidden.push(entry);
                }
            }
        }
        forbidden
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn derive_initial_state(&self, input: &JobInput) -> Result<NarrativeState, LlmError> {
        let acts_total = crate::models::acts_for_target(input.target_length_words);
        let user_prompt = prompts::render(
            "initial_state",
            json!({
                "prompt": input.prompt,
                "genre": input.genre,
                "target_length_words": input.target_length_words,
                "acts_total": acts_total,
            }),
        )?;
        let response = self
            .llm
            .generate_json(JsonRequest {
                system_prompt: PLANNER_SYSTEM.to_string(),
                user_prompt,
                schema: json!({
                    "type": "object",
                    "properties": {
                        "theme_thesis": {"type": "string", "minLength": 1},
                        "protagonist": {"type": "string", "minLength": 1}
                    },
                    "required": ["theme_thesis", "protagonist"]
                }),
                context_tag: "planner/init".to_string(),
            })
            .await?;
        let payload: InitialStatePayload = response.parse()?;

        info!(
            protagonist = %payload.protagonist,
            acts_total, "derived initial narrative state"
        );
        Ok(NarrativeState::new(
            input.prompt.clone(),
            input.genre.clone(),
            input.target_length_words,
            payload.theme_thesis,
            payload.protagonist,
        ))
    }

    async fn generate_act_outlines(
        &self,
        state: &NarrativeState,
    ) -> Result<Vec<ActOutline>, LlmError> {
        let user_prompt = prompts::render(
            "act_outlines",
            json!({
                "prompt": state.prompt,
                "genre": state.genre,
                "theme_thesis": state.theme_thesis,
                "protagonist": state.protagonist,
                "acts_total": state.structure.acts_total,
            }),
        )?;
        let response = self
            .llm
            .generate_json(JsonRequest {
                system_prompt: PLANNER_SYSTEM.to_string(),
                user_prompt,
                schema: json!({
                    "type": "object",
                    "properties": {
                        "acts": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "goal": {"type": "string", "minLength": 1},
                                    "key_beats": {"type": "array", "items": {"type": "string"}},
                                    "close_conditions": {"type": "array", "items": {"type": "string"}},
                                    "open_questions": {"type": "array", "items": {"type": "string"}}
                                },
                                "required": ["goal", "close_conditions"]
                            }
                        }
                    },
                    "required": ["acts"]
                }),
                context_tag: "planner/outlines".to_string(),
            })
            .await?;
        let payload: ActOutlinesPayload = response.parse()?;

        // No partial outline is usable; a miscounted plan is a contract breach.
        if payload.acts.len() != state.structure.acts_total as usize {
            return Err(LlmError::Schema(format!(
                "expected {} act outlines, got {}",
                state.structure.acts_total,
                payload.acts.len()
            )));
        }
        Ok(payload.acts)
    }

    async fn generate_scene_brief(
        &self,
        state: &NarrativeState,
        act_outline: &ActOutline,
    ) -> Result<SceneBrief, LlmError> {
        let remaining = state
            .act_state
            .act_words_target
            .saturating_sub(state.act_state.act_words_written);
        let word_target = remaining.clamp(self.limits.scene_min_words, self.limits.scene_max_words);
        let forbidden = Self::forbidden_repetitions(state);

        let user_prompt = prompts::render(
            "scene_brief",
            json!({
                "act_index": state.structure.act_index,
                "acts_total": state.structure.acts_total,
                "scene_index": state.structure.scene_index + 1,
                "act_words_remaining": remaining,
                "act_outline": act_outline.render(),
                "close_conditions": state.act_state.act_close_conditions,
                "unresolved_questions": state.unresolved_questions,
                "summary": story_summary(state),
                "forbidden_repetitions": forbidden,
                "word_target": word_target,
            }),
        )?;
        let response = self
            .llm
            .generate_json(JsonRequest {
                system_prompt: PLANNER_SYSTEM.to_string(),
                user_prompt,
                schema: json!({
                    "type": "object",
                    "properties": {
                        "goal": {"type": "string", "minLength": 1},
                        "pov": {"type": "string", "minLength": 1},
                        "setting": {"type": "string"},
                        "obligatory_beats": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["goal", "pov"]
                }),
                context_tag: format!(
                    "planner/brief/a{}.s{}",
                    state.structure.act_index,
                    state.structure.scene_index + 1
                ),
            })
            .await?;
        let payload: SceneBriefPayload = response.parse()?;

        Ok(SceneBrief {
            goal: payload.goal,
            pov: payload.pov,
            setting: payload.setting,
            obligatory_beats: payload.obligatory_beats,
            forbidden_repetitions: forbidden,
            word_target,
        })
    }

    async fn generate_front_matter(&self, state: &NarrativeState) -> Result<FrontMatter, LlmError> {
        let user_prompt = prompts::render(
            "front_matter",
            json!({
                "genre": state.genre,
                "theme_thesis": state.theme_thesis,
                "book_summary": story_summary(state),
            }),
        )?;
        let response = self
            .llm
            .generate_json(JsonRequest {
                system_prompt: PLANNER_SYSTEM.to_string(),
                user_prompt,
                schema: json!({
                    "type": "object",
                    "properties": {
                        "title": {"type": "string", "minLength": 1},
                        "blurb": {"type": "string", "minLength": 1}
                    },
                    "required": ["title", "blurb"]
                }),
                context_tag: "planner/front-matter".to_string(),
            })
            .await?;
        response.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SceneFingerprint;

    #[test]
    fn test_forbidden_repetitions_skip_motifs_and_unknowns() {
        let mut state = NarrativeState::new(
            "p".into(),
            "g".into(),
            30_000,
            "t".into(),
            "Ada".into(),
        );
        state.repetition_registry.motifs.push("letter arrives".into());
        state.repetition_registry.record(
            SceneFingerprint {
                scene_id: "a1.c1.s1".into(),
                narrative_function: "reveal".into(),
                new_information: vec!["the brother drowned".into()],
                pov: "Ada".into(),
                location_tag: "pier".into(),
                beat_shape_signature: "build".into(),
            },
            20,
        );
        state.repetition_registry.record(
            SceneFingerprint {
                scene_id: "a1.c1.s2".into(),
                narrative_function: "letter arrives".into(),
                new_information: vec!["a second letter".into()],
                pov: "Ada".into(),
                location_tag: "house".into(),
                beat_shape_signature: "quiet".into(),
            },
            20,
        );
        state
            .repetition_registry
            .record(SceneFingerprint::minimal("a1.c1.s3"), 20);

        let forbidden = LlmPlanner::forbidden_repetitions(&state);
        assert!(forbidden.contains(&"narrative function: reveal".to_string()));
        assert!(forbidden.contains(&"reveal: the brother drowned".to_string()));
        // Motif functions are exempt entirely.
        assert!(!forbidden.iter().any(|f| f.contains("letter arrives")));
        // Draft-mode minimal fingerprints contribute nothing.
        assert!(!forbidden.iter().any(|f| f.contains("unknown")));
    }
}
