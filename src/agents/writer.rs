//! LLM-backed writer: scene briefs in, raw prose out.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::llm::{JsonRequest, LlmClient, LlmError};
use crate::models::{count_words, NarrativeState, RawScene, SceneBrief, SceneId};

use super::prompts::{self, WRITER_SYSTEM};
use super::{story_summary, Writer};

pub struct LlmWriter {
    llm: Arc<dyn LlmClient>,
    /// Optional narration voice directive threaded from the job input
    voice: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScenePayload {
    scene_title: String,
    content: String,
}

impl LlmWriter {
    pub fn new(llm: Arc<dyn LlmClient>, voice: Option<String>) -> Self {
        Self { llm, voice }
    }

    async fn draft(
        &self,
        state: &NarrativeState,
        brief: &SceneBrief,
        scene_id: SceneId,
        rewrite_section: Option<String>,
    ) -> Result<RawScene, LlmError> {
        let mut user_prompt = prompts::render(
            "write_scene",
            json!({
                "genre": state.genre,
                "theme_thesis": state.theme_thesis,
                "voice": self.voice,
                "summary": story_summary(state),
                "goal": brief.goal,
                "pov": brief.pov,
                "setting": brief.setting,
                "obligatory_beats": brief.obligatory_beats,
                "forbidden_repetitions": brief.forbidden_repetitions,
                "word_target": brief.word_target,
            }),
        )?;
        if let Some(section) = rewrite_section {
            user_prompt.push_str(&section);
        }

        let response = self
            .llm
            .generate_json(JsonRequest {
                system_prompt: WRITER_SYSTEM.to_string(),
                user_prompt,
                schema: json!({
                    "type": "object",
                    "properties": {
                        "scene_title": {"type": "string", "minLength": 1},
                        "content": {"type": "string", "minLength": 1}
                    },
                    "required": ["scene_title", "content"]
                }),
                context_tag: format!("writer/{scene_id}"),
            })
            .await?;
        let payload: ScenePayload = response.parse()?;

        // The word count is ours to measure, never the model's to report.
        let word_count = count_words(&payload.content);
        debug!(%scene_id, word_count, target = brief.word_target, "drafted scene");

        Ok(RawScene {
            scene_id: scene_id.to_string(),
            scene_title: payload.scene_title,
            pov: brief.pov.clone(),
            content: payload.content,
            word_count,
        })
    }
}

#[async_trait]
impl Writer for LlmWriter {
    async fn generate_scene(
        &self,
        state: &NarrativeState,
        brief: &SceneBrief,
        scene_id: SceneId,
    ) -> Result<RawScene, LlmError> {
        self.draft(state, brief, scene_id, None).await
    }

    async fn regenerate_scene(
        &self,
        state: &NarrativeState,
        brief: &SceneBrief,
        scene_id: SceneId,
        extra_constraints: &[String],
        previous_attempt: &RawScene,
    ) -> Result<RawScene, LlmError> {
        let section = prompts::render(
            "rewrite_constraints",
            json!({
                "previous_content": previous_attempt.content,
                "constraints": extra_constraints,
            }),
        )?;
        self.draft(state, brief, scene_id, Some(section)).await
    }
}
