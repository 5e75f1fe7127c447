mod prompts;
pub mod editor;
pub mod planner;
pub mod validator;
pub mod writer;

pub use editor::LlmEditor;
pub use planner::LlmPlanner;
pub use validator::LlmValidator;
pub use writer::LlmWriter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::llm::LlmError;
use crate::models::{EditorEvaluation, JobInput, NarrativeState, RawScene, SceneBrief, SceneId};

/// Story-so-far text carried into prompts: prior act recaps plus the rolling
/// recap of the act in progress.
pub(crate) fn story_summary(state: &NarrativeState) -> String {
    let mut parts: Vec<&str> = state
        .summaries
        .prior_acts
        .iter()
        .map(String::as_str)
        .collect();
    if !state.summaries.current_act.is_empty() {
        parts.push(&state.summaries.current_act);
    }
    if parts.is_empty() {
        return "Nothing written yet.".to_string();
    }
    parts.join("\n\n")
}

/// Structured outline for one act.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActOutline {
    /// What the act must accomplish
    pub goal: String,
    /// Concrete beats, in order
    #[serde(default)]
    pub key_beats: Vec<String>,
    /// Conditions that must hold before the act may close
    #[serde(default)]
    pub close_conditions: Vec<String>,
    /// Questions the act keeps alive for later acts
    #[serde(default)]
    pub open_questions: Vec<String>,
}

impl ActOutline {
    /// The classic "goal / key beats / close condition" section rendering.
    pub fn render(&self) -> String {
        let mut out = format!("Goal: {}\n\nKey beats:\n", self.goal);
        for beat in &self.key_beats {
            out.push_str(&format!("- {beat}\n"));
        }
        out.push_str("\nClose conditions:\n");
        for condition in &self.close_conditions {
            out.push_str(&format!("- {condition}\n"));
        }
        out
    }
}

/// Title and blurb for the finished book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontMatter {
    pub title: String,
    pub blurb: String,
}

/// Result of an act- or book-level structural check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Derives initial state, act outlines, scene briefs, and front matter.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Seed the narrative state for a job: theme thesis, protagonist, act
    /// count, zeroed counters.
    async fn derive_initial_state(&self, input: &JobInput) -> Result<NarrativeState, LlmError>;

    /// One structured outline per act, `acts_total` of them.
    async fn generate_act_outlines(
        &self,
        state: &NarrativeState,
    ) -> Result<Vec<ActOutline>, LlmError>;

    /// Plan the next scene, consulting the repetition registry for forbidden
    /// functions and reveals.
    async fn generate_scene_brief(
        &self,
        state: &NarrativeState,
        act_outline: &ActOutline,
    ) -> Result<SceneBrief, LlmError>;

    /// Title and blurb, generated at assembly time.
    async fn generate_front_matter(&self, state: &NarrativeState) -> Result<FrontMatter, LlmError>;
}

/// Turns a scene brief plus state into raw prose.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn generate_scene(
        &self,
        state: &NarrativeState,
        brief: &SceneBrief,
        scene_id: SceneId,
    ) -> Result<RawScene, LlmError>;

    /// Same contract with appended negative constraints describing what went
    /// wrong with the previous attempt.
    async fn regenerate_scene(
        &self,
        state: &NarrativeState,
        brief: &SceneBrief,
        scene_id: SceneId,
        extra_constraints: &[String],
        previous_attempt: &RawScene,
    ) -> Result<RawScene, LlmError>;
}

/// Evaluates a raw scene against the state, producing a terminal decision.
#[async_trait]
pub trait Editor: Send + Sync {
    async fn evaluate_scene(
        &self,
        raw_scene: &RawScene,
        scene_id: SceneId,
        state: &NarrativeState,
    ) -> Result<EditorEvaluation, LlmError>;
}

/// Act-level and book-level structural checks.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate_act(
        &self,
        state: &NarrativeState,
        act_summary: &str,
    ) -> Result<ValidationReport, LlmError>;

    async fn validate_book(
        &self,
        state: &NarrativeState,
        book_summary: &str,
    ) -> Result<ValidationReport, LlmError>;
}
