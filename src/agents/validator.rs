//! LLM-backed structural validator with local floors.
//!
//! The LLM judges coherence; the hard structural floors (protagonist
//! transformation, irreversible loss, trailing questions) are checked in code
//! and merged into the same report so they cannot be argued away.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::config::LimitsConfig;
use crate::llm::{JsonRequest, LlmClient, LlmError};
use crate::models::NarrativeState;

use super::prompts::{self, VALIDATOR_SYSTEM};
use super::{ValidationReport, Validator};

pub struct LlmValidator {
    llm: Arc<dyn LlmClient>,
    limits: LimitsConfig,
}

fn report_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "valid": {"type": "boolean"},
            "issues": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["valid"]
    })
}

impl LlmValidator {
    pub fn new(llm: Arc<dyn LlmClient>, limits: LimitsConfig) -> Self {
        Self { llm, limits }
    }

    /// Book-close floors that hold regardless of the LLM's judgment.
    fn structural_issues(&self, state: &NarrativeState) -> Vec<String> {
        let mut issues = Vec::new();
        match state.characters.get(&state.protagonist) {
            Some(protagonist) => {
                if protagonist.transformation < self.limits.transformation_threshold {
                    issues.push(format!(
                        "protagonist transformation {:.2} is below the {:.2} floor",
                        protagonist.transformation, self.limits.transformation_threshold
                    ));
                }
                if !protagonist.irreversible_loss {
                    issues.push("protagonist never suffered an irreversible loss".to_string());
                }
            }
            None => issues.push(format!(
                "protagonist {} is missing from the character registry",
                state.protagonist
            )),
        }
        if state.unresolved_questions.len() > self.limits.trailing_questions_ceiling {
            issues.push(format!(
                "{} unresolved questions remain; at most {} may trail",
                state.unresolved_questions.len(),
                self.limits.trailing_questions_ceiling
            ));
        }
        issues
    }
}

#[async_trait]
impl Validator for LlmValidator {
    async fn validate_act(
        &self,
        state: &NarrativeState,
        act_summary: &str,
    ) -> Result<ValidationReport, LlmError> {
        let user_prompt = prompts::render(
            "validate_act",
            json!({
                "act_goal": state.act_state.act_goal,
                "close_conditions": state.act_state.act_close_conditions,
                "act_summary": act_summary,
            }),
        )?;
        let response = self
            .llm
            .generate_json(JsonRequest {
                system_prompt: VALIDATOR_SYSTEM.to_string(),
                user_prompt,
                schema: report_schema(),
                context_tag: format!("validator/act{}", state.structure.act_index),
            })
            .await?;
        let report: ValidationReport = response.parse()?;
        if !report.valid {
            info!(
                act = state.structure.act_index,
                issues = report.issues.len(),
                "act validation found issues"
            );
        }
        Ok(report)
    }

    async fn validate_book(
        &self,
        state: &NarrativeState,
        book_summary: &str,
    ) -> Result<ValidationReport, LlmError> {
        let protagonist = state.characters.get(&state.protagonist);
        let user_prompt = prompts::render(
            "validate_book",
            json!({
                "theme_thesis": state.theme_thesis,
                "protagonist": state.protagonist,
                "transformation": protagonist.map(|c| c.transformation).unwrap_or(0.0),
                "irreversible_loss": protagonist.map(|c| c.irreversible_loss).unwrap_or(false),
                "unresolved_questions": state.unresolved_questions,
                "book_summary": book_summary,
            }),
        )?;
        let response = self
            .llm
            .generate_json(JsonRequest {
                system_prompt: VALIDATOR_SYSTEM.to_string(),
                user_prompt,
                schema: report_schema(),
                context_tag: "validator/book".to_string(),
            })
            .await?;
        let mut report: ValidationReport = response.parse()?;

        let structural = self.structural_issues(state);
        if !structural.is_empty() {
            report.valid = false;
            report.issues.extend(structural);
        }
        Ok(report)
    }
}
