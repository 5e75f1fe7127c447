//! The editor's terminal decision, modeled as a closed five-variant sum.
//!
//! Payload placement is the type-level contract: edited text, fingerprint and
//! state patch exist only on `Accept`; instructions exist only on the two
//! retry variants.

use serde::{Deserialize, Serialize};

use super::scene::SceneFingerprint;
use super::state::StatePatch;

/// Terminal decision for one raw scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum EditorEvaluation {
    /// The scene stands. Carries the polished text, the fingerprint to
    /// register, and the state patch to apply.
    Accept {
        edited_text: String,
        fingerprint: SceneFingerprint,
        state_patch: StatePatch,
    },
    /// The scene must be written again from the brief.
    Regenerate { instructions: String },
    /// The scene is structurally sound but must be revised in place.
    Rewrite { instructions: String },
    /// The scene adds nothing; discard it and move on.
    Drop { reason: String },
    /// The scene is too small to stand alone; fold it into the previous one.
    Merge { reason: String },
}

impl EditorEvaluation {
    /// Short tag for logs and job messages.
    pub fn tag(&self) -> &'static str {
        match self {
            EditorEvaluation::Accept { .. } => "accept",
            EditorEvaluation::Regenerate { .. } => "regenerate",
            EditorEvaluation::Rewrite { .. } => "rewrite",
            EditorEvaluation::Drop { .. } => "drop",
            EditorEvaluation::Merge { .. } => "merge",
        }
    }

    /// Instructions carried by the retry variants, if any.
    pub fn instructions(&self) -> Option<&str> {
        match self {
            EditorEvaluation::Regenerate { instructions }
            | EditorEvaluation::Rewrite { instructions } => Some(instructions),
            _ => None,
        }
    }
}
