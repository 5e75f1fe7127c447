//! Job, checkpoint, and manuscript records.

use serde::{Deserialize, Serialize};

use super::state::NarrativeState;

/// Current schema version for checkpoint files.
/// Bump when adding/removing/modifying fields.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Job input
// ============================================================================

/// Generation mode. Draft skips the editor loop entirely for throughput, at
/// the cost of weaker repetition protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Draft,
    Polished,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(Mode::Draft),
            "polished" => Ok(Mode::Polished),
            _ => Err(format!("Invalid mode: '{s}'. Available: draft, polished")),
        }
    }
}

/// Everything the API layer submits for one book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInput {
    pub prompt: String,
    pub genre: String,
    pub target_length_words: u32,
    /// Optional narration voice directive passed through to the writer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub mode: Mode,
}

// ============================================================================
// Job record
// ============================================================================

/// Lifecycle status of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// The queue-owned record for one job. The orchestrator never writes this
/// directly; it flows through progress callbacks and terminal completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub input: JobInput,
    pub status: JobStatus,
    /// Percent complete, 0-100, monotonically non-decreasing
    pub progress: u8,
    pub message: String,
    /// Classification tag plus short diagnostic, set on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRecord {
    pub fn new(id: String, input: JobInput) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id,
            input,
            status: JobStatus::Queued,
            progress: 0,
            message: String::new(),
            error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

/// One accepted scene as recorded in the checkpoint log. Carries the full
/// text so resume can rebuild chapters and the final manuscript without
/// re-generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedScene {
    pub scene_id: String,
    pub chapter_index: u32,
    pub title: String,
    pub content: String,
    pub word_count: u32,
}

/// Durable snapshot of a job: narrative state plus the accepted-scene log.
/// Append-only per job; the latest is canonical. Idempotent by
/// `(job_id, phase_tag)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub job_id: String,
    /// Position marker, e.g. "init", "a2.c5.s12", "validated"
    pub phase_tag: String,
    /// Monotonically increasing within a job; orders checkpoints
    pub seq: u64,
    pub narrative_state: NarrativeState,
    #[serde(default)]
    pub accepted_scenes: Vec<AcceptedScene>,
    pub created_at: String,
}

impl Checkpoint {
    pub fn new(
        job_id: &str,
        phase_tag: &str,
        seq: u64,
        narrative_state: NarrativeState,
        accepted_scenes: Vec<AcceptedScene>,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            job_id: job_id.to_string(),
            phase_tag: phase_tag.to_string(),
            seq,
            narrative_state,
            accepted_scenes,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ============================================================================
// Manuscript
// ============================================================================

/// Aggregate counts for a finished manuscript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManuscriptStats {
    pub word_count: u32,
    pub chapter_count: u32,
    pub scene_count: u32,
    pub act_count: u32,
    /// Total LLM tokens spent generating the book
    pub llm_input_tokens: u64,
    pub llm_output_tokens: u64,
}

/// The finished book, written exactly once on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manuscript {
    pub job_id: String,
    pub title: String,
    pub blurb: String,
    pub content: String,
    pub stats: ManuscriptStats,
}
