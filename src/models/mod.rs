pub mod evaluation;
pub mod job;
pub mod scene;
pub mod state;

pub use evaluation::EditorEvaluation;
pub use job::{
    AcceptedScene, Checkpoint, JobInput, JobRecord, JobStatus, Manuscript, ManuscriptStats, Mode,
    CHECKPOINT_SCHEMA_VERSION,
};
pub use scene::{
    count_words, ChapterBuffer, ChapterScene, RawScene, SceneBrief, SceneFingerprint, SceneId,
};
pub use state::{
    acts_for_target, ActState, CharacterState, EscalationBudget, NarrativeState, PatchError,
    PatchOp, RepetitionRegistry, StatePatch, StructureState, Summaries, STATE_SCHEMA_VERSION,
};
