pub mod agents;
pub mod config;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod storage;
pub mod worker;

// Re-export main types
pub use config::EngineConfig;
pub use llm::{HttpLlmClient, LlmClient, LlmError};
pub use models::{
    Checkpoint, JobInput, JobRecord, JobStatus, Manuscript, Mode, NarrativeState,
};
pub use orchestrator::{EngineError, JobOutcome, Orchestrator, ProgressSender};
pub use storage::{CheckpointStore, FileStore, InMemoryStore, ManuscriptSink};
pub use worker::{InMemoryQueue, JobQueue, Worker};
