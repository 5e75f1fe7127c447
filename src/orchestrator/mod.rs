pub mod engine;
pub mod progress;

pub use engine::{EngineError, JobOutcome, Orchestrator};
pub use progress::{ProgressSender, ProgressUpdate};
