mod settings;

pub use settings::{EngineConfig, LimitsConfig, LlmConfig, StorageConfig, WorkerConfig};
