use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::Mode;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Max concurrent jobs per worker process
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Job queue endpoint
    #[serde(default = "default_queue_url")]
    pub queue_url: String,
    /// Interval between job-lease keep-alive extensions, in seconds
    #[serde(default = "default_lease_keepalive_secs")]
    pub lease_keepalive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider endpoint (chat-completions style)
    pub provider_url: String,
    pub api_key: String,
    /// Model identifier sent with every call
    #[serde(default = "default_model")]
    pub model: String,
    /// Attempts per call for transient errors (1 initial + retries)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-call deadline in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Leaky-bucket issuance rate
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Checkpoint and manuscript location. A plain path selects the
    /// file-backed store.
    #[serde(default = "default_checkpoint_url")]
    pub checkpoint_url: String,
}

/// Generation limits and thresholds. Every named constant from the scene loop
/// lives here so deployments can tune without rebuilding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Editor retry cap per scene
    #[serde(default = "default_max_scene_regenerations")]
    pub max_scene_regenerations: u32,
    /// W: recent fingerprints kept for repetition comparison
    #[serde(default = "default_fingerprint_window_size")]
    pub fingerprint_window_size: usize,
    /// Token-Jaccard threshold above which new information counts as repeated
    #[serde(default = "default_repetition_similarity_threshold")]
    pub repetition_similarity_threshold: f64,
    /// Words after which the current chapter closes
    #[serde(default = "default_chapter_roll_threshold")]
    pub chapter_roll_threshold: u32,
    /// Consecutive DROP decisions before the job fails for lack of progress
    #[serde(default = "default_max_consecutive_drops")]
    pub max_consecutive_drops: u32,
    /// Scene word-target clamp
    #[serde(default = "default_scene_min_words")]
    pub scene_min_words: u32,
    #[serde(default = "default_scene_max_words")]
    pub scene_max_words: u32,
    /// Acceptable writer deviation from the brief's target (fraction)
    #[serde(default = "default_scene_word_tolerance")]
    pub scene_word_tolerance: f64,
    /// Acceptable act overshoot beyond its word target (fraction)
    #[serde(default = "default_act_overshoot_tolerance")]
    pub act_overshoot_tolerance: f64,
    /// Protagonist transformation floor checked at book close
    #[serde(default = "default_transformation_threshold")]
    pub transformation_threshold: f32,
    /// Unresolved questions permitted to trail past the final act
    #[serde(default = "default_trailing_questions_ceiling")]
    pub trailing_questions_ceiling: usize,
    /// Wall-clock ceilings per mode, in milliseconds
    #[serde(default = "default_draft_wall_clock_ms")]
    pub draft_wall_clock_ms: u64,
    #[serde(default = "default_polished_wall_clock_ms")]
    pub polished_wall_clock_ms: u64,
}

fn default_concurrency() -> usize {
    1
}

fn default_queue_url() -> String {
    "memory://local".to_string()
}

fn default_lease_keepalive_secs() -> u64 {
    30
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_max_attempts() -> u32 {
    4
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_requests_per_second() -> f64 {
    2.0
}

fn default_checkpoint_url() -> String {
    dirs::data_local_dir()
        .map(|dir| dir.join("tale-forge").display().to_string())
        .unwrap_or_else(|| "./.tale-forge".to_string())
}

fn default_max_scene_regenerations() -> u32 {
    3
}

fn default_fingerprint_window_size() -> usize {
    20
}

fn default_repetition_similarity_threshold() -> f64 {
    0.7
}

fn default_chapter_roll_threshold() -> u32 {
    3_500
}

fn default_max_consecutive_drops() -> u32 {
    5
}

fn default_scene_min_words() -> u32 {
    400
}

fn default_scene_max_words() -> u32 {
    1_200
}

fn default_scene_word_tolerance() -> f64 {
    0.3
}

fn default_act_overshoot_tolerance() -> f64 {
    0.15
}

fn default_transformation_threshold() -> f32 {
    0.7
}

fn default_trailing_questions_ceiling() -> usize {
    2
}

fn default_draft_wall_clock_ms() -> u64 {
    30 * 60 * 1_000 // 30 minutes
}

fn default_polished_wall_clock_ms() -> u64 {
    2 * 60 * 60 * 1_000 // 2 hours
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_url: default_queue_url(),
            lease_keepalive_secs: default_lease_keepalive_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_url: default_checkpoint_url(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_scene_regenerations: default_max_scene_regenerations(),
            fingerprint_window_size: default_fingerprint_window_size(),
            repetition_similarity_threshold: default_repetition_similarity_threshold(),
            chapter_roll_threshold: default_chapter_roll_threshold(),
            max_consecutive_drops: default_max_consecutive_drops(),
            scene_min_words: default_scene_min_words(),
            scene_max_words: default_scene_max_words(),
            scene_word_tolerance: default_scene_word_tolerance(),
            act_overshoot_tolerance: default_act_overshoot_tolerance(),
            transformation_threshold: default_transformation_threshold(),
            trailing_questions_ceiling: default_trailing_questions_ceiling(),
            draft_wall_clock_ms: default_draft_wall_clock_ms(),
            polished_wall_clock_ms: default_polished_wall_clock_ms(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            llm: LlmConfig {
                provider_url: String::new(),
                api_key: String::new(),
                model: default_model(),
                max_attempts: default_max_attempts(),
                request_timeout_secs: default_request_timeout_secs(),
                requests_per_second: default_requests_per_second(),
            },
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl LimitsConfig {
    /// Wall-clock ceiling for a job in the given mode.
    pub fn wall_clock_ceiling(&self, mode: Mode) -> Duration {
        match mode {
            Mode::Draft => Duration::from_millis(self.draft_wall_clock_ms),
            Mode::Polished => Duration::from_millis(self.polished_wall_clock_ms),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if file doesn't exist
    pub fn load_or_default(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            _ => Ok(Self::default()),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Environment variables override config file values but are themselves
    /// overridden by CLI arguments.
    ///
    /// Supported environment variables:
    /// - WORKER_CONCURRENCY: Max concurrent jobs per worker
    /// - LLM_PROVIDER_URL, LLM_API_KEY, LLM_MODEL: Provider credentials
    /// - CHECKPOINT_STORAGE_URL: Persistence endpoint
    /// - QUEUE_URL: Job queue endpoint
    /// - MAX_SCENE_REGENERATIONS: Editor retry cap
    /// - FINGERPRINT_WINDOW_SIZE: W, recent scenes compared for repetition
    /// - REPETITION_SIMILARITY_THRESHOLD: Jaccard threshold
    /// - CHAPTER_ROLL_THRESHOLD: Chapter close threshold in words
    /// - JOB_WALL_CLOCK_CEILING_MS: Ceiling applied to both modes
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("WORKER_CONCURRENCY")
            && let Ok(concurrency) = val.parse::<usize>()
        {
            self.worker.concurrency = concurrency.max(1);
        }

        if let Ok(val) = std::env::var("LLM_PROVIDER_URL")
            && !val.is_empty()
        {
            self.llm.provider_url = val;
        }

        if let Ok(val) = std::env::var("LLM_API_KEY")
            && !val.is_empty()
        {
            self.llm.api_key = val;
        }

        if let Ok(val) = std::env::var("LLM_MODEL")
            && !val.is_empty()
        {
            self.llm.model = val;
        }

        if let Ok(val) = std::env::var("CHECKPOINT_STORAGE_URL")
            && !val.is_empty()
        {
            self.storage.checkpoint_url = val;
        }

        if let Ok(val) = std::env::var("QUEUE_URL")
            && !val.is_empty()
        {
            self.worker.queue_url = val;
        }

        if let Ok(val) = std::env::var("MAX_SCENE_REGENERATIONS")
            && let Ok(max) = val.parse::<u32>()
        {
            self.limits.max_scene_regenerations = max;
        }

        if let Ok(val) = std::env::var("FINGERPRINT_WINDOW_SIZE")
            && let Ok(window) = val.parse::<usize>()
        {
            self.limits.fingerprint_window_size = window.max(1);
        }

        if let Ok(val) = std::env::var("REPETITION_SIMILARITY_THRESHOLD")
            && let Ok(threshold) = val.parse::<f64>()
        {
            self.limits.repetition_similarity_threshold = threshold.clamp(0.0, 1.0);
        }

        if let Ok(val) = std::env::var("CHAPTER_ROLL_THRESHOLD")
            && let Ok(words) = val.parse::<u32>()
        {
            self.limits.chapter_roll_threshold = words;
        }

        if let Ok(val) = std::env::var("JOB_WALL_CLOCK_CEILING_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            self.limits.draft_wall_clock_ms = ms;
            self.limits.polished_wall_clock_ms = ms;
        }

        self
    }

    /// Load configuration with environment variable overrides applied.
    ///
    /// Priority: Env vars > config file > defaults
    /// (CLI args override everything, applied separately in main.rs)
    pub fn load_with_env(path: Option<&PathBuf>) -> anyhow::Result<Self> {
        Self::load_or_default(path).map(|c| c.apply_env_overrides())
    }

    /// Startup validation for the worker binary. A failure here is a fatal
    /// configuration error (exit 1).
    pub fn validate_for_worker(&self) -> anyhow::Result<()> {
        if self.llm.provider_url.is_empty() {
            anyhow::bail!("LLM_PROVIDER_URL is not configured");
        }
        if self.llm.api_key.is_empty() {
            anyhow::bail!("LLM_API_KEY is not configured");
        }
        if self.storage.checkpoint_url.is_empty() {
            anyhow::bail!("CHECKPOINT_STORAGE_URL is not configured");
        }
        if self.worker.queue_url.is_empty() {
            anyhow::bail!("QUEUE_URL is not configured");
        }
        Ok(())
    }
}
