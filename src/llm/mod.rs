//! Provider-agnostic LLM client contract.
//!
//! The [`LlmClient`] trait is the only boundary that talks to a language
//! model. It offers two calls: free text and schema-validated JSON. Schema
//! validation happens here and nowhere else; every agent result downstream is
//! a closed record type. Errors are typed into transient / schema / fatal so
//! callers never need to inspect provider details.

pub mod http;
pub mod rate;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpLlmClient;
pub use rate::LeakyBucket;

// ============================================================================
// Errors
// ============================================================================

/// Typed failure of an LLM call.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Timeouts, rate limits, 5xx. Retried internally with backoff before it
    /// ever reaches a caller.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Malformed or schema-violating output after the in-place repair retry.
    #[error("schema violation: {0}")]
    Schema(String),
    /// Unrecoverable: bad credentials, bad request, provider refusal.
    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl LlmError {
    /// Stable classification tag for job records.
    pub fn tag(&self) -> &'static str {
        match self {
            LlmError::Transient(_) => "transient",
            LlmError::Schema(_) => "schema",
            LlmError::Fatal(_) => "fatal",
        }
    }
}

// ============================================================================
// Requests and responses
// ============================================================================

/// Input and output token counts for one or more calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Free-text generation request.
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Short caller tag carried into logs (e.g. "writer/a2.c5.s12")
    pub context_tag: String,
}

/// Structured generation request. The response must conform to `schema`.
#[derive(Debug, Clone)]
pub struct JsonRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub schema: serde_json::Value,
    pub context_tag: String,
}

#[derive(Debug, Clone)]
pub struct TextResponse {
    pub content: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub value: serde_json::Value,
    pub usage: TokenUsage,
}

impl JsonResponse {
    /// Deserialize the validated payload into a closed record type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, LlmError> {
        serde_json::from_value(self.value.clone())
            .map_err(|e| LlmError::Schema(format!("payload does not fit record type: {e}")))
    }
}

// ============================================================================
// Client trait
// ============================================================================

/// One call contract for text and JSON generation.
///
/// Implementations must be thread-safe; agents hold the client behind an
/// `Arc` and may issue overlapping calls.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate_text(&self, request: TextRequest) -> Result<TextResponse, LlmError>;

    /// Structured generation. On return the value conforms to the request
    /// schema; a response that cannot be repaired surfaces as
    /// [`LlmError::Schema`].
    async fn generate_json(&self, request: JsonRequest) -> Result<JsonResponse, LlmError>;
}

/// Wrapper that accumulates token usage across calls, for per-job accounting.
pub struct MeteredLlm {
    inner: std::sync::Arc<dyn LlmClient>,
    usage: std::sync::Mutex<TokenUsage>,
}

impl MeteredLlm {
    pub fn new(inner: std::sync::Arc<dyn LlmClient>) -> Self {
        Self {
            inner,
            usage: std::sync::Mutex::new(TokenUsage::default()),
        }
    }

    /// Cumulative usage since construction.
    pub fn usage(&self) -> TokenUsage {
        *self.usage.lock().expect("usage lock")
    }
}

#[async_trait]
impl LlmClient for MeteredLlm {
    async fn generate_text(&self, request: TextRequest) -> Result<TextResponse, LlmError> {
        let response = self.inner.generate_text(request).await?;
        self.usage.lock().expect("usage lock").add(response.usage);
        Ok(response)
    }

    async fn generate_json(&self, request: JsonRequest) -> Result<JsonResponse, LlmError> {
        let response = self.inner.generate_json(request).await?;
        self.usage.lock().expect("usage lock").add(response.usage);
        Ok(response)
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Bounded exponential backoff for transient provider errors.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt` (1-indexed; attempt 1 is the first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

// ============================================================================
// Schema validation
// ============================================================================

/// Validate a JSON value against a schema, reporting the first violation.
pub fn validate_schema(
    value: &serde_json::Value,
    schema: &serde_json::Value,
) -> Result<(), LlmError> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| LlmError::Fatal(format!("invalid agent schema: {e}")))?;
    if let Some(error) = validator.iter_errors(value).next() {
        return Err(LlmError::Schema(format!(
            "{} at {}",
            error, error.instance_path
        )));
    }
    Ok(())
}

/// Salvage the first complete JSON object embedded in model output.
///
/// Providers in JSON mode still occasionally wrap the payload in prose or a
/// markdown fence, so this scans for the first `{` and walks forward counting
/// brace depth, skipping string literals and escapes, until the object
/// closes. Returns None when no object ever balances.
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}
