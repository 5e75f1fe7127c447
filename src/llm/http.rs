//! HTTP implementation of [`LlmClient`] for JSON chat-completion providers.
//!
//! The only code in the crate that talks to the provider. Transient failures
//! are retried here with bounded exponential backoff; structured responses
//! get one in-place repair retry before a schema error surfaces. Call
//! issuance runs through a leaky bucket so a single worker cannot trip
//! provider-side throttling.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::LlmConfig;

use super::{
    first_json_object, validate_schema, BackoffPolicy, JsonRequest, JsonResponse, LeakyBucket,
    LlmClient, LlmError, TextRequest, TextResponse, TokenUsage,
};

/// Token cap and temperature for structured (JSON) calls.
const JSON_MAX_TOKENS: u32 = 8_192;
const JSON_TEMPERATURE: f32 = 0.2;

pub struct HttpLlmClient {
    http: reqwest::Client,
    provider_url: String,
    api_key: String,
    model: String,
    backoff: BackoffPolicy,
    bucket: LeakyBucket,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            provider_url: config.provider_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            backoff: BackoffPolicy {
                max_attempts: config.max_attempts,
                ..BackoffPolicy::default()
            },
            bucket: LeakyBucket::new(config.requests_per_second, config.requests_per_second.max(1.0)),
        })
    }

    /// Map an HTTP failure status onto the error taxonomy.
    fn classify_status(status: StatusCode, body: &str) -> LlmError {
        let detail: String = body.chars().take(200).collect();
        match status {
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                LlmError::Transient(format!("provider returned {status}: {detail}"))
            }
            s if s.is_server_error() => {
                LlmError::Transient(format!("provider returned {status}: {detail}"))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                LlmError::Fatal(format!("provider rejected credentials ({status})"))
            }
            _ => LlmError::Fatal(format!("provider returned {status}: {detail}")),
        }
    }

    fn chat_body(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        temperature: f32,
        json_mode: bool,
    ) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }

    /// One provider round trip. No retries at this layer.
    async fn send_chat(
        &self,
        body: &serde_json::Value,
        context_tag: &str,
    ) -> Result<(String, TokenUsage), LlmError> {
        self.bucket.acquire().await;
        debug!(context_tag, "issuing LLM call");

        let response = self
            .http
            .post(&self.provider_url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    LlmError::Transient(format!("request failed: {e}"))
                } else {
                    LlmError::Fatal(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Transient(format!("reading response body: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::Transient(format!("malformed provider response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Transient("provider returned no choices".to_string()))?;
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok((content, usage))
    }

    /// Retry transient failures with the configured backoff.
    async fn send_with_retry(
        &self,
        body: &serde_json::Value,
        context_tag: &str,
    ) -> Result<(String, TokenUsage), LlmError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_chat(body, context_tag).await {
                Ok(result) => return Ok(result),
                Err(LlmError::Transient(message)) if attempt < self.backoff.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        context_tag,
                        attempt, ?delay, "transient LLM error, backing off: {message}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate_text(&self, request: TextRequest) -> Result<TextResponse, LlmError> {
        let body = self.chat_body(
            &request.system_prompt,
            &request.user_prompt,
            request.max_tokens,
            request.temperature,
            false,
        );
        let (content, usage) = self.send_with_retry(&body, &request.context_tag).await?;
        Ok(TextResponse { content, usage })
    }

    async fn generate_json(&self, request: JsonRequest) -> Result<JsonResponse, LlmError> {
        let schema_text = serde_json::to_string_pretty(&request.schema)
            .map_err(|e| LlmError::Fatal(format!("unserializable schema: {e}")))?;
        let system = format!(
            "{}\n\nRespond with a single JSON object conforming to this schema:\n{}",
            request.system_prompt, schema_text
        );

        let mut usage = TokenUsage::default();
        let mut last_error = String::new();

        // First attempt, then one repair attempt with the violation quoted.
        for repair in 0..2 {
            let user_prompt = if repair == 0 {
                request.user_prompt.clone()
            } else {
                format!(
                    "{}\n\nYour previous response was invalid: {}.\nReturn ONLY a JSON object conforming to the schema.",
                    request.user_prompt, last_error
                )
            };
            let body = self.chat_body(&system, &user_prompt, JSON_MAX_TOKENS, JSON_TEMPERATURE, true);
            let (content, call_usage) = self.send_with_retry(&body, &request.context_tag).await?;
            usage.add(call_usage);

            let parsed: Result<serde_json::Value, _> = serde_json::from_str(&content)
                .or_else(|e| match first_json_object(&content) {
                    Some(object) => serde_json::from_str(object),
                    None => Err(e),
                });
            match parsed {
                Ok(value) => match validate_schema(&value, &request.schema) {
                    Ok(()) => return Ok(JsonResponse { value, usage }),
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = format!("response is not valid JSON: {e}"),
            }
            warn!(
                context_tag = %request.context_tag,
                repair, "schema-invalid LLM response: {last_error}"
            );
        }

        Err(LlmError::Schema(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            HttpLlmClient::classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            LlmError::Transient(_)
        ));
        assert!(matches!(
            HttpLlmClient::classify_status(StatusCode::BAD_GATEWAY, ""),
            LlmError::Transient(_)
        ));
        assert!(matches!(
            HttpLlmClient::classify_status(StatusCode::UNAUTHORIZED, ""),
            LlmError::Fatal(_)
        ));
        assert!(matches!(
            HttpLlmClient::classify_status(StatusCode::BAD_REQUEST, ""),
            LlmError::Fatal(_)
        ));
    }

    #[test]
    fn test_chat_body_json_mode_flag() {
        let client = HttpLlmClient::new(&LlmConfig {
            provider_url: "http://localhost:9999/v1/chat/completions".into(),
            api_key: "test".into(),
            model: "test-model".into(),
            max_attempts: 2,
            request_timeout_secs: 5,
            requests_per_second: 10.0,
        })
        .unwrap();

        let plain = client.chat_body("sys", "user", 100, 0.7, false);
        assert!(plain.get("response_format").is_none());
        assert_eq!(plain["model"], "test-model");
        assert_eq!(plain["messages"][0]["role"], "system");

        let structured = client.chat_body("sys", "user", 100, 0.2, true);
        assert_eq!(structured["response_format"]["type"], "json_object");
    }
}
