//! Messages API client used for both root and sub-model calls
//!
//! This module implements the AsyncModelClient trait for the Anthropic Messages API.
//! It performs exactly one HTTP attempt per call; retries belong to `ResilientClient`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use crate::llm::client::{AsyncModelClient, ModelError};
use crate::llm::types::{Completion, ModelRequest, Role, TokenUsage};

/// Anthropic API base URL
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Anthropic API version
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default model to use
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

/// Default max tokens
const DEFAULT_MAX_TOKENS: u32 = 16384;

/// Connection settings for one model endpoint
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub api_url: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: Duration::from_secs(300),
            api_url: ANTHROPIC_API_URL.to_string(),
        }
    }
}

impl AnthropicConfig {
    /// Create a new config with a specific model
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// Anthropic API client
pub struct AnthropicClient {
    client: Client,
    api_key: String,
    config: AnthropicConfig,
}

impl AnthropicClient {
    /// Client for the configured root model
    ///
    /// The credential comes from `ANTHROPIC_API_KEY`; a missing key is fatal, not retryable.
    pub fn new(config: AnthropicConfig) -> Result<Self, ModelError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ModelError::Fatal("ANTHROPIC_API_KEY not set".to_string()))?;

        Self::with_api_key(api_key, config)
    }

    /// Create a client with an explicit API key
    pub fn with_api_key(api_key: String, config: AnthropicConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ModelError::Fatal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Request body; per-request model and token overrides win over the config
    fn build_request(&self, request: &ModelRequest) -> Value {
        let model = request.model.as_deref().unwrap_or(&self.config.model);
        let max_tokens = request.max_tokens.unwrap_or(self.config.max_tokens);

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": m.content
                })
            })
            .collect();

        let mut body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": messages
        });

        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }

        body
    }

    /// Parse the API response into a Completion
    fn parse_response(&self, body: Value) -> Result<Completion, ModelError> {
        let usage = body
            .get("usage")
            .map(|u| {
                TokenUsage::new(
                    u["input_tokens"].as_u64().unwrap_or(0),
                    u["output_tokens"].as_u64().unwrap_or(0),
                )
            })
            .unwrap_or_default();

        let blocks = body["content"]
            .as_array()
            .ok_or_else(|| ModelError::Fatal("Response has no content array".to_string()))?;

        let mut text = String::new();
        for block in blocks {
            if block["type"].as_str() == Some("text") {
                if let Some(part) = block["text"].as_str() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(part);
                }
            }
        }

        Ok(Completion { text, usage })
    }

    /// One HTTP attempt, with the status mapped onto `ModelError`
    async fn send_request(&self, body: Value) -> Result<Value, ModelError> {
        let response = self
            .client
            .post(&self.config.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Transient(format!("Request failed: {}", e)))?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ModelError::RateLimited {
                message: "HTTP 429 from Anthropic API".to_string(),
                retry_after,
            });
        }

        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_status(status.as_u16(), error_body));
        }

        response
            .json()
            .await
            .map_err(|e| ModelError::Fatal(format!("Failed to parse response: {}", e)))
    }
}

/// Map a non-success HTTP status to a retry classification
fn classify_status(status: u16, body: String) -> ModelError {
    let message = format!("API error {}: {}", status, body);
    match status {
        429 => ModelError::rate_limited(message),
        // 529 is Anthropic's "overloaded"
        500..=599 => ModelError::Transient(message),
        _ => ModelError::Fatal(message),
    }
}

#[async_trait]
impl AsyncModelClient for AnthropicClient {
    async fn call(&self, request: &ModelRequest) -> Result<Completion, ModelError> {
        let body = self.build_request(request);
        let response = self.send_request(body).await?;
        self.parse_response(response)
    }
}

impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("model", &self.config.model)
            .field("max_tokens", &self.config.max_tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AnthropicClient {
        AnthropicClient::with_api_key("test-key".to_string(), AnthropicConfig::default()).unwrap()
    }

    #[test]
    fn test_config_default() {
        let config = AnthropicConfig::default();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(config.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_config_with_model() {
        let config = AnthropicConfig::with_model("claude-haiku-4-5-20251001");
        assert_eq!(config.model, "claude-haiku-4-5-20251001");
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_build_request_basic() {
        let request = ModelRequest::new("You are helpful").with_user_message("Hello");
        let body = client().build_request(&request);

        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["system"], "You are helpful");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Hello");
    }

    #[test]
    fn test_build_request_overrides() {
        let request = ModelRequest::new("")
            .with_user_message("Hi")
            .with_model("claude-haiku-4-5-20251001")
            .with_max_tokens(512);
        let body = client().build_request(&request);

        assert_eq!(body["model"], "claude-haiku-4-5-20251001");
        assert_eq!(body["max_tokens"], 512);
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_parse_response_joins_text_blocks() {
        let body = json!({
            "content": [
                {"type": "text", "text": "first"},
                {"type": "tool_use", "id": "x", "name": "y", "input": {}},
                {"type": "text", "text": "second"}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 34}
        });
        let completion = client().parse_response(body).unwrap();
        assert_eq!(completion.text, "first\nsecond");
        assert_eq!(completion.usage, TokenUsage::new(12, 34));
    }

    #[test]
    fn test_parse_response_without_content_is_fatal() {
        let result = client().parse_response(json!({"usage": {}}));
        assert!(matches!(result, Err(ModelError::Fatal(_))));
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(429, String::new()).is_rate_limit());
        assert!(matches!(classify_status(503, String::new()), ModelError::Transient(_)));
        assert!(matches!(classify_status(529, String::new()), ModelError::Transient(_)));
        assert!(matches!(classify_status(401, String::new()), ModelError::Fatal(_)));
        assert!(matches!(classify_status(400, String::new()), ModelError::Fatal(_)));
    }
}
