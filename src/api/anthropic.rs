//! Anthropic Messages API client

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::debug;

use super::{AiClient, Completion, CompletionRequest};
use crate::api::error::ApiError;
use crate::workflow::state::TokenUsage;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const PROVIDER_NAME: &str = "anthropic";
const API_KEY_VAR: &str = "STEVEDORE_ANTHROPIC_API_KEY";

pub struct AnthropicClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessageResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicClient {
    /// Create a new client with the given API key and model
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("stevedore/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ApiError::network(PROVIDER_NAME, e.to_string()))?;

        Ok(Self {
            api_key: api_key.into(),
            model: model.into(),
            client,
            base_url: ANTHROPIC_API_BASE.to_string(),
        })
    }

    /// Create client from STEVEDORE_ANTHROPIC_API_KEY environment variable
    pub fn from_env(model: &str) -> Result<Option<Self>, ApiError> {
        match env::var(API_KEY_VAR) {
            Ok(key) if !key.is_empty() => Ok(Some(Self::new(key, model)?)),
            _ => Ok(None),
        }
    }

    /// Point the client at a different base URL (proxies, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }
}

#[async_trait]
impl AiClient for AnthropicClient {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ApiError> {
        if self.api_key.is_empty() {
            return Err(ApiError::not_configured(PROVIDER_NAME));
        }

        let url = format!("{}/v1/messages", self.base_url);
        let body = MessageRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system.as_deref(),
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        debug!(model = %self.model, max_tokens = request.max_tokens, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::network(PROVIDER_NAME, e.to_string()))?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => {}
            401 | 403 => return Err(ApiError::unauthorized(PROVIDER_NAME, status.as_u16())),
            429 => {
                return Err(ApiError::rate_limited(
                    PROVIDER_NAME,
                    Self::parse_retry_after(response.headers()),
                ))
            }
            code => {
                let text = response.text().await.unwrap_or_default();
                return Err(ApiError::http(PROVIDER_NAME, code, text));
            }
        }

        let parsed: MessageResponse = response
            .json()
            .await
            .map_err(|e| ApiError::invalid_response(PROVIDER_NAME, e.to_string()))?;

        let content: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        if content.trim().is_empty() {
            return Err(ApiError::invalid_response(PROVIDER_NAME, "empty completion"));
        }

        Ok(Completion {
            content,
            usage: TokenUsage::new(parsed.usage.input_tokens, parsed.usage.output_tokens),
        })
    }
}
