//! AI client used to enhance analysis, draft content and analyze failures.
//!
//! Every caller treats the client as optional: an error here must never abort
//! the pipeline, callers fall back to heuristic behavior instead.

pub mod anthropic;
pub mod error;

pub use anthropic::AnthropicClient;
pub use error::ApiError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::workflow::state::TokenUsage;

/// A single prompt round-trip
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: 2048,
            temperature: 0.3,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_limits(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
}

/// Root-cause hypothesis for a failure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub root_cause: String,
    #[serde(default)]
    pub fix: String,
    #[serde(default)]
    pub fix_steps: Vec<String>,
    #[serde(default)]
    pub can_auto_fix: bool,
}

/// Trait for AI completion providers
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Provider name (e.g. "anthropic")
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ApiError>;
}

const ERROR_ANALYSIS_SYSTEM: &str = "You are a container and Kubernetes troubleshooting expert. \
Respond only with a JSON object with the fields root_cause (string), fix (string), \
fix_steps (array of strings) and can_auto_fix (boolean).";

/// Ask the client for a root-cause analysis of a failure
pub async fn analyze_error(
    client: &dyn AiClient,
    error: &str,
    context: &str,
) -> Result<(ErrorAnalysis, TokenUsage), ApiError> {
    let prompt = format!(
        "Analyze this failure and suggest a fix.\n\nError:\n{error}\n\nContext:\n{context}\n"
    );
    let request = CompletionRequest::new(prompt)
        .with_system(ERROR_ANALYSIS_SYSTEM)
        .with_limits(1024, 0.2);

    let completion = client.complete(&request).await?;
    Ok((parse_error_analysis(&completion.content), completion.usage))
}

/// Parse the JSON object in a response; free text becomes a non-fixable root cause
pub fn parse_error_analysis(content: &str) -> ErrorAnalysis {
    let json = match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if end > start => &content[start..=end],
        _ => "",
    };

    serde_json::from_str(json).unwrap_or_else(|_| ErrorAnalysis {
        root_cause: content.trim().to_string(),
        ..Default::default()
    })
}

/// Remove surrounding markdown code fences from generated file content
pub fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let mut lines: Vec<&str> = trimmed.lines().collect();
    lines.remove(0);
    if lines.last().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

/// Mock implementation for testing
#[derive(Default)]
pub struct MockAiClient {
    responses: Mutex<VecDeque<Result<String, ApiError>>>,
    /// Prompts received, in order
    pub prompts: Mutex<Vec<String>>,
}

impl MockAiClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response; once drained the client fails with `NotConfigured`
    pub fn respond(&self, response: Result<String, ApiError>) -> &Self {
        self.responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(response);
        self
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl AiClient for MockAiClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ApiError> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.prompt.clone());

        let next = self
            .responses
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();

        match next {
            Some(Ok(content)) => Ok(Completion {
                usage: TokenUsage::new(10, content.len() as u64 / 4),
                content,
            }),
            Some(Err(e)) => Err(e),
            None => Err(ApiError::not_configured("mock")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_analysis_from_fenced_json() {
        let content = "Here you go:\n```json\n{\"root_cause\": \"image not found\", \
            \"fix_steps\": [\"load image into kind\"], \"can_auto_fix\": true}\n```";
        let analysis = parse_error_analysis(content);
        assert_eq!(analysis.root_cause, "image not found");
        assert!(analysis.can_auto_fix);
        assert_eq!(analysis.fix_steps.len(), 1);
    }

    #[test]
    fn test_parse_error_analysis_free_text() {
        let analysis = parse_error_analysis("The pod is crash looping.");
        assert_eq!(analysis.root_cause, "The pod is crash looping.");
        assert!(!analysis.can_auto_fix);
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(
            strip_code_fences("```dockerfile\nFROM rust:1\nRUN cargo build\n```"),
            "FROM rust:1\nRUN cargo build"
        );
        assert_eq!(strip_code_fences("FROM alpine\n"), "FROM alpine");
    }

    #[tokio::test]
    async fn test_analyze_error_uses_client() {
        let client = MockAiClient::new();
        client.respond(Ok(
            r#"{"root_cause": "port mismatch", "can_auto_fix": false}"#.to_string(),
        ));

        let (analysis, usage) = analyze_error(&client, "probe failed", "port 3000")
            .await
            .unwrap();
        assert_eq!(analysis.root_cause, "port mismatch");
        assert!(usage.total > 0);
        assert_eq!(client.prompt_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_client_fails_when_drained() {
        let client = MockAiClient::new();
        let err = client
            .complete(&CompletionRequest::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotConfigured { .. }));
    }
}
