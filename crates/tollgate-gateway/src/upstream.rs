//! Upstream LLM clients.
//!
//! Admitted requests are answered either by a real OpenAI-compatible
//! upstream over HTTP or by a deterministic mock used for testing and load
//! experiments. Both sit behind the same trait so the handler does not care.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tollgate_common::config::UpstreamConfig;
use tollgate_common::{TollgateError, TollgateResult};

use crate::estimator;
use crate::protocol::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, Usage};

/// Upstream call failures, already classified for the error taxonomy.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("upstream returned status {status}")]
    Status { status: u16 },

    #[error("upstream transport error: {0}")]
    Transport(String),
}

/// The upstream seam of the admission handler.
#[async_trait]
pub trait ChatUpstream: Send + Sync {
    /// Complete a chat request, returning an OpenAI-shaped response with
    /// usage accounting.
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, UpstreamError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock upstream
// ─────────────────────────────────────────────────────────────────────────────

const MOCK_REPLY: &str = "This is a mock completion generated for load testing.";

/// Deterministic OpenAI-shaped responder.
///
/// Usage accounting is self-consistent: prompt tokens are measured with the
/// same estimator the admission path uses, and completion tokens never
/// exceed the request's `max_tokens`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockUpstream;

impl MockUpstream {
    /// Create a mock upstream.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChatUpstream for MockUpstream {
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, UpstreamError> {
        let prompt_tokens = estimator::estimate_prompt(request);
        let reply_tokens = estimator::count_text(MOCK_REPLY);
        let completion_tokens = match request.max_tokens {
            Some(cap) => reply_tokens.min(cap as u64),
            None => reply_tokens,
        };

        Ok(ChatCompletionResponse {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::new("assistant", MOCK_REPLY),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::new(prompt_tokens, completion_tokens),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP upstream
// ─────────────────────────────────────────────────────────────────────────────

/// Real OpenAI-compatible upstream over HTTP.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl HttpUpstream {
    /// Build a client from configuration. The timeout here is the bounded
    /// upstream deadline the admission handler relies on.
    pub fn new(config: &UpstreamConfig) -> TollgateResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TollgateError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl ChatUpstream for HttpUpstream {
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, UpstreamError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout {
                    seconds: self.timeout_secs,
                }
            } else {
                UpstreamError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
            });
        }

        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(max_tokens: Option<u32>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage::new("user", "Hello")],
            max_tokens,
            temperature: None,
            stream: false,
        }
    }

    #[tokio::test]
    async fn test_mock_usage_is_self_consistent() {
        let mock = MockUpstream::new();
        let req = request(None);
        let response = mock.complete(&req).await.unwrap();

        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.model, "gpt-4o-mini");
        assert_eq!(
            response.usage.prompt_tokens,
            estimator::estimate_prompt(&req)
        );
        assert_eq!(
            response.usage.total_tokens,
            response.usage.prompt_tokens + response.usage.completion_tokens
        );
    }

    #[tokio::test]
    async fn test_mock_caps_completion_at_max_tokens() {
        let mock = MockUpstream::new();
        let response = mock.complete(&request(Some(3))).await.unwrap();
        assert_eq!(response.usage.completion_tokens, 3);

        let response = mock.complete(&request(Some(10_000))).await.unwrap();
        assert_eq!(
            response.usage.completion_tokens,
            estimator::count_text(MOCK_REPLY)
        );
    }

    #[test]
    fn test_http_upstream_strips_trailing_slash() {
        let config = UpstreamConfig {
            base_url: "https://api.example.com/".to_string(),
            ..Default::default()
        };
        let upstream = HttpUpstream::new(&config).unwrap();
        assert_eq!(upstream.base_url, "https://api.example.com");
    }
}
