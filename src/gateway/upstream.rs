//! Upstream chat-completions API: wire types, client trait and the HTTP
//! implementation.
//!
//! The trait seam lets tests script the upstream without a network. Status
//! mapping: 429 and 5xx are retryable upstream failures, any other non-2xx
//! is not; connect errors and per-attempt timeouts are transport failures
//! (retryable).

use crate::gateway::types::{GatewayError, TokenUsage, UpstreamConfig};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: ChatChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoiceMessage {
    #[serde(default)]
    pub content: String,
}

impl ChatResponse {
    /// Free-text content of the first choice, empty when the upstream
    /// returned no choices.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|choice| choice.message.content.as_str())
            .unwrap_or("")
    }
}

/// Seam over the upstream LLM API.
pub trait UpstreamClient: Send + Sync + std::fmt::Debug {
    /// One `POST /chat/completions` attempt. The implementation bounds the
    /// attempt with its own timeout; retries live above this seam.
    fn chat_completion(
        &self,
        request: ChatRequest,
    ) -> BoxFuture<'_, Result<ChatResponse, GatewayError>>;

    fn name(&self) -> &'static str;
}

/// `reqwest`-backed client with bearer auth and a per-attempt deadline.
#[derive(Debug)]
pub struct HttpUpstream {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self, GatewayError> {
        Url::parse(&config.endpoint)
            .map_err(|err| GatewayError::Transport(format!("invalid endpoint url: {err}")))?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| GatewayError::Transport(err.to_string()))?;

        Ok(Self { client, config })
    }
}

impl UpstreamClient for HttpUpstream {
    fn chat_completion(
        &self,
        request: ChatRequest,
    ) -> BoxFuture<'_, Result<ChatResponse, GatewayError>> {
        Box::pin(async move {
            let url = format!(
                "{}/chat/completions",
                self.config.endpoint.trim_end_matches('/')
            );

            let mut builder = self.client.post(&url).json(&request);
            if let Some(key) = &self.config.api_key {
                builder = builder.bearer_auth(key);
            }

            let response = builder.send().await.map_err(map_transport_error)?;
            let status = response.status();

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(GatewayError::Upstream {
                    status: status.as_u16(),
                    message: preview(&body),
                    retryable: status.as_u16() == 429 || status.is_server_error(),
                });
            }

            response
                .json::<ChatResponse>()
                .await
                .map_err(|err| GatewayError::Upstream {
                    status: status.as_u16(),
                    message: format!("undecodable response body: {err}"),
                    retryable: false,
                })
        })
    }

    fn name(&self) -> &'static str {
        "chat-completions-http"
    }
}

fn map_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Transport(format!("request timed out: {err}"))
    } else {
        GatewayError::Transport(err.to_string())
    }
}

fn preview(body: &str) -> String {
    const MAX: usize = 300;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{cut}...")
    }
}
