//! OpenAI-compatible completion client.
//!
//! Works with any `/chat/completions` endpoint (Groq, OpenAI, OpenRouter, Ollama).

use std::time::Instant;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use parley_core::{ChatMessage, SessionMeta};

use crate::completion::{CompletionError, CompletionReply, CompletionRequest, CompletionService};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL without the trailing `/chat/completions`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Prepended as a `system` message to every conversation.
    pub system_prompt: Option<String>,
}

pub struct OpenAiCompatibleService {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiCompatibleService {
    pub fn new(client: Client, config: OpenAiConfig) -> Self {
        Self { client, config }
    }

    /// Build with a fresh connection pool.
    pub fn from_config(config: OpenAiConfig) -> Result<Self, CompletionError> {
        let client = Client::builder()
            .build()
            .map_err(|e| CompletionError::permanent(format!("http client: {e}")))?;
        Ok(Self::new(client, config))
    }

    fn wire_messages<'a>(&'a self, messages: &'a [ChatMessage]) -> Vec<WireMessage<'a>> {
        let system = self.config.system_prompt.as_deref().map(|content| WireMessage {
            role: "system",
            content,
        });

        system
            .into_iter()
            .chain(messages.iter().map(|m| WireMessage {
                role: m.role.as_str(),
                content: &m.content,
            }))
            .collect()
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireReplyMessage,
}

#[derive(Deserialize)]
struct WireReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Classify an HTTP error status.
///
/// Rejected credentials and malformed requests will fail the same way on
/// every attempt; rate limits, timeouts and server errors may not.
fn classify_status(status: StatusCode, body: String) -> CompletionError {
    let message = format!("completion api returned {}: {}", status.as_u16(), body);
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => CompletionError::Transient(message),
        s if s.is_client_error() => CompletionError::Permanent(message),
        _ => CompletionError::Transient(message),
    }
}

fn classify_transport(err: reqwest::Error) -> CompletionError {
    if err.is_builder() {
        CompletionError::Permanent(format!("invalid completion request: {err}"))
    } else {
        CompletionError::Transient(format!("completion request failed: {err}"))
    }
}

#[async_trait]
impl CompletionService for OpenAiCompatibleService {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionReply, CompletionError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = WireRequest {
            model: &self.config.model,
            messages: self.wire_messages(&request.messages),
        };

        let started = Instant::now();

        let mut req = self
            .client
            .post(&url)
            .timeout(request.time_budget)
            .json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = classify_status(status, text);
            warn!(session_id = %request.session_id, status = status.as_u16(), error = %err, "completion call rejected");
            return Err(err);
        }

        let parsed: WireResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Transient(format!("malformed completion response: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CompletionError::transient("completion response carried no choices"))?;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(session_id = %request.session_id, elapsed_ms, "completion call succeeded");

        let mut meta = SessionMeta::new();
        meta.insert("processing_time_ms".to_string(), json!(elapsed_ms));
        meta.insert(
            "model_used".to_string(),
            json!(parsed.model.unwrap_or_else(|| self.config.model.clone())),
        );
        meta.insert("session_id".to_string(), json!(request.session_id.to_string()));
        if let Some(usage) = parsed.usage {
            meta.insert("usage".to_string(), usage);
        }

        Ok(CompletionReply::new(text).with_meta(meta))
    }
}
