use async_trait::async_trait;
use serde_json::json;

use parley_core::{MessageRole, SessionMeta};

use crate::completion::{CompletionError, CompletionReply, CompletionRequest, CompletionService};

/// Deterministic completion service for dev/tests: replies with the latest
/// user message.
#[derive(Debug, Clone, Default)]
pub struct EchoCompletionService;

impl EchoCompletionService {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CompletionService for EchoCompletionService {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionReply, CompletionError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .ok_or_else(|| CompletionError::permanent("conversation has no user message"))?;

        let mut meta = SessionMeta::new();
        meta.insert("model_used".to_string(), json!("echo"));
        meta.insert("session_id".to_string(), json!(request.session_id.to_string()));
        meta.insert("processing_time_ms".to_string(), json!(0.0));

        Ok(CompletionReply::new(format!("echo: {}", last_user.content)).with_meta(meta))
    }
}
