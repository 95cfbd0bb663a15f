use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use parley_core::{ChatMessage, SessionId, SessionMeta, UserId};

/// Input of one completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub session_id: SessionId,
    pub owner_id: UserId,
    /// Full ordered conversation, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Wall-clock budget granted to the call by the caller.
    pub time_budget: Duration,
}

/// Output of a successful completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReply {
    pub text: String,
    /// Free-form metadata (latency, model identifier, token usage).
    pub meta: SessionMeta,
}

impl CompletionReply {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            meta: SessionMeta::new(),
        }
    }

    pub fn with_meta(mut self, meta: SessionMeta) -> Self {
        self.meta = meta;
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// Worth retrying: network failure, timeout, rate limit, 5xx.
    #[error("transient completion failure: {0}")]
    Transient(String),

    /// Retrying cannot help: rejected credentials, malformed request.
    #[error("permanent completion failure: {0}")]
    Permanent(String),
}

impl CompletionError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CompletionError::Transient(_))
    }
}

/// Opaque external completion service.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionReply, CompletionError>;
}

#[async_trait]
impl<S> CompletionService for Arc<S>
where
    S: CompletionService + ?Sized,
{
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionReply, CompletionError> {
        (**self).complete(request).await
    }
}
