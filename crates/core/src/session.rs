//! The persisted chat session and its processing state machine.
//!
//! ```text
//! queued ──► processing ──► completed
//!   │            │
//!   └────────────┴────────► failed
//! ```
//!
//! Status only ever moves forward. `processing → processing` is allowed: it is
//! how a new delivery of the same task takes over the session, bumping the
//! attempt counter that acts as a fencing token. Commits (`complete` / `fail`)
//! carry the fence they were issued and are rejected as stale when another
//! attempt has taken over in the meantime.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::{SessionId, UserId};

/// Free-form metadata recorded by the completion step (latency, model, usage).
pub type SessionMeta = serde_json::Map<String, JsonValue>;

/// Author of a chat message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// One entry of a session's ordered conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Processing status of a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Queued => "queued",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Queued, Processing)
                | (Queued, Failed)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

impl core::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(SessionStatus::Queued),
            "processing" => Ok(SessionStatus::Processing),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(DomainError::validation(format!("unknown session status: {other}"))),
        }
    }
}

/// Result of a fenced commit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The write was applied.
    Applied,
    /// The fence no longer matches (another attempt took over, or the session
    /// is already terminal). Nothing was changed.
    Stale,
}

/// The unit of work and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub owner_id: UserId,
    pub messages: Vec<ChatMessage>,
    pub status: SessionStatus,
    #[serde(default)]
    pub meta: SessionMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fencing token: number of processing attempts started so far.
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a freshly queued session holding the initiating user message.
    pub fn new(
        session_id: SessionId,
        owner_id: UserId,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(DomainError::validation("message must not be empty"));
        }

        Ok(Self {
            session_id,
            owner_id,
            messages: vec![ChatMessage::user(message)],
            status: SessionStatus::Queued,
            meta: SessionMeta::new(),
            error: None,
            attempt: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
        })
    }

    fn transition(&mut self, to: SessionStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Start a new processing attempt and return its fence.
    ///
    /// Fails with `InvalidTransition` when the session is already terminal.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> DomainResult<u32> {
        self.transition(SessionStatus::Processing)?;
        self.attempt += 1;
        self.started_at = Some(now);
        Ok(self.attempt)
    }

    fn holds_fence(&self, fence: u32) -> bool {
        self.status == SessionStatus::Processing && self.attempt == fence
    }

    /// Append the assistant reply and mark the session completed.
    pub fn complete(
        &mut self,
        fence: u32,
        reply: impl Into<String>,
        meta: SessionMeta,
        now: DateTime<Utc>,
    ) -> CommitOutcome {
        if !self.holds_fence(fence) {
            return CommitOutcome::Stale;
        }
        self.messages.push(ChatMessage::assistant(reply));
        self.status = SessionStatus::Completed;
        self.completed_at = Some(now);
        self.meta = meta;
        CommitOutcome::Applied
    }

    /// Record a terminal failure for the attempt holding `fence`.
    pub fn fail(&mut self, fence: u32, error: impl Into<String>, now: DateTime<Utc>) -> CommitOutcome {
        if !self.holds_fence(fence) {
            return CommitOutcome::Stale;
        }
        self.status = SessionStatus::Failed;
        self.error = Some(error.into());
        self.failed_at = Some(now);
        CommitOutcome::Applied
    }
}
