//! Status Reader: read-only, point-in-time view of a caller's sessions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use parley_core::{ChatMessage, Session, SessionId, SessionMeta, SessionStatus, UserId};

use crate::session_store::SessionStore;

/// Upper bound on the number of sessions returned by one listing.
pub const MAX_LISTED_SESSIONS: usize = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatusError {
    /// Absent, or owned by someone else.
    #[error("session not found")]
    NotFound,

    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatusView {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub messages: Vec<ChatMessage>,
    pub meta: SessionMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Session> for SessionStatusView {
    fn from(s: Session) -> Self {
        Self {
            session_id: s.session_id,
            status: s.status,
            messages: s.messages,
            meta: s.meta,
            error: s.error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

pub struct StatusReader {
    store: Arc<dyn SessionStore>,
}

impl StatusReader {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self), fields(session_id = %session_id, caller_id = %caller_id), err)]
    pub async fn get_status(
        &self,
        session_id: SessionId,
        caller_id: UserId,
    ) -> Result<SessionStatusView, StatusError> {
        self.store
            .get_owned(session_id, caller_id)
            .await
            .map_err(|e| StatusError::StoreUnavailable(e.to_string()))?
            .map(SessionStatusView::from)
            .ok_or(StatusError::NotFound)
    }

    /// The caller's sessions, newest first.
    pub async fn list_sessions(&self, caller_id: UserId) -> Result<Vec<SessionSummary>, StatusError> {
        let sessions = self
            .store
            .list_for_owner(caller_id, MAX_LISTED_SESSIONS)
            .await
            .map_err(|e| StatusError::StoreUnavailable(e.to_string()))?;

        Ok(sessions
            .into_iter()
            .map(|s| SessionSummary {
                session_id: s.session_id,
                status: s.status,
                created_at: s.created_at,
            })
            .collect())
    }
}
