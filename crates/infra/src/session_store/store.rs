use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use parley_core::{CommitOutcome, DomainError, Session, SessionId, SessionMeta, SessionStatus, UserId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionStoreError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: SessionStatus, to: SessionStatus },

    /// The persistence layer cannot be reached.
    #[error("session store unavailable: {0}")]
    Unavailable(String),

    /// A persisted record failed validation at the store boundary.
    #[error("corrupt session record: {0}")]
    Corrupt(String),
}

impl From<DomainError> for SessionStoreError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidTransition { from, to } => SessionStoreError::InvalidTransition { from, to },
            other => SessionStoreError::Corrupt(other.to_string()),
        }
    }
}

/// Result of trying to start a processing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// The session is now `processing` under `fence`.
    Started { fence: u32, session: Session },
    /// The session is already `completed` or `failed`; nothing was changed.
    Terminal(Session),
    NotFound,
}

/// Persistence for chat sessions.
///
/// Every operation addresses a session by `session_id`, never by a storage key.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> Result<(), SessionStoreError>;

    async fn get(&self, session_id: SessionId) -> Result<Option<Session>, SessionStoreError>;

    /// Load a session only if `owner_id` owns it.
    ///
    /// Ownership is part of the lookup predicate: a foreign session and a
    /// missing one are indistinguishable to the caller.
    async fn get_owned(&self, session_id: SessionId, owner_id: UserId)
    -> Result<Option<Session>, SessionStoreError>;

    /// The owner's sessions, newest first.
    async fn list_for_owner(&self, owner_id: UserId, limit: usize) -> Result<Vec<Session>, SessionStoreError>;

    /// Atomically move a `queued`/`processing` session to `processing`,
    /// bump its fence and stamp `started_at`.
    async fn begin_attempt(&self, session_id: SessionId, now: DateTime<Utc>)
    -> Result<BeginOutcome, SessionStoreError>;

    /// Append the assistant reply, record `meta` and mark the session
    /// completed, in one update guarded by `fence`.
    async fn complete(
        &self,
        session_id: SessionId,
        fence: u32,
        reply: &str,
        meta: SessionMeta,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, SessionStoreError>;

    /// Record a terminal failure, guarded by `fence`.
    async fn fail(
        &self,
        session_id: SessionId,
        fence: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, SessionStoreError>;

    /// Sessions still `queued` with no attempt started, created before `older_than`.
    async fn list_orphaned(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Session>, SessionStoreError>;
}

#[async_trait]
impl<S> SessionStore for Arc<S>
where
    S: SessionStore + ?Sized,
{
    async fn create(&self, session: &Session) -> Result<(), SessionStoreError> {
        (**self).create(session).await
    }

    async fn get(&self, session_id: SessionId) -> Result<Option<Session>, SessionStoreError> {
        (**self).get(session_id).await
    }

    async fn get_owned(
        &self,
        session_id: SessionId,
        owner_id: UserId,
    ) -> Result<Option<Session>, SessionStoreError> {
        (**self).get_owned(session_id, owner_id).await
    }

    async fn list_for_owner(&self, owner_id: UserId, limit: usize) -> Result<Vec<Session>, SessionStoreError> {
        (**self).list_for_owner(owner_id, limit).await
    }

    async fn begin_attempt(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, SessionStoreError> {
        (**self).begin_attempt(session_id, now).await
    }

    async fn complete(
        &self,
        session_id: SessionId,
        fence: u32,
        reply: &str,
        meta: SessionMeta,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, SessionStoreError> {
        (**self).complete(session_id, fence, reply, meta, now).await
    }

    async fn fail(
        &self,
        session_id: SessionId,
        fence: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<CommitOutcome, SessionStoreError> {
        (**self).fail(session_id, fence, error, now).await
    }

    async fn list_orphaned(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Session>, SessionStoreError> {
        (**self).list_orphaned(older_than, limit).await
    }
}
