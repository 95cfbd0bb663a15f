//! Producer: accepts a chat message, records the session and enqueues its task.
//!
//! Returns as soon as the task is on the broker; it never waits for the
//! completion.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument};

use parley_core::{DomainError, Session, SessionId, SessionStatus, TaskId, UserId};
use parley_tasks::{ProcessSession, TaskBroker, TaskEnvelope};

use crate::session_store::SessionStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProducerError {
    #[error("validation error: {0}")]
    Validation(String),

    /// Nothing was created or enqueued.
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    /// The session record exists but no task references it; the reconciler
    /// picks it up once the orphan grace period has passed.
    #[error("broker unavailable (session {session_id} left queued): {message}")]
    BrokerUnavailable { session_id: SessionId, message: String },
}

/// Returned to the caller of [`Producer::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub status: SessionStatus,
}

pub struct Producer {
    store: Arc<dyn SessionStore>,
    broker: Arc<dyn TaskBroker>,
}

impl Producer {
    pub fn new(store: Arc<dyn SessionStore>, broker: Arc<dyn TaskBroker>) -> Self {
        Self { store, broker }
    }

    #[instrument(skip(self, message), fields(owner_id = %owner_id), err)]
    pub async fn submit(&self, owner_id: UserId, message: &str) -> Result<SubmitReceipt, ProducerError> {
        let session = Session::new(SessionId::new(), owner_id, message, Utc::now()).map_err(|e| match e {
            DomainError::Validation(msg) => ProducerError::Validation(msg),
            other => ProducerError::Validation(other.to_string()),
        })?;
        let session_id = session.session_id;

        self.store
            .create(&session)
            .await
            .map_err(|e| ProducerError::StoreUnavailable(e.to_string()))?;

        let task = TaskEnvelope::new(ProcessSession { session_id, owner_id });
        let task_id = task.task_id();

        if let Err(e) = self.broker.enqueue(task).await {
            error!(session_id = %session_id, error = %e, "enqueue failed; session left queued");
            return Err(ProducerError::BrokerUnavailable {
                session_id,
                message: e.to_string(),
            });
        }

        info!(session_id = %session_id, task_id = %task_id, "session queued");

        Ok(SubmitReceipt {
            session_id,
            task_id,
            status: SessionStatus::Queued,
        })
    }
}
