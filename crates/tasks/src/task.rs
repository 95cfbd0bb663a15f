use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_core::{SessionId, TaskId, UserId};

/// Task name used for routing and as the broker consumer group.
pub const PROCESS_SESSION_TASK: &str = "ai.process_session";

/// Payload of a session-processing task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSession {
    pub session_id: SessionId,
    pub owner_id: UserId,
}

/// Envelope for a task on the broker.
///
/// Notes:
/// - `task_id` is stable across retries of the same submission.
/// - `attempt` is 1-based and grows only when a failed attempt is re-published;
///   a redelivery after a lost lease keeps the same attempt.
/// - `not_before` delays visibility (retry backoff).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    task_id: TaskId,
    name: String,
    attempt: u32,
    payload: ProcessSession,
    enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    not_before: Option<DateTime<Utc>>,
}

impl TaskEnvelope {
    /// First attempt of a new task.
    pub fn new(payload: ProcessSession) -> Self {
        Self {
            task_id: TaskId::new(),
            name: PROCESS_SESSION_TASK.to_string(),
            attempt: 1,
            payload,
            enqueued_at: Utc::now(),
            not_before: None,
        }
    }

    /// The envelope for the following attempt, invisible until `not_before`.
    pub fn next_attempt(&self, not_before: DateTime<Utc>) -> Self {
        Self {
            task_id: self.task_id,
            name: self.name.clone(),
            attempt: self.attempt + 1,
            payload: self.payload,
            enqueued_at: Utc::now(),
            not_before: Some(not_before),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn payload(&self) -> &ProcessSession {
        &self.payload
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |at| now >= at)
    }
}
