//! Worker Engine: drives one delivery through the session state machine.
//!
//! ```text
//! receive ─► begin_attempt ─┬─ NotFound / Corrupt ───────────────► ack
//!                           ├─ Terminal ─────────────────────────► ack (no mutation)
//!                           └─ Started(fence)
//!                                 │ completion call (heartbeat + soft time limit)
//!                                 ├─ Ok(reply)      ─► complete(fence) ─► ack
//!                                 ├─ Permanent      ─► fail(fence)     ─► ack
//!                                 └─ Transient ─┬─ budget left ─► retry_later(backoff)
//!                                               └─ exhausted   ─► fail(fence) ─► ack
//! ```
//!
//! The task is acknowledged only after the terminal outcome is committed. When
//! the store or the broker cannot be reached the delivery is left unsettled:
//! its lease runs out and the broker hands it out again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use parley_ai::{CompletionError, CompletionReply, CompletionRequest, CompletionService};
use parley_core::{CommitOutcome, SessionId, SessionStatus};
use parley_tasks::{BrokerError, Delivery, TaskBroker};

use super::retry::{RetryPolicy, saturating_millis};
use crate::session_store::{BeginOutcome, SessionStore, SessionStoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// One attempt failed; subject to the retry budget.
    #[error("transient processing failure: {0}")]
    TransientProcessingFailure(String),

    /// Retry budget exhausted or the failure cannot be retried.
    #[error("permanent processing failure: {0}")]
    PermanentProcessingFailure(String),

    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
}

impl From<SessionStoreError> for ProcessingError {
    fn from(value: SessionStoreError) -> Self {
        match value {
            SessionStoreError::NotFound(id) => ProcessingError::NotFound(id),
            other => ProcessingError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<BrokerError> for ProcessingError {
    fn from(value: BrokerError) -> Self {
        ProcessingError::BrokerUnavailable(value.to_string())
    }
}

/// What happened to a delivery that was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// Terminal failure committed (`NotFound` or `PermanentProcessingFailure`).
    Failed(ProcessingError),
    /// The attempt failed and the next one is scheduled after `delay`.
    RetryScheduled {
        next_attempt: u32,
        delay: Duration,
        cause: ProcessingError,
    },
    /// The session was already terminal when the task arrived.
    AlreadyTerminal(SessionStatus),
    /// Another delivery took the session over; this attempt's commit was discarded.
    Stale,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Wall-clock ceiling of one completion call.
    pub soft_time_limit: Duration,
    /// Lease renewal cadence while a call is running.
    pub heartbeat_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            soft_time_limit: Duration::from_secs(30 * 60),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Runtime counters shared by every slot of a pool.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    stale: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub stale: u64,
    pub skipped: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &ProcessOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            ProcessOutcome::Completed => &self.completed,
            ProcessOutcome::Failed(_) => &self.failed,
            ProcessOutcome::RetryScheduled { .. } => &self.retried,
            ProcessOutcome::AlreadyTerminal(_) => &self.skipped,
            ProcessOutcome::Stale => &self.stale,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct WorkerEngine {
    store: Arc<dyn SessionStore>,
    broker: Arc<dyn TaskBroker>,
    completion: Arc<dyn CompletionService>,
    config: EngineConfig,
    stats: Arc<WorkerStats>,
}

impl WorkerEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        broker: Arc<dyn TaskBroker>,
        completion: Arc<dyn CompletionService>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            broker,
            completion,
            config,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn broker(&self) -> &Arc<dyn TaskBroker> {
        &self.broker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Process one delivery to a settled outcome.
    ///
    /// `Err` means the delivery was left unsettled because the store or the
    /// broker failed; it will be redelivered once its lease expires.
    pub async fn process(&self, delivery: &Delivery) -> Result<ProcessOutcome, ProcessingError> {
        let outcome = self.drive(delivery).await?;
        self.stats.record(&outcome);
        Ok(outcome)
    }

    async fn drive(&self, delivery: &Delivery) -> Result<ProcessOutcome, ProcessingError> {
        let task = delivery.task();
        let session_id = task.payload().session_id;
        let attempt = task.attempt();

        info!(
            worker = %delivery.consumer(),
            task_id = %task.task_id(),
            session_id = %session_id,
            attempt,
            redelivered = delivery.is_redelivery(),
            "task picked up"
        );

        let begun = match self.store.begin_attempt(session_id, Utc::now()).await {
            Ok(begun) => begun,
            // A row that cannot be decoded stays undecodable on every redelivery.
            Err(SessionStoreError::Corrupt(reason)) => {
                error!(
                    task_id = %task.task_id(),
                    session_id = %session_id,
                    attempt,
                    error = %reason,
                    "session record is corrupt; dropping task"
                );
                self.broker.ack(delivery).await?;
                return Ok(ProcessOutcome::Failed(ProcessingError::PermanentProcessingFailure(format!(
                    "corrupt session record: {reason}"
                ))));
            }
            Err(e) => return Err(e.into()),
        };

        let (fence, session) = match begun {
            BeginOutcome::Started { fence, session } => (fence, session),
            BeginOutcome::NotFound => {
                error!(task_id = %task.task_id(), session_id = %session_id, "session not found; dropping task");
                self.broker.ack(delivery).await?;
                return Ok(ProcessOutcome::Failed(ProcessingError::NotFound(session_id)));
            }
            BeginOutcome::Terminal(session) => {
                info!(
                    task_id = %task.task_id(),
                    session_id = %session_id,
                    status = %session.status,
                    "session already terminal; acknowledging without changes"
                );
                self.broker.ack(delivery).await?;
                return Ok(ProcessOutcome::AlreadyTerminal(session.status));
            }
        };

        let request = CompletionRequest {
            session_id,
            owner_id: session.owner_id,
            messages: session.messages,
            time_budget: self.config.soft_time_limit,
        };

        match self.call_completion(delivery, request).await {
            Ok(reply) => self.commit_success(delivery, fence, reply).await,
            Err(CompletionError::Permanent(msg)) => {
                warn!(session_id = %session_id, attempt, error = %msg, "permanent completion failure");
                self.commit_failure(delivery, fence, ProcessingError::PermanentProcessingFailure(msg))
                    .await
            }
            Err(CompletionError::Transient(msg)) => {
                if self.config.retry.should_retry(attempt) {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        session_id = %session_id,
                        attempt,
                        max_attempts = self.config.retry.max_attempts,
                        retry_in_ms = saturating_millis(delay),
                        error = %msg,
                        "attempt failed; scheduling retry"
                    );
                    self.broker.retry_later(delivery, delay).await?;
                    Ok(ProcessOutcome::RetryScheduled {
                        next_attempt: attempt + 1,
                        delay,
                        cause: ProcessingError::TransientProcessingFailure(msg),
                    })
                } else {
                    warn!(session_id = %session_id, attempt, error = %msg, "retry budget exhausted");
                    let cause = ProcessingError::PermanentProcessingFailure(format!(
                        "{msg} (gave up after {attempt} attempts)"
                    ));
                    self.commit_failure(delivery, fence, cause).await
                }
            }
        }
    }

    /// Run the completion call on its own task, bounded by the soft time limit,
    /// renewing the delivery lease while it runs.
    ///
    /// A panic inside the service or an elapsed limit is reported as a
    /// transient failure of this attempt.
    async fn call_completion(
        &self,
        delivery: &Delivery,
        request: CompletionRequest,
    ) -> Result<CompletionReply, CompletionError> {
        let limit = self.config.soft_time_limit;
        let completion = Arc::clone(&self.completion);
        let mut call = tokio::spawn(async move { completion.complete(request).await });

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = &mut call => {
                    return match joined {
                        Ok(result) => result,
                        Err(join_err) => Err(CompletionError::transient(format!(
                            "completion call aborted: {join_err}"
                        ))),
                    };
                }
                _ = &mut deadline => {
                    call.abort();
                    return Err(CompletionError::transient(format!(
                        "soft time limit of {}s exceeded",
                        limit.as_secs_f64()
                    )));
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.broker.heartbeat(delivery).await {
                        warn!(worker = %delivery.consumer(), delivery = %delivery.tag(), error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }

    async fn commit_success(
        &self,
        delivery: &Delivery,
        fence: u32,
        reply: CompletionReply,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let session_id = delivery.task().payload().session_id;
        let outcome = self
            .store
            .complete(session_id, fence, &reply.text, reply.meta, Utc::now())
            .await?;

        self.broker.ack(delivery).await?;

        match outcome {
            CommitOutcome::Applied => {
                info!(session_id = %session_id, fence, "session completed");
                Ok(ProcessOutcome::Completed)
            }
            CommitOutcome::Stale => {
                warn!(session_id = %session_id, fence, "stale fence; reply discarded");
                Ok(ProcessOutcome::Stale)
            }
        }
    }

    async fn commit_failure(
        &self,
        delivery: &Delivery,
        fence: u32,
        cause: ProcessingError,
    ) -> Result<ProcessOutcome, ProcessingError> {
        let session_id = delivery.task().payload().session_id;
        let message = match &cause {
            ProcessingError::PermanentProcessingFailure(msg) => msg.clone(),
            other => other.to_string(),
        };

        let outcome = self.store.fail(session_id, fence, &message, Utc::now()).await?;
        self.broker.ack(delivery).await?;

        match outcome {
            CommitOutcome::Applied => {
                info!(session_id = %session_id, fence, error = %message, "session failed");
                Ok(ProcessOutcome::Failed(cause))
            }
            CommitOutcome::Stale => {
                warn!(session_id = %session_id, fence, "stale fence; failure discarded");
                Ok(ProcessOutcome::Stale)
            }
        }
    }
}
