//! Task broker abstraction (mechanics only).
//!
//! The broker is the durable queue between the producer and the worker pool.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a delivery that is never acknowledged is redelivered.
//! - **Late acknowledgement**: workers call [`TaskBroker::ack`] only after the
//!   terminal outcome has been committed to the session store. A worker crash
//!   before that point causes redelivery, never silent loss.
//! - **Prefetch of one**: [`TaskBroker::receive`] hands out at most one task per
//!   call, and a worker slot does not call it again before it acked or retried
//!   its current delivery.
//! - **Leases**: an in-flight delivery holds a lease that the worker renews with
//!   [`TaskBroker::heartbeat`]. An expired lease means the worker is presumed
//!   dead and the task becomes visible to other consumers again.
//! - **No ordering** across tasks.
//!
//! Consumers must therefore be idempotent; the worker engine achieves this
//! with fenced session commits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::task::TaskEnvelope;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker cannot be reached (connection refused, lock poisoned, ...).
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The delivery is not in flight for this consumer any more (already
    /// acknowledged, or its lease expired and it was handed to someone else).
    #[error("unknown or expired delivery: {0}")]
    UnknownDelivery(String),

    #[error("task serialization error: {0}")]
    Serialization(String),
}

/// A task handed to one consumer, together with the receipt needed to settle it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    tag: String,
    consumer: String,
    task: TaskEnvelope,
    redelivered: bool,
}

impl Delivery {
    pub fn new(
        tag: impl Into<String>,
        consumer: impl Into<String>,
        task: TaskEnvelope,
        redelivered: bool,
    ) -> Self {
        Self {
            tag: tag.into(),
            consumer: consumer.into(),
            task,
            redelivered,
        }
    }

    /// Broker-specific receipt (stream entry id, sequence number, ...).
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn task(&self) -> &TaskEnvelope {
        &self.task
    }

    /// True when this task was previously handed to a consumer that never
    /// settled it.
    pub fn is_redelivery(&self) -> bool {
        self.redelivered
    }
}

#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Publish a task. Returns once the broker has durably accepted it.
    async fn enqueue(&self, task: TaskEnvelope) -> Result<(), BrokerError>;

    /// Wait up to `wait` for the next ready task and lease it to `consumer`.
    async fn receive(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Settle a delivery for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Re-publish the task as its next attempt, visible after `delay`, then
    /// settle the current delivery.
    async fn retry_later(&self, delivery: &Delivery, delay: Duration) -> Result<(), BrokerError>;

    /// Renew the lease of an in-flight delivery.
    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> TaskBroker for Arc<B>
where
    B: TaskBroker + ?Sized,
{
    async fn enqueue(&self, task: TaskEnvelope) -> Result<(), BrokerError> {
        (**self).enqueue(task).await
    }

    async fn receive(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        (**self).receive(consumer, wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).ack(delivery).await
    }

    async fn retry_later(&self, delivery: &Delivery, delay: Duration) -> Result<(), BrokerError> {
        (**self).retry_later(delivery, delay).await
    }

    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).heartbeat(delivery).await
    }
}
