//! In-memory task broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::broker::{BrokerError, Delivery, TaskBroker};
use crate::task::TaskEnvelope;

/// Upper bound on how long `receive` sleeps between scans, so delayed tasks and
/// expired leases are picked up without an explicit wake-up.
const SCAN_TICK: Duration = Duration::from_millis(20);

/// Default lease length for an in-flight delivery.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct InFlight {
    consumer: String,
    task: TaskEnvelope,
    lease_until: Instant,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<(TaskEnvelope, bool)>,
    in_flight: HashMap<String, InFlight>,
    next_tag: u64,
}

impl State {
    /// Expired leases go back to the front of the queue, flagged as redelivered.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.lease_until <= now)
            .map(|(tag, _)| tag.clone())
            .collect();

        for tag in expired {
            if let Some(f) = self.in_flight.remove(&tag) {
                warn!(
                    delivery = %tag,
                    consumer = %f.consumer,
                    task_id = %f.task.task_id(),
                    "lease expired; redelivering task"
                );
                self.queue.push_front((f.task, true));
            }
        }
    }

    fn take_ready(&mut self) -> Option<(TaskEnvelope, bool)> {
        let now = Utc::now();
        let idx = self.queue.iter().position(|(t, _)| t.is_ready(now))?;
        self.queue.remove(idx)
    }
}

/// In-memory broker.
///
/// - FIFO among ready tasks, delayed tasks skipped until due
/// - leases with a visibility timeout (dead consumers are detected by missed heartbeats)
/// - no persistence: tasks are lost with the process
#[derive(Debug)]
pub struct InMemoryTaskBroker {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryTaskBroker {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Unavailable("in-memory broker lock poisoned".to_string()))
    }

    /// Tasks waiting to be delivered (ready or delayed).
    pub fn queued_len(&self) -> usize {
        self.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Deliveries currently leased to a consumer.
    pub fn in_flight_len(&self) -> usize {
        self.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    fn try_lease(&self, consumer: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.lock()?;
        state.reclaim_expired(Instant::now());

        let Some((task, redelivered)) = state.take_ready() else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = format!("mem-{}", state.next_tag);
        state.in_flight.insert(
            tag.clone(),
            InFlight {
                consumer: consumer.to_string(),
                task: task.clone(),
                lease_until: Instant::now() + self.visibility_timeout,
            },
        );

        Ok(Some(Delivery::new(tag, consumer, task, redelivered)))
    }

    fn settle(&self, state: &mut State, delivery: &Delivery) -> Result<InFlight, BrokerError> {
        match state.in_flight.get(delivery.tag()) {
            Some(f) if f.consumer == delivery.consumer() => {}
            _ => return Err(BrokerError::UnknownDelivery(delivery.tag().to_string())),
        }
        state
            .in_flight
            .remove(delivery.tag())
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.tag().to_string()))
    }
}

impl Default for InMemoryTaskBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskBroker for InMemoryTaskBroker {
    async fn enqueue(&self, task: TaskEnvelope) -> Result<(), BrokerError> {
        {
            let mut state = self.lock()?;
            debug!(task_id = %task.task_id(), attempt = task.attempt(), "task enqueued");
            state.queue.push_back((task, false));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;

        loop {
            if let Some(delivery) = self.try_lease(consumer)? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let nap = deadline.saturating_duration_since(now).min(SCAN_TICK);
            let _ = tokio::time::timeout(nap, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        self.settle(&mut state, delivery)?;
        Ok(())
    }

    async fn retry_later(&self, delivery: &Delivery, delay: Duration) -> Result<(), BrokerError> {
        {
            let mut state = self.lock()?;
            let in_flight = self.settle(&mut state, delivery)?;
            let not_before =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            state.queue.push_back((in_flight.task.next_attempt(not_before), false));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn heartbeat(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        match state.in_flight.get_mut(delivery.tag()) {
            Some(f) if f.consumer == delivery.consumer() => {
                f.lease_until = Instant::now() + self.visibility_timeout;
                Ok(())
            }
            _ => Err(BrokerError::UnknownDelivery(delivery.tag().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ProcessSession;
    use parley_core::{SessionId, UserId};

    fn task() -> TaskEnvelope {
        TaskEnvelope::new(ProcessSession {
            session_id: SessionId::new(),
            owner_id: UserId::new(),
        })
    }

    #[tokio::test]
    async fn prefetch_is_one_task_per_receive() {
        let broker = InMemoryTaskBroker::new();
        broker.enqueue(task()).await.unwrap();
        broker.enqueue(task()).await.unwrap();

        let d = broker.receive("w1", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(broker.in_flight_len(), 1);
        assert_eq!(broker.queued_len(), 1);
        assert!(!d.is_redelivery());
    }

    #[tokio::test]
    async fn ack_settles_delivery_once() {
        let broker = InMemoryTaskBroker::new();
        broker.enqueue(task()).await.unwrap();

        let d = broker.receive("w1", Duration::ZERO).await.unwrap().unwrap();
        broker.ack(&d).await.unwrap();
        assert_eq!(broker.in_flight_len(), 0);

        assert!(matches!(broker.ack(&d).await, Err(BrokerError::UnknownDelivery(_))));
        assert!(broker.receive("w1", Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered_after_lease_expiry() {
        let broker = InMemoryTaskBroker::with_visibility_timeout(Duration::from_millis(30));
        let t = task();
        broker.enqueue(t.clone()).await.unwrap();

        let first = broker.receive("dead-worker", Duration::ZERO).await.unwrap().unwrap();
        assert!(broker.receive("w2", Duration::ZERO).await.unwrap().is_none());

        let second = broker
            .receive("w2", Duration::from_millis(500))
            .await
            .unwrap()
            .expect("redelivery");
        assert!(second.is_redelivery());
        assert_eq!(second.task(), &t);
        assert_eq!(second.task().attempt(), 1);

        // The dead worker's receipt is no longer valid.
        assert!(matches!(broker.ack(&first).await, Err(BrokerError::UnknownDelivery(_))));
        broker.ack(&second).await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_keeps_lease_alive() {
        let broker = InMemoryTaskBroker::with_visibility_timeout(Duration::from_millis(200));
        broker.enqueue(task()).await.unwrap();
        let d = broker.receive("w1", Duration::ZERO).await.unwrap().unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            broker.heartbeat(&d).await.unwrap();
        }

        assert!(broker.receive("w2", Duration::ZERO).await.unwrap().is_none());
        broker.ack(&d).await.unwrap();
    }

    #[tokio::test]
    async fn retry_later_publishes_next_attempt_after_delay() {
        let broker = InMemoryTaskBroker::new();
        let t = task();
        broker.enqueue(t.clone()).await.unwrap();

        let d = broker.receive("w1", Duration::ZERO).await.unwrap().unwrap();
        broker.retry_later(&d, Duration::from_millis(50)).await.unwrap();
        assert_eq!(broker.in_flight_len(), 0);

        // Not visible before the backoff elapses.
        assert!(broker.receive("w1", Duration::ZERO).await.unwrap().is_none());

        let retry = broker
            .receive("w1", Duration::from_millis(500))
            .await
            .unwrap()
            .expect("retry becomes visible");
        assert_eq!(retry.task().task_id(), t.task_id());
        assert_eq!(retry.task().attempt(), 2);
    }

    #[tokio::test]
    async fn receive_wakes_up_on_enqueue() {
        let broker = std::sync::Arc::new(InMemoryTaskBroker::new());
        let b = broker.clone();
        let waiter = tokio::spawn(async move { b.receive("w1", Duration::from_secs(2)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.enqueue(task()).await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert!(got.is_some());
    }
}
