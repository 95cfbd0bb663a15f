//! Integration tests for the full session pipeline.
//!
//! Tests: Producer → TaskBroker → WorkerEngine → SessionStore → StatusReader
//!
//! Verifies:
//! - The happy path produces exactly one assistant reply
//! - The retry budget is honoured exactly
//! - Ownership is enforced on reads
//! - Redelivery of a settled task changes nothing

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use parley_ai::{CompletionError, CompletionReply, CompletionRequest, CompletionService};
    use parley_core::{ChatMessage, MessageRole, SessionStatus, UserId};
    use parley_tasks::{Delivery, InMemoryTaskBroker, ProcessSession, TaskBroker, TaskEnvelope};

    use crate::producer::Producer;
    use crate::session_store::{InMemorySessionStore, SessionStore};
    use crate::status_reader::{StatusError, StatusReader};
    use crate::worker::{EngineConfig, ProcessOutcome, RetryPolicy, WorkerEngine, WorkerPool, WorkerPoolConfig};

    /// Fails with a transient error until call number `succeed_on`, then replies.
    struct Flaky {
        succeed_on: Option<u32>,
        calls: AtomicU32,
    }

    impl Flaky {
        fn always_failing() -> Self {
            Self {
                succeed_on: None,
                calls: AtomicU32::new(0),
            }
        }

        fn succeeding_on(call: u32) -> Self {
            Self {
                succeed_on: Some(call),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionService for Flaky {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionReply, CompletionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.succeed_on {
                Some(k) if n >= k => Ok(CompletionReply::new("Hi there")),
                _ => Err(CompletionError::transient(format!("upstream 503 on call {n}"))),
            }
        }
    }

    struct Pipeline {
        store: Arc<InMemorySessionStore>,
        broker: Arc<InMemoryTaskBroker>,
        producer: Producer,
        reader: StatusReader,
        engine: Arc<WorkerEngine>,
    }

    fn pipeline(completion: Arc<dyn CompletionService>, max_attempts: u32) -> Pipeline {
        let store = Arc::new(InMemorySessionStore::new());
        let broker = Arc::new(InMemoryTaskBroker::new());
        let engine = Arc::new(WorkerEngine::new(
            store.clone(),
            broker.clone(),
            completion,
            EngineConfig {
                retry: RetryPolicy::exponential(max_attempts, Duration::from_millis(1), Duration::from_millis(5)),
                soft_time_limit: Duration::from_secs(2),
                heartbeat_interval: Duration::from_millis(50),
            },
        ));

        Pipeline {
            producer: Producer::new(store.clone(), broker.clone()),
            reader: StatusReader::new(store.clone()),
            store,
            broker,
            engine,
        }
    }

    async fn next(p: &Pipeline) -> Option<Delivery> {
        p.broker.receive("it-worker", Duration::from_millis(500)).await.unwrap()
    }

    /// Process deliveries until the queue stays empty.
    async fn drain(p: &Pipeline) -> Vec<ProcessOutcome> {
        let mut outcomes = Vec::new();
        while let Some(d) = next(p).await {
            outcomes.push(p.engine.process(&d).await.unwrap());
        }
        outcomes
    }

    #[tokio::test]
    async fn hello_becomes_hi_there() {
        let p = pipeline(Arc::new(Flaky::succeeding_on(1)), 3);
        let u1 = UserId::new();

        let receipt = p.producer.submit(u1, "Hello").await.unwrap();
        assert_eq!(receipt.status, SessionStatus::Queued);

        let queued = p.reader.get_status(receipt.session_id, u1).await.unwrap();
        assert_eq!(queued.status, SessionStatus::Queued);
        assert_eq!(queued.messages, vec![ChatMessage::user("Hello")]);

        assert_eq!(drain(&p).await, vec![ProcessOutcome::Completed]);

        let done = p.reader.get_status(receipt.session_id, u1).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(
            done.messages,
            vec![ChatMessage::user("Hello"), ChatMessage::assistant("Hi there")]
        );

        let stored = p.store.get(receipt.session_id).await.unwrap().unwrap();
        assert!(stored.completed_at.unwrap() >= stored.started_at.unwrap());
    }

    #[tokio::test]
    async fn always_failing_service_fails_after_exactly_max_attempts() {
        let completion = Arc::new(Flaky::always_failing());
        let p = pipeline(completion.clone(), 3);
        let owner = UserId::new();
        let receipt = p.producer.submit(owner, "Hello").await.unwrap();

        let outcomes = drain(&p).await;
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], ProcessOutcome::RetryScheduled { next_attempt: 2, .. }));
        assert!(matches!(outcomes[1], ProcessOutcome::RetryScheduled { next_attempt: 3, .. }));
        assert!(matches!(outcomes[2], ProcessOutcome::Failed(_)));
        assert_eq!(completion.calls.load(Ordering::SeqCst), 3);

        let s = p.store.get(receipt.session_id).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Failed);
        assert!(!s.error.as_deref().unwrap_or_default().is_empty());
        assert!(s.failed_at.is_some());
        assert_eq!(s.messages.len(), 1);
    }

    #[tokio::test]
    async fn success_on_final_attempt_completes() {
        let completion = Arc::new(Flaky::succeeding_on(3));
        let p = pipeline(completion.clone(), 3);
        let owner = UserId::new();
        let receipt = p.producer.submit(owner, "Hello").await.unwrap();

        let outcomes = drain(&p).await;
        assert_eq!(outcomes.last(), Some(&ProcessOutcome::Completed));

        let view = p.reader.get_status(receipt.session_id, owner).await.unwrap();
        assert_eq!(view.status, SessionStatus::Completed);
        assert_eq!(
            view.messages.iter().filter(|m| m.role == MessageRole::Assistant).count(),
            1
        );
        assert!(view.error.is_none());
    }

    #[tokio::test]
    async fn status_reader_denies_other_callers() {
        let p = pipeline(Arc::new(Flaky::succeeding_on(1)), 3);
        let owner = UserId::new();
        let receipt = p.producer.submit(owner, "Hello").await.unwrap();
        drain(&p).await;

        assert_eq!(
            p.reader.get_status(receipt.session_id, UserId::new()).await,
            Err(StatusError::NotFound)
        );
    }

    #[tokio::test]
    async fn redelivering_a_terminal_session_changes_nothing() {
        let completion = Arc::new(Flaky::succeeding_on(1));
        let p = pipeline(completion.clone(), 3);
        let owner = UserId::new();
        let receipt = p.producer.submit(owner, "Hello").await.unwrap();
        drain(&p).await;
        let before = p.store.get(receipt.session_id).await.unwrap().unwrap();

        // Same work pointer published again, e.g. by a producer retry.
        p.broker
            .enqueue(TaskEnvelope::new(ProcessSession {
                session_id: receipt.session_id,
                owner_id: owner,
            }))
            .await
            .unwrap();

        assert_eq!(
            drain(&p).await,
            vec![ProcessOutcome::AlreadyTerminal(SessionStatus::Completed)]
        );
        let after = p.store.get(receipt.session_id).await.unwrap().unwrap();
        assert_eq!(after, before);
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_crash_before_commit_is_recovered_by_redelivery() {
        let store = Arc::new(InMemorySessionStore::new());
        let broker = Arc::new(InMemoryTaskBroker::with_visibility_timeout(Duration::from_millis(50)));
        let producer = Producer::new(store.clone(), broker.clone());
        let engine = WorkerEngine::new(
            store.clone(),
            broker.clone(),
            Arc::new(Flaky::succeeding_on(1)),
            EngineConfig::default(),
        );
        let owner = UserId::new();
        let receipt = producer.submit(owner, "Hello").await.unwrap();

        // A worker takes the task and starts the attempt, then dies silently.
        let lost = broker.receive("dead", Duration::ZERO).await.unwrap().unwrap();
        store.begin_attempt(lost.task().payload().session_id, Utc::now()).await.unwrap();

        let redelivered = broker
            .receive("alive", Duration::from_secs(1))
            .await
            .unwrap()
            .expect("redelivered after lease expiry");
        assert!(redelivered.is_redelivery());
        assert_eq!(engine.process(&redelivered).await.unwrap(), ProcessOutcome::Completed);

        let s = store.get(receipt.session_id).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Completed);
        assert_eq!(s.attempt, 2);
        assert_eq!(s.messages.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pool_settles_every_session_once() {
        let p = pipeline(Arc::new(Flaky::succeeding_on(1)), 3);
        let owner = UserId::new();
        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(p.producer.submit(owner, &format!("message {i}")).await.unwrap().session_id);
        }

        let handle = WorkerPool::spawn(
            p.engine.clone(),
            WorkerPoolConfig::default()
                .with_concurrency(4)
                .with_name("it"),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while handle.stats().completed < 20 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        let listed = p.reader.list_sessions(owner).await.unwrap();
        assert_eq!(listed.len(), 20);
        for id in ids {
            let s = p.store.get(id).await.unwrap().unwrap();
            assert_eq!(s.status, SessionStatus::Completed);
            assert_eq!(s.messages.len(), 2);
        }
    }
}
