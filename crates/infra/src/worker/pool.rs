//! Worker pool: N slots, each holding at most one delivery at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::engine::{WorkerEngine, WorkerStats, WorkerStatsSnapshot};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Prefix of the consumer names (`<name>-<slot>`), used for logging.
    pub name: String,
    pub concurrency: usize,
    /// How long one `receive` call waits for a task before re-checking shutdown.
    pub poll_wait: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            concurrency: 4,
            poll_wait: Duration::from_secs(1),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerPoolHandle {
    /// Stop pulling new tasks and wait for in-flight deliveries to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker slot terminated abnormally");
            }
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.concurrency` slots on the current tokio runtime.
    pub fn spawn(engine: Arc<WorkerEngine>, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = engine.stats();

        let joins = (0..config.concurrency.max(1))
            .map(|slot| {
                let consumer = format!("{}-{}", config.name, slot);
                tokio::spawn(slot_loop(
                    Arc::clone(&engine),
                    consumer,
                    config.poll_wait,
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        info!(pool = %config.name, slots = config.concurrency.max(1), "worker pool started");

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
        }
    }
}

async fn slot_loop(
    engine: Arc<WorkerEngine>,
    consumer: String,
    poll_wait: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = %consumer, "worker slot started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let received = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            received = engine.broker().receive(&consumer, poll_wait) => received,
        };

        match received {
            Ok(Some(delivery)) => match engine.process(&delivery).await {
                Ok(outcome) => debug!(worker = %consumer, ?outcome, "delivery settled"),
                Err(e) => error!(
                    worker = %consumer,
                    task_id = %delivery.task().task_id(),
                    error = %e,
                    "delivery left unsettled; it will be redelivered"
                ),
            },
            Ok(None) => {}
            Err(e) => {
                error!(worker = %consumer, error = %e, "failed to receive task");
                tokio::time::sleep(poll_wait).await;
            }
        }
    }

    debug!(worker = %consumer, "worker slot stopped");
}
