//! Orphan reconciliation.
//!
//! A session whose task never made it onto the broker stays `queued` forever.
//! The reconciler periodically looks for sessions still `queued` with no
//! attempt started after a grace period and enqueues a fresh task for each.
//! A duplicate task is harmless: the second delivery either takes over the
//! fence or finds the session terminal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use parley_core::SessionId;
use parley_tasks::{ProcessSession, TaskBroker, TaskEnvelope};

use crate::session_store::{SessionStore, SessionStoreError};

const SWEEP_BATCH: usize = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] SessionStoreError),
}

pub struct Reconciler {
    store: Arc<dyn SessionStore>,
    broker: Arc<dyn TaskBroker>,
    grace: Duration,
    /// Sessions re-enqueued recently, so a slow worker is not handed the same
    /// orphan on every sweep.
    recent: Mutex<HashMap<SessionId, Instant>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn SessionStore>, broker: Arc<dyn TaskBroker>, grace: Duration) -> Self {
        Self {
            store,
            broker,
            grace,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// One pass. Returns the number of sessions re-enqueued.
    pub async fn sweep(&self) -> Result<usize, ReconcileError> {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or_else(|_| chrono::Duration::zero());
        let orphans = self.store.list_orphaned(Utc::now() - grace, SWEEP_BATCH).await?;

        let candidates: Vec<_> = {
            let now = Instant::now();
            let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
            recent.retain(|_, at| now.duration_since(*at) < self.grace);
            orphans
                .into_iter()
                .filter(|s| !recent.contains_key(&s.session_id))
                .collect()
        };

        let mut requeued = 0;
        for session in candidates {
            let task = TaskEnvelope::new(ProcessSession {
                session_id: session.session_id,
                owner_id: session.owner_id,
            });
            match self.broker.enqueue(task).await {
                Ok(()) => {
                    warn!(session_id = %session.session_id, created_at = %session.created_at, "re-enqueued orphaned session");
                    self.recent
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(session.session_id, Instant::now());
                    requeued += 1;
                }
                Err(e) => {
                    error!(session_id = %session.session_id, error = %e, "failed to re-enqueue orphaned session");
                }
            }
        }

        Ok(requeued)
    }

    /// Sweep every `interval` until shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "orphan reconciler started");
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "orphan sweep failed");
                        }
                    }
                }
            }
            info!("orphan reconciler stopped");
        });

        ReconcilerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

#[derive(Debug)]
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parley_core::{Session, UserId};
    use parley_tasks::InMemoryTaskBroker;

    use crate::session_store::InMemorySessionStore;

    #[tokio::test]
    async fn old_untouched_sessions_are_requeued_once() {
        let store = Arc::new(InMemorySessionStore::new());
        let broker = Arc::new(InMemoryTaskBroker::new());

        let old = Session::new(
            SessionId::new(),
            UserId::new(),
            "Hello",
            Utc::now() - chrono::Duration::minutes(10),
        )
        .unwrap();
        let fresh = Session::new(SessionId::new(), UserId::new(), "Hi", Utc::now()).unwrap();
        store.create(&old).await.unwrap();
        store.create(&fresh).await.unwrap();

        let reconciler = Reconciler::new(store.clone(), broker.clone(), Duration::from_secs(300));
        assert_eq!(reconciler.sweep().await.unwrap(), 1);
        assert_eq!(reconciler.sweep().await.unwrap(), 0);

        let d = broker.receive("w", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(d.task().payload().session_id, old.session_id);
        assert_eq!(broker.queued_len(), 0);
    }
}
