//! Service wiring for the HTTP process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use parley_infra::bootstrap::{self, BootstrapError, Components};
use parley_infra::{
    Producer, Reconciler, ReconcilerHandle, Settings, StatusReader, WorkerEngine, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle, WorkerStatsSnapshot,
};

/// Worker pool and reconciler running inside the API process.
struct Background {
    pool: WorkerPoolHandle,
    reconciler: ReconcilerHandle,
}

pub struct AppServices {
    producer: Producer,
    status: StatusReader,
    background: Mutex<Option<Background>>,
}

impl AppServices {
    /// Build request-path services; with `embedded_workers` also start a
    /// worker pool and the orphan reconciler on the current runtime.
    pub fn new(components: Components, settings: &Settings) -> Self {
        let Components {
            store,
            broker,
            completion,
        } = components;

        let background = settings.embedded_workers.then(|| {
            let engine = Arc::new(WorkerEngine::new(
                store.clone(),
                broker.clone(),
                completion,
                bootstrap::engine_config(settings),
            ));
            let pool = WorkerPool::spawn(
                engine,
                WorkerPoolConfig::default()
                    .with_name("api-worker")
                    .with_concurrency(settings.worker_concurrency),
            );
            let reconciler = Arc::new(Reconciler::new(store.clone(), broker.clone(), settings.orphan_grace))
                .spawn(reconcile_interval(settings.orphan_grace));
            Background { pool, reconciler }
        });

        if background.is_none() {
            info!("embedded workers disabled; sessions are processed by a separate worker process");
        }

        Self {
            producer: Producer::new(store.clone(), broker),
            status: StatusReader::new(store),
            background: Mutex::new(background),
        }
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn status(&self) -> &StatusReader {
        &self.status
    }

    /// Embedded worker counters, when workers run in this process.
    pub fn worker_stats(&self) -> Option<WorkerStatsSnapshot> {
        let guard = self.background.lock().unwrap_or_else(|p| p.into_inner());
        guard.as_ref().map(|b| b.pool.stats())
    }

    /// Stop embedded workers, letting in-flight attempts finish.
    pub async fn shutdown(&self) {
        let background = self.background.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(b) = background {
            b.reconciler.shutdown().await;
            b.pool.shutdown().await;
        }
    }
}

/// Sweep a few times per grace period.
fn reconcile_interval(grace: Duration) -> Duration {
    (grace / 4).max(Duration::from_secs(1))
}

pub async fn build_services(settings: &Settings) -> Result<AppServices, BootstrapError> {
    let components = Components::from_settings(settings).await?;
    Ok(AppServices::new(components, settings))
}
