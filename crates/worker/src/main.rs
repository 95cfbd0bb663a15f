//! Standalone worker process: pulls tasks from the broker and runs them
//! through the worker engine until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};

use parley_infra::bootstrap::{self, Components};
use parley_infra::{Reconciler, Settings, WorkerEngine, WorkerPool, WorkerPoolConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    parley_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    if !settings.use_persistent_stores {
        // In-memory adapters are process-local; a separate worker would never see the API's tasks.
        bail!("parley-worker needs USE_PERSISTENT_STORES=true (Postgres + Redis)");
    }

    let Components {
        store,
        broker,
        completion,
    } = Components::from_settings(&settings)
        .await
        .context("failed to wire worker components")?;

    let engine = Arc::new(WorkerEngine::new(
        store.clone(),
        broker.clone(),
        completion,
        bootstrap::engine_config(&settings),
    ));

    let pool_name = std::env::var("WORKER_NAME").unwrap_or_else(|_| format!("worker-{}", std::process::id()));
    let pool = WorkerPool::spawn(
        engine,
        WorkerPoolConfig::default()
            .with_name(pool_name)
            .with_concurrency(settings.worker_concurrency),
    );
    let reconciler = Arc::new(Reconciler::new(store, broker, settings.orphan_grace))
        .spawn((settings.orphan_grace / 4).max(Duration::from_secs(1)));

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested; draining in-flight attempts");

    reconciler.shutdown().await;
    let stats = pool.stats();
    pool.shutdown().await;

    tracing::info!(
        processed = stats.processed,
        completed = stats.completed,
        failed = stats.failed,
        retried = stats.retried,
        "worker stopped"
    );
    Ok(())
}
