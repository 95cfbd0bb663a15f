//! Adapter selection shared by the binaries.
//!
//! `USE_PERSISTENT_STORES=false` wires the in-memory store and broker (single
//! process, nothing survives a restart). `true` wires Postgres + Redis Streams
//! and needs the `redis` feature.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use parley_ai::{CompletionError, CompletionService, EchoCompletionService, OpenAiCompatibleService, OpenAiConfig};
use parley_tasks::{BrokerError, InMemoryTaskBroker, TaskBroker};

use crate::config::Settings;
use crate::session_store::{InMemorySessionStore, SessionStore, SessionStoreError};
use crate::worker::EngineConfig;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("session store: {0}")]
    Store(#[from] SessionStoreError),

    #[error("task broker: {0}")]
    Broker(#[from] BrokerError),

    #[error("completion service: {0}")]
    Completion(#[from] CompletionError),

    #[error("persistent stores requested but this binary was built without the `redis` feature")]
    PersistenceUnavailable,
}

/// The three collaborators every pipeline role is built from.
#[derive(Clone)]
pub struct Components {
    pub store: Arc<dyn SessionStore>,
    pub broker: Arc<dyn TaskBroker>,
    pub completion: Arc<dyn CompletionService>,
}

impl Components {
    pub async fn from_settings(settings: &Settings) -> Result<Self, BootstrapError> {
        let (store, broker) = if settings.use_persistent_stores {
            persistent(settings).await?
        } else {
            info!("using in-memory session store and task broker");
            let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
            let broker: Arc<dyn TaskBroker> =
                Arc::new(InMemoryTaskBroker::with_visibility_timeout(settings.visibility_timeout()));
            (store, broker)
        };

        Ok(Self {
            store,
            broker,
            completion: completion_service(settings)?,
        })
    }
}

/// Worker engine tuning derived from the process settings.
pub fn engine_config(settings: &Settings) -> EngineConfig {
    EngineConfig {
        retry: settings.retry.clone(),
        soft_time_limit: settings.soft_time_limit,
        heartbeat_interval: settings.heartbeat_interval,
    }
}

fn completion_service(settings: &Settings) -> Result<Arc<dyn CompletionService>, BootstrapError> {
    let c = &settings.completion;
    match &c.api_key {
        None => {
            warn!("COMPLETION_API_KEY not set; replies come from the echo completion service");
            Ok(Arc::new(EchoCompletionService::new()))
        }
        Some(key) => {
            info!(base_url = %c.base_url, model = %c.model, "using OpenAI-compatible completion service");
            let service = OpenAiCompatibleService::from_config(OpenAiConfig {
                base_url: c.base_url.clone(),
                api_key: Some(key.clone()),
                model: c.model.clone(),
                system_prompt: Some(c.system_prompt.clone()),
            })?;
            Ok(Arc::new(service))
        }
    }
}

#[cfg(feature = "redis")]
async fn persistent(settings: &Settings) -> Result<(Arc<dyn SessionStore>, Arc<dyn TaskBroker>), BootstrapError> {
    use crate::broker::{RedisStreamsConfig, RedisStreamsTaskBroker};
    use crate::session_store::PostgresSessionStore;

    let max_connections = u32::try_from(settings.worker_concurrency)
        .unwrap_or(u32::MAX)
        .saturating_add(4);
    let store = PostgresSessionStore::connect(&settings.database_url, max_connections).await?;
    store.ensure_schema().await?;

    let broker = RedisStreamsTaskBroker::connect(
        &settings.redis_url,
        RedisStreamsConfig {
            stream_key: settings.task_stream.clone(),
            group: settings.task_group.clone(),
            visibility_timeout: settings.visibility_timeout(),
        },
    )
    .await?;

    info!(stream = %settings.task_stream, group = %settings.task_group, "using Postgres session store and Redis Streams broker");
    Ok((Arc::new(store), Arc::new(broker)))
}

#[cfg(not(feature = "redis"))]
async fn persistent(_settings: &Settings) -> Result<(Arc<dyn SessionStore>, Arc<dyn TaskBroker>), BootstrapError> {
    Err(BootstrapError::PersistenceUnavailable)
}
