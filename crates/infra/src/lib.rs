//! Infrastructure layer: session persistence, broker adapters, the worker
//! side of the pipeline and process configuration.

pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod producer;
pub mod reconciler;
pub mod session_store;
pub mod status_reader;
pub mod worker;

mod integration_tests;

pub use bootstrap::{BootstrapError, Components};
pub use config::{CompletionSettings, ConfigError, Settings};
pub use producer::{Producer, ProducerError, SubmitReceipt};
pub use reconciler::{Reconciler, ReconcilerHandle};
pub use session_store::{BeginOutcome, InMemorySessionStore, PostgresSessionStore, SessionStore, SessionStoreError};
pub use status_reader::{SessionStatusView, SessionSummary, StatusError, StatusReader};
pub use worker::{
    EngineConfig, ProcessOutcome, ProcessingError, RetryPolicy, WorkerEngine, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle, WorkerStatsSnapshot,
};
