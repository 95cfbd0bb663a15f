//! Worker side of the pipeline: retry policy, the per-delivery engine and
//! the pool of worker slots.

pub mod engine;
pub mod pool;
pub mod retry;

pub use engine::{EngineConfig, ProcessOutcome, ProcessingError, WorkerEngine, WorkerStats, WorkerStatsSnapshot};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use retry::{BackoffStrategy, RetryPolicy};
