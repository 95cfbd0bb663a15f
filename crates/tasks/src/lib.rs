//! `parley-tasks` — work pointers and the broker that carries them.
//!
//! A task never carries message content: it names a session and its owner,
//! and the worker re-reads the current state from the session store.

pub mod broker;
pub mod in_memory;
pub mod task;

pub use broker::{BrokerError, Delivery, TaskBroker};
pub use in_memory::InMemoryTaskBroker;
pub use task::{PROCESS_SESSION_TASK, ProcessSession, TaskEnvelope};
