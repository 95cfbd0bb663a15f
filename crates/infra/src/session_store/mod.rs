//! Session Store: the single shared mutable resource of the pipeline.
//!
//! All mutation goes through narrow atomic operations (begin an attempt,
//! fenced complete, fenced fail). There is no read-modify-write of a whole
//! session from the worker side.

pub mod in_memory;
pub mod postgres;
pub mod store;

pub use in_memory::InMemorySessionStore;
pub use postgres::PostgresSessionStore;
pub use store::{BeginOutcome, SessionStore, SessionStoreError};
