//! `parley-core` — session domain primitives.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the persisted `Session` record and the rules that govern its
//! status transitions.

pub mod error;
pub mod id;
pub mod session;

pub use error::{DomainError, DomainResult};
pub use id::{SessionId, TaskId, UserId};
pub use session::{
    ChatMessage, CommitOutcome, MessageRole, Session, SessionMeta, SessionStatus,
};
