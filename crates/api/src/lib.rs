//! HTTP API: session submission and status polling.

pub mod app;
pub mod context;
pub mod middleware;
