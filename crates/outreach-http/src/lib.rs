//! HTTP adapter (axum).
//!
//! Exposes the operator surface over `outreach-core`: session control,
//! campaign submission, status polling and a WebSocket push channel.

pub mod handlers;
pub mod router;

pub use router::{build_router, run_server, AppState};
