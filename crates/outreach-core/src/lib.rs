//! Core domain + application logic for the outreach relay.
//!
//! Framework-agnostic: the chat-network session library lives behind the
//! [`transport::Transport`] port and the HTTP surface in its own crate.

pub mod access;
pub mod audit;
pub mod campaign;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod status;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
