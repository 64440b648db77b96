//! Core domain + pipeline logic for the channel digest relay.
//!
//! The chat platform and the summarization service live behind ports (traits)
//! implemented in adapter crates (`dzen-telegram`, `dzen-groq`).

pub mod auth;
pub mod chat;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod errors;
pub mod fetcher;
pub mod live;
pub mod logging;
pub mod publisher;
pub mod scheduler;
pub mod transform;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{AuthError, Error, Result};
