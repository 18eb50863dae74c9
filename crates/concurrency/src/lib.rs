//! Optimistic concurrency for tierdb
//!
//! - [`RetryBackoff`]: linear, ping-scaled retry pacing with jitter
//! - [`UpdateEngine`]: bounded-retry compare-and-swap updates that
//!   reconcile the cached record in place on success

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod engine;

pub use backoff::RetryBackoff;
pub use engine::{persist_new, UpdateEngine, DEFAULT_MAX_ATTEMPTS};
