//! Storage tiers for tierdb
//!
//! Two tiers, one record type:
//! - [`LocalStore`]: the in-process cache, sharing records behind `Arc`
//! - [`DatabaseStore`]: the typed view of one durable collection
//!
//! The durable tier is abstracted behind [`DurableBackend`], with
//! [`MemoryBackend`] as the in-process implementation and the [`testing`]
//! decorators for failure injection.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod backend;
pub mod document;
pub mod local;
pub mod memory;
pub mod testing;

pub use adapter::DatabaseStore;
pub use backend::{BackendTransaction, DurableBackend};
pub use document::{doc_id, doc_version, from_document, to_document, Document};
pub use local::LocalStore;
pub use memory::MemoryBackend;
