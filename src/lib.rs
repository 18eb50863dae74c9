//! tierdb - typed, versioned, two-tier object store
//!
//! tierdb layers an in-process cache over a durable document store and
//! guarantees that concurrent writers never silently clobber each other:
//! every update is a compare-and-swap on a monotonically increasing
//! version, retried with adaptive backoff under contention.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tierdb::{Collection, MemoryBackend, Record};
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let profiles: Arc<Collection<Profile>> =
//!     Collection::builder("profiles", backend).build();
//! profiles.start()?;
//!
//! let alice = profiles
//!     .create_sync("alice".to_string(), |p| {
//!         p.balance.set(100)?;
//!         Ok(())
//!     })
//!     .into_result()?;
//!
//! profiles.update_sync(&"alice".to_string(), |p| {
//!     let balance = p.balance.get().map_err(|e| RejectedUpdate::new(e.to_string()))?;
//!     p.balance.set(balance - 25).ok();
//!     Ok(())
//! });
//! ```
//!
//! # Architecture
//!
//! The workspace splits along the storage/concurrency seam:
//! `tierdb-core` (records, fields, outcomes), `tierdb-storage` (the cache
//! and durable tiers), `tierdb-concurrency` (the optimistic update
//! engine), and `tierdb-engine` (the collection facade, registry, and
//! dependency scheduler). This crate re-exports the public surface.

pub use tierdb_concurrency::{RetryBackoff, UpdateEngine};
pub use tierdb_core::{
    Error, FieldRef, KeyCell, ListCell, MapCell, OptionalCell, Outcome, Record, RecordMeta,
    RejectedUpdate, RequiredCell, Result, SetCell, StoreKey, UpdateOutcome,
};
pub use tierdb_engine::{
    Collection, CollectionConfig, CollectionHandle, CollectionInfo, DependencyScheduler,
    EngineConfig, IndexedField, Pending, Registry, SerialExecutor,
};
pub use tierdb_storage::{DatabaseStore, DurableBackend, LocalStore, MemoryBackend};
