//! Collection engine for tierdb
//!
//! The facade layer over the storage and concurrency crates:
//!
//! - [`Collection`]: typed CRUD over the two storage tiers, with
//!   optimistic updates and unique-index lookups
//! - [`Registry`] and [`DependencyScheduler`]: process-wide collection
//!   wiring and dependency-ordered start/shutdown
//! - [`task`]: the worker pool, [`Pending`] completion handles, and the
//!   [`SerialExecutor`] continuation context
//! - [`EngineConfig`]: TOML-loadable settings

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collection;
pub mod config;
pub mod index;
pub mod registry;
pub mod scheduler;
pub mod task;

pub use collection::{Collection, CollectionBuilder, CollectionHandle, RemovalHook};
pub use config::{CollectionConfig, EngineConfig};
pub use index::IndexedField;
pub use registry::{CollectionInfo, Registry};
pub use scheduler::DependencyScheduler;
pub use task::{spawn_op, Completer, Pending, SerialExecutor};
