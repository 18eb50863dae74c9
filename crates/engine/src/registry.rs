//! Process-wide collection registry
//!
//! Collections register under their unique name; the registry feeds the
//! dependency scheduler and answers administrative inspection queries.

use crate::collection::CollectionHandle;
use crate::scheduler::DependencyScheduler;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tierdb_core::{Error, Result};

/// Administrative snapshot of one collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    /// Collection name
    pub name: String,
    /// Whether the collection is running
    pub running: bool,
    /// Number of locally cached records
    pub cache_size: usize,
    /// Up to the requested number of cached key strings
    pub cached_keys: Vec<String>,
}

/// Name-unique set of registered collections, in registration order
#[derive(Default)]
pub struct Registry {
    handles: RwLock<Vec<Arc<dyn CollectionHandle>>>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a collection.
    ///
    /// # Errors
    ///
    /// `DuplicateCollection` if the name is already taken.
    pub fn register(&self, handle: Arc<dyn CollectionHandle>) -> Result<()> {
        let mut handles = self.handles.write();
        if handles.iter().any(|h| h.name() == handle.name()) {
            return Err(Error::DuplicateCollection(handle.name().to_string()));
        }
        handles.push(handle);
        Ok(())
    }

    /// The collection registered under `name`, if any
    pub fn get(&self, name: &str) -> Option<Arc<dyn CollectionHandle>> {
        self.handles
            .read()
            .iter()
            .find(|h| h.name() == name)
            .cloned()
    }

    /// Registered names, in registration order
    pub fn names(&self) -> Vec<String> {
        self.handles
            .read()
            .iter()
            .map(|h| h.name().to_string())
            .collect()
    }

    /// Snapshot of every registered handle
    pub fn handles(&self) -> Vec<Arc<dyn CollectionHandle>> {
        self.handles.read().clone()
    }

    /// Build a dependency scheduler over the registered collections.
    ///
    /// # Errors
    ///
    /// `UnknownDependency` or `DependencyCycle` if the declared edges are
    /// not a DAG over registered names.
    pub fn scheduler(&self) -> Result<DependencyScheduler> {
        DependencyScheduler::new(self.handles())
    }

    /// Administrative snapshot of every collection, with up to
    /// `key_limit` cached keys each
    pub fn describe(&self, key_limit: usize) -> Vec<CollectionInfo> {
        self.handles()
            .iter()
            .map(|h| CollectionInfo {
                name: h.name().to_string(),
                running: h.is_running(),
                cache_size: h.cache_size(),
                cached_keys: h.cached_key_strings(key_limit),
            })
            .collect()
    }

    /// Names referenced as dependencies but never registered
    pub fn missing_dependencies(&self) -> Vec<String> {
        let handles = self.handles();
        let known: FxHashSet<&str> = handles.iter().map(|h| h.name()).collect();
        let mut missing = Vec::new();
        for handle in &handles {
            for dep in handle.dependencies() {
                if !known.contains(dep.as_str()) && !missing.contains(dep) {
                    missing.push(dep.clone());
                }
            }
        }
        missing
    }
}
