//! Collection facade
//!
//! A [`Collection`] arbitrates between the local cache tier and the
//! durable tier for one record type: cache-first reads, duplicate-checked
//! creates, compare-and-swap updates, two-tier deletes, and unique-index
//! lookups. Every operation has a blocking `_sync` form and an
//! asynchronous form completing into a [`Pending`] handle.
//!
//! Reconciliation into a cached instance is serialized per key, so two
//! writers finishing at the same time never interleave partial field
//! copies on the same record.

use crate::config::CollectionConfig;
use crate::index::{query_value, IndexedField};
use crate::task::{spawn_op, Pending};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tierdb_concurrency::UpdateEngine;
use tierdb_core::{
    reconcile_from_newer, Error, Outcome, Record, RejectedUpdate, Result, StoreKey, UpdateOutcome,
};
use tierdb_storage::{DatabaseStore, DurableBackend, LocalStore};
use tracing::{debug, info, warn};

/// Callback invoked after a key is removed from the collection
pub type RemovalHook<K> = Box<dyn Fn(&K) + Send + Sync>;

/// Type-erased view of a collection, for the registry and the scheduler
pub trait CollectionHandle: Send + Sync {
    /// Unique collection name
    fn name(&self) -> &str;
    /// Names of collections this one depends on
    fn dependencies(&self) -> &[String];
    /// Whether the collection accepts operations
    fn is_running(&self) -> bool;
    /// Transition `stopped → running`
    fn start(&self) -> Result<()>;
    /// Transition `running → stopped`, evicting the cache
    fn shutdown(&self) -> Result<()>;
    /// Number of locally cached records
    fn cache_size(&self) -> usize;
    /// Up to `limit` cached keys in canonical string form
    fn cached_key_strings(&self, limit: usize) -> Vec<String>;
}

/// Builder for a [`Collection`]
pub struct CollectionBuilder<X: Record> {
    name: String,
    backend: Arc<dyn DurableBackend>,
    config: CollectionConfig,
    engine: UpdateEngine,
    dependencies: Vec<String>,
    removal_hook: Option<RemovalHook<X::Key>>,
}

impl<X: Record> CollectionBuilder<X> {
    /// Override the per-collection settings
    pub fn config(mut self, config: CollectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the update engine (retry ceiling, backoff)
    pub fn engine(mut self, engine: UpdateEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Declare a startup/shutdown-ordering dependency on another collection
    pub fn dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Install a callback run after each removal
    pub fn removal_hook<F: Fn(&X::Key) + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.removal_hook = Some(Box::new(hook));
        self
    }

    /// Assemble the collection (stopped; call `start` before use)
    pub fn build(self) -> Arc<Collection<X>> {
        Arc::new(Collection {
            store: DatabaseStore::new(self.name.clone(), self.backend),
            name: self.name,
            config: self.config,
            engine: self.engine,
            cache: LocalStore::new(),
            dependencies: self.dependencies,
            running: AtomicBool::new(false),
            key_locks: DashMap::new(),
            index_names: RwLock::new(Vec::new()),
            removal_hook: self.removal_hook,
        })
    }
}

/// A named, typed container of records over two storage tiers
pub struct Collection<X: Record> {
    name: String,
    config: CollectionConfig,
    cache: LocalStore<X>,
    store: DatabaseStore<X>,
    engine: UpdateEngine,
    dependencies: Vec<String>,
    running: AtomicBool,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    index_names: RwLock<Vec<&'static str>>,
    removal_hook: Option<RemovalHook<X::Key>>,
}

impl<X: Record> Collection<X> {
    /// Start building a collection over `backend`
    pub fn builder(name: impl Into<String>, backend: Arc<dyn DurableBackend>) -> CollectionBuilder<X> {
        CollectionBuilder {
            name: name.into(),
            backend,
            config: CollectionConfig::default(),
            engine: UpdateEngine::default(),
            dependencies: Vec::new(),
            removal_hook: None,
        }
    }

    /// The durable store adapter backing this collection
    pub fn store(&self) -> &DatabaseStore<X> {
        &self.store
    }

    /// Names of the registered unique indexes
    pub fn index_names(&self) -> Vec<&'static str> {
        self.index_names.read().clone()
    }

    fn guard_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::CollectionStopped(self.name.clone()))
        }
    }

    fn key_lock(&self, key: &X::Key) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.to_key_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ---- reads ----

    /// Cache-first read, caching database hits per the collection config
    pub fn read_sync(&self, key: &X::Key) -> Outcome<Arc<X>> {
        self.read_with_sync(key, self.config.cache_on_read)
    }

    /// Cache-first read with explicit control over caching the miss path
    pub fn read_with_sync(&self, key: &X::Key, cache_on_miss: bool) -> Outcome<Arc<X>> {
        if let Err(e) = self.guard_running() {
            return Outcome::Failure(e);
        }
        if let Some(hit) = self.cache.get(key) {
            hit.set_read_only(true);
            return Outcome::Success(hit);
        }
        match self.store.read(key) {
            Ok(Some(record)) => {
                if cache_on_miss {
                    if let Err(e) = self.cache.save(Arc::clone(&record)) {
                        return Outcome::Failure(e);
                    }
                }
                Outcome::Success(record)
            }
            Ok(None) => Outcome::Empty,
            Err(Error::Transport(msg)) if !self.config.propagate_read_errors => {
                warn!(collection = %self.name, error = %msg, "transport failure on read; treating as empty");
                Outcome::Empty
            }
            Err(e) => Outcome::Failure(e),
        }
    }

    /// Whether `key` exists in either tier
    pub fn has_key_sync(&self, key: &X::Key) -> Outcome<bool> {
        if let Err(e) = self.guard_running() {
            return Outcome::Failure(e);
        }
        if self.cache.has(key) {
            return Outcome::Success(true);
        }
        match self.store.has(key) {
            Ok(present) => Outcome::Success(present),
            Err(Error::Transport(msg)) if !self.config.propagate_read_errors => {
                warn!(collection = %self.name, error = %msg, "transport failure on existence check; treating as absent");
                Outcome::Success(false)
            }
            Err(e) => Outcome::Failure(e),
        }
    }

    // ---- writes ----

    /// Create a new record at version 0.
    ///
    /// The initializer runs on a writable record and may overwrite the
    /// key; the version is forced back to 0 afterwards. The record is
    /// persisted before it is cached, so a persistence failure never
    /// leaves a phantom cached entry.
    pub fn create_sync<F>(&self, key: X::Key, initializer: F) -> Outcome<Arc<X>>
    where
        F: FnOnce(&X) -> Result<()>,
    {
        if let Err(e) = self.guard_running() {
            return Outcome::Failure(e);
        }
        let built = (|| -> Result<Arc<X>> {
            let record = X::default();
            record.initialize()?;
            record.meta().id_cell().set(key)?;
            initializer(&record)?;
            record.meta().version_cell().set(0)?;
            record.set_read_only(true);
            self.store.save_new(&record)?;
            let record = Arc::new(record);
            self.cache.save(Arc::clone(&record))?;
            debug!(collection = %self.name, key = %record.key_string()?, "created record");
            Ok(record)
        })();
        match built {
            Ok(record) => Outcome::Success(record),
            Err(e) => Outcome::Failure(e),
        }
    }

    /// Optimistic update of the record under `key`.
    ///
    /// The update function mutates a writable working copy and may run
    /// several times under contention; returning a [`RejectedUpdate`]
    /// stops immediately with no durable write. On success the
    /// caller-visible cached instance has been reconciled in place.
    pub fn update_sync<F>(&self, key: &X::Key, update_fn: F) -> UpdateOutcome<Arc<X>>
    where
        F: Fn(&X) -> std::result::Result<(), RejectedUpdate>,
    {
        if let Err(e) = self.guard_running() {
            return UpdateOutcome::Failure(e);
        }
        let base = match self.cache.get(key) {
            Some(record) => record,
            None => match self.store.read(key) {
                Ok(Some(record)) => {
                    if let Err(e) = self.cache.save(Arc::clone(&record)) {
                        return UpdateOutcome::Failure(e);
                    }
                    record
                }
                Ok(None) => {
                    return UpdateOutcome::Failure(Error::NotFound(format!(
                        "{}@{}",
                        key.to_key_string(),
                        self.name
                    )))
                }
                // Write path: transport failures always propagate
                Err(e) => return UpdateOutcome::Failure(e),
            },
        };
        let lock = self.key_lock(key);
        let _guard = lock.lock();
        self.engine.execute(&self.store, &base, update_fn)
    }

    /// Remove `key` from both tiers.
    ///
    /// Both removals are attempted even if one fails; the cached instance
    /// is invalidated so stale holders cannot write through it. Returns
    /// whether a durable row existed.
    pub fn delete_sync(&self, key: &X::Key) -> Outcome<bool> {
        if let Err(e) = self.guard_running() {
            return Outcome::Failure(e);
        }
        let cache_existed = self.cache.remove(key);
        let result = match self.store.delete(key) {
            Ok(existed) => Outcome::Success(existed),
            Err(Error::Transport(msg)) if !self.config.propagate_read_errors => {
                warn!(collection = %self.name, error = %msg, "transport failure on delete; reporting absent");
                Outcome::Success(false)
            }
            Err(e) => Outcome::Failure(e),
        };
        if cache_existed || matches!(result, Outcome::Success(true)) {
            if let Some(hook) = &self.removal_hook {
                hook(key);
            }
        }
        // The per-key lock entry is only useful while the key exists;
        // in-flight holders keep their Arc clone alive independently
        self.key_locks.remove(&key.to_key_string());
        result
    }

    // ---- cache management ----

    /// Idempotently admit `record` into the cache.
    ///
    /// If a different instance is already cached under the same key, its
    /// fields are reconciled in place from `record` and the existing
    /// instance is returned, preserving identity for long-lived holders.
    pub fn cache_sync(&self, record: Arc<X>) -> Outcome<Arc<X>> {
        if let Err(e) = self.guard_running() {
            return Outcome::Failure(e);
        }
        let admitted = (|| -> Result<Arc<X>> {
            record.initialize()?;
            let key = record.key()?;
            match self.cache.get(&key) {
                Some(existing) => {
                    if Arc::ptr_eq(&existing, &record) {
                        return Ok(existing);
                    }
                    let lock = self.key_lock(&key);
                    let _guard = lock.lock();
                    reconcile_from_newer(existing.as_ref(), record.as_ref())?;
                    Ok(existing)
                }
                None => {
                    record.set_read_only(true);
                    self.cache.save(Arc::clone(&record))?;
                    Ok(record)
                }
            }
        })();
        match admitted {
            Ok(record) => Outcome::Success(record),
            Err(e) => Outcome::Failure(e),
        }
    }

    /// Evict `key` from the cache (the durable tier is untouched)
    pub fn uncache(&self, key: &X::Key) -> bool {
        self.cache.remove(key)
    }

    /// Whether `key` is currently cached
    pub fn is_cached(&self, key: &X::Key) -> bool {
        self.cache.has(key)
    }

    // ---- iteration ----

    /// Lazy single-pass iteration over all records, cache winning over the
    /// durable tier. Keys are snapshotted up front; records deleted during
    /// iteration are skipped.
    pub fn read_all_sync(
        &self,
        cache_results: bool,
    ) -> Result<impl Iterator<Item = Result<Arc<X>>> + '_> {
        self.guard_running()?;
        let mut keys = self.cache.keys();
        let mut seen: FxHashSet<String> =
            keys.iter().map(|key| key.to_key_string()).collect();
        for key in self.store.read_keys()? {
            if seen.insert(key.to_key_string()) {
                keys.push(key);
            }
        }
        Ok(keys
            .into_iter()
            .filter_map(move |key| self.fetch_entry(&key, cache_results).transpose()))
    }

    /// Lazy single-pass iteration that always re-reads the durable tier,
    /// reconciling into cached instances whose durable version is not
    /// older than the cached one.
    pub fn read_all_from_database_sync(
        &self,
        cache_results: bool,
    ) -> Result<impl Iterator<Item = Result<Arc<X>>> + '_> {
        self.guard_running()?;
        let records = self.store.read_all()?;
        Ok(records
            .into_iter()
            .map(move |fresh| self.merge_database_read(fresh, cache_results)))
    }

    fn fetch_entry(&self, key: &X::Key, cache_results: bool) -> Result<Option<Arc<X>>> {
        if let Some(hit) = self.cache.get(key) {
            hit.set_read_only(true);
            return Ok(Some(hit));
        }
        match self.store.read(key)? {
            Some(record) => {
                if cache_results {
                    self.cache.save(Arc::clone(&record))?;
                }
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn merge_database_read(&self, fresh: Arc<X>, cache_results: bool) -> Result<Arc<X>> {
        if !cache_results {
            return Ok(fresh);
        }
        let key = fresh.key()?;
        match self.cache.get(&key) {
            Some(cached) => {
                if fresh.version()? >= cached.version()? {
                    let lock = self.key_lock(&key);
                    let _guard = lock.lock();
                    reconcile_from_newer(cached.as_ref(), fresh.as_ref())?;
                }
                Ok(cached)
            }
            None => {
                self.cache.save(Arc::clone(&fresh))?;
                Ok(fresh)
            }
        }
    }

    // ---- indexes ----

    /// Declare a unique index; uniqueness over existing data is enforced
    /// by the durable backend at registration time.
    pub fn register_index(&self, field: &IndexedField<X>) -> Result<()> {
        self.store
            .backend()
            .register_unique_index(self.store.collection_name(), field.name())?;
        self.index_names.write().push(field.name());
        Ok(())
    }

    /// Resolve a uniquely indexed field value to its record.
    ///
    /// The local cache is scanned first; a durable index hit is re-read by
    /// key and re-validated against the queried value, so a concurrent
    /// local mutation that has not persisted yet reads as empty rather
    /// than a stale match.
    pub fn read_by_index_sync<T: Serialize>(
        &self,
        field: &IndexedField<X>,
        value: &T,
    ) -> Outcome<Arc<X>> {
        if let Err(e) = self.guard_running() {
            return Outcome::Failure(e);
        }
        let value = match query_value(value) {
            Ok(v) => v,
            Err(e) => return Outcome::Failure(e),
        };
        for record in self.cache.values() {
            match field.value_of(&record) {
                Ok(v) if v == value => {
                    record.set_read_only(true);
                    return Outcome::Success(record);
                }
                Ok(_) => {}
                Err(e) => return Outcome::Failure(e),
            }
        }
        let resolved = self.store.backend().find_id_by_field(
            self.store.collection_name(),
            field.name(),
            &value,
        );
        match resolved {
            Ok(Some(id)) => {
                let key = match X::Key::from_key_string(&id) {
                    Ok(key) => key,
                    Err(e) => return Outcome::Failure(e),
                };
                match self.read_sync(&key) {
                    Outcome::Success(record) => match field.value_of(&record) {
                        Ok(v) if v == value => Outcome::Success(record),
                        Ok(_) => {
                            debug!(
                                collection = %self.name,
                                field = field.name(),
                                "index hit no longer matches; treating as empty"
                            );
                            Outcome::Empty
                        }
                        Err(e) => Outcome::Failure(e),
                    },
                    other => other,
                }
            }
            Ok(None) => Outcome::Empty,
            Err(Error::Transport(msg)) if !self.config.propagate_read_errors => {
                warn!(collection = %self.name, error = %msg, "transport failure on index lookup; treating as empty");
                Outcome::Empty
            }
            Err(e) => Outcome::Failure(e),
        }
    }

    /// Resolve a uniquely indexed field value to just its key
    pub fn read_id_by_index_sync<T: Serialize>(
        &self,
        field: &IndexedField<X>,
        value: &T,
    ) -> Outcome<X::Key> {
        match self.read_by_index_sync(field, value) {
            Outcome::Success(record) => match record.key() {
                Ok(key) => Outcome::Success(key),
                Err(e) => Outcome::Failure(e),
            },
            Outcome::Empty => Outcome::Empty,
            Outcome::Failure(e) => Outcome::Failure(e),
        }
    }

    // ---- asynchronous forms ----

    /// Asynchronous [`read_sync`](Self::read_sync)
    pub fn read(self: Arc<Self>, key: &X::Key) -> Pending<Outcome<Arc<X>>> {
        let key = key.clone();
        spawn_op(move || self.read_sync(&key))
    }

    /// Asynchronous [`create_sync`](Self::create_sync)
    pub fn create<F>(self: Arc<Self>, key: X::Key, initializer: F) -> Pending<Outcome<Arc<X>>>
    where
        F: FnOnce(&X) -> Result<()> + Send + 'static,
    {
        spawn_op(move || self.create_sync(key, initializer))
    }

    /// Asynchronous [`update_sync`](Self::update_sync)
    pub fn update<F>(self: Arc<Self>, key: &X::Key, update_fn: F) -> Pending<UpdateOutcome<Arc<X>>>
    where
        F: Fn(&X) -> std::result::Result<(), RejectedUpdate> + Send + 'static,
    {
        let key = key.clone();
        spawn_op(move || self.update_sync(&key, update_fn))
    }

    /// Asynchronous [`delete_sync`](Self::delete_sync)
    pub fn delete(self: Arc<Self>, key: &X::Key) -> Pending<Outcome<bool>> {
        let key = key.clone();
        spawn_op(move || self.delete_sync(&key))
    }

    /// Asynchronous [`has_key_sync`](Self::has_key_sync)
    pub fn has_key(self: Arc<Self>, key: &X::Key) -> Pending<Outcome<bool>> {
        let key = key.clone();
        spawn_op(move || self.has_key_sync(&key))
    }

    /// Asynchronous [`cache_sync`](Self::cache_sync)
    pub fn cache(self: Arc<Self>, record: Arc<X>) -> Pending<Outcome<Arc<X>>> {
        spawn_op(move || self.cache_sync(record))
    }
}

impl<X: Record> CollectionHandle for Collection<X> {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(collection = %self.name, "start called while already running");
        } else {
            info!(collection = %self.name, "collection started");
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            let evicted = self.cache.clear();
            self.key_locks.clear();
            info!(collection = %self.name, evicted, "collection stopped");
        }
        Ok(())
    }

    fn cache_size(&self) -> usize {
        self.cache.len()
    }

    fn cached_key_strings(&self, limit: usize) -> Vec<String> {
        self.cache.key_strings(limit)
    }
}
