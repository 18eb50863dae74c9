//! Backend decorators for exercising failure and contention paths
//!
//! These wrappers delegate to an inner backend while injecting the
//! conditions the retry machinery has to survive: transport failures,
//! low-level write conflicts, and concurrent version bumps. They live in
//! the library (not a test module) so every crate in the workspace can
//! drive its tests through them.

use crate::backend::{BackendTransaction, DurableBackend};
use crate::document::{doc_version, Document};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tierdb_core::{Error, Result};

/// Operation counters recorded by [`CountingBackend`]
#[derive(Default)]
pub struct OpCounts {
    reads: AtomicU64,
    inserts: AtomicU64,
    deletes: AtomicU64,
    begins: AtomicU64,
    commits: AtomicU64,
}

impl OpCounts {
    /// Committed-read count
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Insert count
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Delete count
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Transactions opened
    pub fn begins(&self) -> u64 {
        self.begins.load(Ordering::Relaxed)
    }

    /// Transactions committed
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

/// Counts operations passing through to the inner backend
pub struct CountingBackend {
    inner: Arc<dyn DurableBackend>,
    counts: Arc<OpCounts>,
}

impl CountingBackend {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn DurableBackend>) -> Self {
        CountingBackend {
            inner,
            counts: Arc::new(OpCounts::default()),
        }
    }

    /// Shared handle to the counters
    pub fn counts(&self) -> Arc<OpCounts> {
        Arc::clone(&self.counts)
    }
}

impl DurableBackend for CountingBackend {
    fn read(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.counts.reads.fetch_add(1, Ordering::Relaxed);
        self.inner.read(collection, id)
    }

    fn insert_new(&self, collection: &str, doc: Document) -> Result<()> {
        self.counts.inserts.fetch_add(1, Ordering::Relaxed);
        self.inner.insert_new(collection, doc)
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        self.counts.deletes.fetch_add(1, Ordering::Relaxed);
        self.inner.delete(collection, id)
    }

    fn delete_all(&self, collection: &str) -> Result<u64> {
        self.inner.delete_all(collection)
    }

    fn contains(&self, collection: &str, id: &str) -> Result<bool> {
        self.inner.contains(collection, id)
    }

    fn count(&self, collection: &str) -> Result<u64> {
        self.inner.count(collection)
    }

    fn read_all(&self, collection: &str) -> Result<Vec<Document>> {
        self.inner.read_all(collection)
    }

    fn read_ids(&self, collection: &str) -> Result<Vec<String>> {
        self.inner.read_ids(collection)
    }

    fn register_unique_index(&self, collection: &str, field: &str) -> Result<()> {
        self.inner.register_unique_index(collection, field)
    }

    fn find_id_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<String>> {
        self.inner.find_id_by_field(collection, field, value)
    }

    fn begin<'a>(&'a self, collection: &str) -> Result<Box<dyn BackendTransaction + 'a>> {
        self.counts.begins.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.begin(collection)?;
        Ok(Box::new(CountingTransaction {
            inner,
            counts: Arc::clone(&self.counts),
        }))
    }

    fn average_ping(&self) -> Duration {
        self.inner.average_ping()
    }
}

struct CountingTransaction<'a> {
    inner: Box<dyn BackendTransaction + 'a>,
    counts: Arc<OpCounts>,
}

impl BackendTransaction for CountingTransaction<'_> {
    fn read(&mut self, id: &str) -> Result<Option<Document>> {
        self.inner.read(id)
    }

    fn replace_if_match(
        &mut self,
        id: &str,
        expected_version: u64,
        doc: Document,
    ) -> Result<bool> {
        self.inner.replace_if_match(id, expected_version, doc)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.counts.commits.fetch_add(1, Ordering::Relaxed);
        self.inner.commit()
    }
}

/// A countdown of failures still to inject
struct FailPlan {
    remaining: AtomicU32,
    error: fn() -> Error,
}

impl FailPlan {
    fn new(error: fn() -> Error) -> Self {
        FailPlan {
            remaining: AtomicU32::new(0),
            error,
        }
    }

    fn arm(&self, count: u32) {
        self.remaining.store(count, Ordering::SeqCst);
    }

    fn fire(&self) -> Result<()> {
        let mut current = self.remaining.load(Ordering::SeqCst);
        while current > 0 {
            match self.remaining.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err((self.error)()),
                Err(observed) => current = observed,
            }
        }
        Ok(())
    }
}

fn transport_error() -> Error {
    Error::Transport("injected transport failure".to_string())
}

/// Injects scripted transport failures and write conflicts ahead of the
/// inner backend
pub struct FlakyBackend {
    inner: Arc<dyn DurableBackend>,
    read_failures: FailPlan,
    write_failures: FailPlan,
    conflicts: FailPlan,
}

impl FlakyBackend {
    /// Wrap `inner` with no failures armed
    pub fn new(inner: Arc<dyn DurableBackend>) -> Self {
        FlakyBackend {
            inner,
            read_failures: FailPlan::new(transport_error),
            write_failures: FailPlan::new(transport_error),
            conflicts: FailPlan::new(|| Error::WriteConflict),
        }
    }

    /// Fail the next `count` reads (including `contains`) with `Transport`
    pub fn fail_reads(&self, count: u32) {
        self.read_failures.arm(count);
    }

    /// Fail the next `count` writes (inserts, deletes, transaction opens)
    /// with `Transport`
    pub fn fail_writes(&self, count: u32) {
        self.write_failures.arm(count);
    }

    /// Report `WriteConflict` from the next `count` transactional
    /// replacements
    pub fn conflict_writes(&self, count: u32) {
        self.conflicts.arm(count);
    }
}

impl DurableBackend for FlakyBackend {
    fn read(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.read_failures.fire()?;
        self.inner.read(collection, id)
    }

    fn insert_new(&self, collection: &str, doc: Document) -> Result<()> {
        self.write_failures.fire()?;
        self.inner.insert_new(collection, doc)
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        self.write_failures.fire()?;
        self.inner.delete(collection, id)
    }

    fn delete_all(&self, collection: &str) -> Result<u64> {
        self.write_failures.fire()?;
        self.inner.delete_all(collection)
    }

    fn contains(&self, collection: &str, id: &str) -> Result<bool> {
        self.read_failures.fire()?;
        self.inner.contains(collection, id)
    }

    fn count(&self, collection: &str) -> Result<u64> {
        self.read_failures.fire()?;
        self.inner.count(collection)
    }

    fn read_all(&self, collection: &str) -> Result<Vec<Document>> {
        self.read_failures.fire()?;
        self.inner.read_all(collection)
    }

    fn read_ids(&self, collection: &str) -> Result<Vec<String>> {
        self.read_failures.fire()?;
        self.inner.read_ids(collection)
    }

    fn register_unique_index(&self, collection: &str, field: &str) -> Result<()> {
        self.inner.register_unique_index(collection, field)
    }

    fn find_id_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<String>> {
        self.read_failures.fire()?;
        self.inner.find_id_by_field(collection, field, value)
    }

    fn begin<'a>(&'a self, collection: &str) -> Result<Box<dyn BackendTransaction + 'a>> {
        self.write_failures.fire()?;
        let inner = self.inner.begin(collection)?;
        Ok(Box::new(FlakyTransaction {
            inner,
            conflicts: &self.conflicts,
        }))
    }

    fn average_ping(&self) -> Duration {
        self.inner.average_ping()
    }
}

struct FlakyTransaction<'a> {
    inner: Box<dyn BackendTransaction + 'a>,
    conflicts: &'a FailPlan,
}

impl BackendTransaction for FlakyTransaction<'_> {
    fn read(&mut self, id: &str) -> Result<Option<Document>> {
        self.inner.read(id)
    }

    fn replace_if_match(
        &mut self,
        id: &str,
        expected_version: u64,
        doc: Document,
    ) -> Result<bool> {
        self.conflicts.fire()?;
        self.inner.replace_if_match(id, expected_version, doc)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit()
    }
}

/// Forces optimistic-concurrency misses by bumping the stored version of a
/// target document out from under the caller.
///
/// Each time a transaction opens on the target collection while losses
/// remain, the stored document's version is advanced through a separate
/// committed transaction first. A caller whose expected version predates
/// the bump then misses its compare-and-swap and must retry.
pub struct ContentiousBackend {
    inner: Arc<dyn DurableBackend>,
    target_collection: String,
    target_id: String,
    losses: AtomicU32,
}

impl ContentiousBackend {
    /// Wrap `inner`, targeting one document for `losses` forced misses
    pub fn new(
        inner: Arc<dyn DurableBackend>,
        collection: impl Into<String>,
        id: impl Into<String>,
        losses: u32,
    ) -> Self {
        ContentiousBackend {
            inner,
            target_collection: collection.into(),
            target_id: id.into(),
            losses: AtomicU32::new(losses),
        }
    }

    /// Forced misses not yet consumed
    pub fn remaining_losses(&self) -> u32 {
        self.losses.load(Ordering::SeqCst)
    }

    fn take_loss(&self) -> bool {
        let mut current = self.losses.load(Ordering::SeqCst);
        while current > 0 {
            match self.losses.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }

    fn bump_target(&self) -> Result<()> {
        let mut txn = self.inner.begin(&self.target_collection)?;
        if let Some(mut doc) = txn.read(&self.target_id)? {
            let version = doc_version(&doc)?;
            doc.insert(
                "version".to_string(),
                Value::from(version + 1),
            );
            txn.replace_if_match(&self.target_id, version, doc)?;
            txn.commit()?;
        }
        Ok(())
    }
}

impl DurableBackend for ContentiousBackend {
    fn read(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.inner.read(collection, id)
    }

    fn insert_new(&self, collection: &str, doc: Document) -> Result<()> {
        self.inner.insert_new(collection, doc)
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        self.inner.delete(collection, id)
    }

    fn delete_all(&self, collection: &str) -> Result<u64> {
        self.inner.delete_all(collection)
    }

    fn contains(&self, collection: &str, id: &str) -> Result<bool> {
        self.inner.contains(collection, id)
    }

    fn count(&self, collection: &str) -> Result<u64> {
        self.inner.count(collection)
    }

    fn read_all(&self, collection: &str) -> Result<Vec<Document>> {
        self.inner.read_all(collection)
    }

    fn read_ids(&self, collection: &str) -> Result<Vec<String>> {
        self.inner.read_ids(collection)
    }

    fn register_unique_index(&self, collection: &str, field: &str) -> Result<()> {
        self.inner.register_unique_index(collection, field)
    }

    fn find_id_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<String>> {
        self.inner.find_id_by_field(collection, field, value)
    }

    fn begin<'a>(&'a self, collection: &str) -> Result<Box<dyn BackendTransaction + 'a>> {
        // The bump runs in its own committed transaction before the
        // caller's transaction opens, so the writer gate is never held
        // twice at once.
        if collection == self.target_collection && self.take_loss() {
            self.bump_target()?;
        }
        self.inner.begin(collection)
    }

    fn average_ping(&self) -> Duration {
        self.inner.average_ping()
    }
}
