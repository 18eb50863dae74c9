//! Durable backend abstraction
//!
//! The storage layer talks to the durable tier through [`DurableBackend`],
//! a document-level interface. Backends deal only in wire documents; the
//! typed view lives in [`crate::adapter::DatabaseStore`].
//!
//! Compare-and-swap writes flow through [`BackendTransaction`]: the update
//! engine opens a transaction, reads the current document, and replaces it
//! only if the stored version still matches. A dropped transaction aborts.

use crate::document::Document;
use std::time::Duration;
use tierdb_core::Result;

/// One optimistic write attempt against a single collection.
///
/// Reads within the transaction observe staged writes. Nothing becomes
/// visible to other readers until [`commit`](BackendTransaction::commit);
/// dropping the transaction without committing discards all staged work.
pub trait BackendTransaction: Send {
    /// Read a document by id, observing writes staged in this transaction
    fn read(&mut self, id: &str) -> Result<Option<Document>>;

    /// Stage a replacement of the document with `id`, but only if its
    /// stored version is exactly `expected_version`.
    ///
    /// Returns `false` on a version mismatch (the optimistic-concurrency
    /// miss the update engine retries on) and `true` when the replacement
    /// was staged.
    ///
    /// # Errors
    ///
    /// `Transport` on connectivity failure, `WriteConflict` on a low-level
    /// conflict the backend reports without a version check,
    /// `IndexViolation` if the staged document would break a unique index.
    fn replace_if_match(
        &mut self,
        id: &str,
        expected_version: u64,
        doc: Document,
    ) -> Result<bool>;

    /// Atomically apply everything staged in this transaction
    ///
    /// # Errors
    ///
    /// `Transport` on connectivity failure; `WriteConflict` if the backend
    /// detects a conflicting concurrent commit.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// A durable document store holding one keyspace per collection name.
///
/// All methods are callable from any thread. Collections spring into
/// existence on first use; an unknown collection behaves as empty.
pub trait DurableBackend: Send + Sync {
    /// Read a committed document by id
    fn read(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Insert a document that must not already exist.
    ///
    /// # Errors
    ///
    /// `DuplicateKey` if the id is already present, `IndexViolation` if a
    /// unique index would be broken, `Transport` on connectivity failure.
    fn insert_new(&self, collection: &str, doc: Document) -> Result<()>;

    /// Delete a document by id, reporting whether it existed
    fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Delete every document in the collection, returning the count removed
    fn delete_all(&self, collection: &str) -> Result<u64>;

    /// Whether a document with this id exists
    fn contains(&self, collection: &str, id: &str) -> Result<bool>;

    /// Number of documents in the collection
    fn count(&self, collection: &str) -> Result<u64>;

    /// Snapshot of every document in the collection
    fn read_all(&self, collection: &str) -> Result<Vec<Document>>;

    /// Snapshot of every document id in the collection
    fn read_ids(&self, collection: &str) -> Result<Vec<String>>;

    /// Declare `field` unique within the collection.
    ///
    /// # Errors
    ///
    /// `IndexViolation` if existing documents already collide on `field`.
    fn register_unique_index(&self, collection: &str, field: &str) -> Result<()>;

    /// Find the id of the document whose `field` equals `value`, if any
    fn find_id_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<Option<String>>;

    /// Open a compare-and-swap transaction on the collection
    fn begin<'a>(&'a self, collection: &str) -> Result<Box<dyn BackendTransaction + 'a>>;

    /// Rolling estimate of the round-trip time to the durable store.
    ///
    /// The update engine derives its retry backoff from this.
    fn average_ping(&self) -> Duration;
}
