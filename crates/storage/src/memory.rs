//! In-process durable backend
//!
//! [`MemoryBackend`] implements the full backend contract against process
//! memory, including version-checked transactional replacement and unique
//! indexes. It is the default backend for tests and single-process use,
//! and doubles as the reference semantics for remote backends.

use crate::backend::{BackendTransaction, DurableBackend};
use crate::document::{doc_id, doc_version, Document};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierdb_core::{Error, Result};

/// Exclusive writer lock for a collection.
///
/// A plain mutex guard cannot live inside a transaction that also owns the
/// `Arc` it borrows from, so the gate is locked and released explicitly.
struct WriterGate {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl WriterGate {
    fn new() -> Self {
        WriterGate {
            locked: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.cv.wait(&mut locked);
        }
        *locked = true;
    }

    fn release(&self) {
        let mut locked = self.locked.lock();
        *locked = false;
        self.cv.notify_one();
    }
}

struct CollectionData {
    docs: RwLock<FxHashMap<String, Document>>,
    writer: WriterGate,
    unique_indexes: RwLock<Vec<String>>,
}

impl CollectionData {
    fn new() -> Self {
        CollectionData {
            docs: RwLock::new(FxHashMap::default()),
            writer: WriterGate::new(),
            unique_indexes: RwLock::new(Vec::new()),
        }
    }

    /// Name of the first unique index `doc` would violate, ignoring the
    /// document stored under `skip_id`. Null field values never collide.
    fn unique_conflict(
        &self,
        docs: &FxHashMap<String, Document>,
        doc: &Document,
        skip_id: &str,
    ) -> Option<String> {
        let indexes = self.unique_indexes.read();
        for field in indexes.iter() {
            let value = match doc.get(field) {
                Some(v) if !v.is_null() => v,
                _ => continue,
            };
            for (other_id, other) in docs.iter() {
                if other_id == skip_id {
                    continue;
                }
                if other.get(field) == Some(value) {
                    return Some(field.clone());
                }
            }
        }
        None
    }
}

/// Rolling round-trip estimate, smoothed exponentially
struct PingTracker {
    nanos: AtomicU64,
}

impl PingTracker {
    fn new(initial: Duration) -> Self {
        PingTracker {
            nanos: AtomicU64::new(initial.as_nanos() as u64),
        }
    }

    fn observe(&self, sample: Duration) {
        let sample = sample.as_nanos() as u64;
        let current = self.nanos.load(Ordering::Relaxed);
        // EWMA with alpha = 1/8
        let next = current - current / 8 + sample / 8;
        self.nanos.store(next, Ordering::Relaxed);
    }

    fn average(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }
}

/// In-process implementation of [`DurableBackend`]
pub struct MemoryBackend {
    collections: DashMap<String, Arc<CollectionData>>,
    ping: Arc<PingTracker>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend with a 1ms synthetic round-trip estimate
    pub fn new() -> Self {
        MemoryBackend {
            collections: DashMap::new(),
            ping: Arc::new(PingTracker::new(Duration::from_millis(1))),
        }
    }

    fn data(&self, collection: &str) -> Arc<CollectionData> {
        self.collections
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(CollectionData::new()))
            .clone()
    }
}

impl DurableBackend for MemoryBackend {
    fn read(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let data = self.data(collection);
        let docs = data.docs.read();
        Ok(docs.get(id).cloned())
    }

    fn insert_new(&self, collection: &str, doc: Document) -> Result<()> {
        let id = doc_id(&doc)?.to_string();
        doc_version(&doc)?;
        let data = self.data(collection);
        data.writer.acquire();
        let result = (|| {
            let mut docs = data.docs.write();
            if docs.contains_key(&id) {
                return Err(Error::DuplicateKey {
                    collection: collection.to_string(),
                    key: id.clone(),
                });
            }
            if let Some(index) = data.unique_conflict(&docs, &doc, &id) {
                return Err(Error::IndexViolation {
                    collection: collection.to_string(),
                    index,
                });
            }
            docs.insert(id.clone(), doc);
            Ok(())
        })();
        data.writer.release();
        result
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let data = self.data(collection);
        data.writer.acquire();
        let removed = data.docs.write().remove(id).is_some();
        data.writer.release();
        Ok(removed)
    }

    fn delete_all(&self, collection: &str) -> Result<u64> {
        let data = self.data(collection);
        data.writer.acquire();
        let mut docs = data.docs.write();
        let count = docs.len() as u64;
        docs.clear();
        drop(docs);
        data.writer.release();
        Ok(count)
    }

    fn contains(&self, collection: &str, id: &str) -> Result<bool> {
        let data = self.data(collection);
        let present = data.docs.read().contains_key(id);
        Ok(present)
    }

    fn count(&self, collection: &str) -> Result<u64> {
        let data = self.data(collection);
        let count = data.docs.read().len() as u64;
        Ok(count)
    }

    fn read_all(&self, collection: &str) -> Result<Vec<Document>> {
        let data = self.data(collection);
        let all: Vec<Document> = data.docs.read().values().cloned().collect();
        Ok(all)
    }

    fn read_ids(&self, collection: &str) -> Result<Vec<String>> {
        let data = self.data(collection);
        let ids: Vec<String> = data.docs.read().keys().cloned().collect();
        Ok(ids)
    }

    fn register_unique_index(&self, collection: &str, field: &str) -> Result<()> {
        let data = self.data(collection);
        data.writer.acquire();
        let result = (|| {
            {
                let docs = data.docs.read();
                let mut seen: Vec<&Value> = Vec::new();
                for doc in docs.values() {
                    let value = match doc.get(field) {
                        Some(v) if !v.is_null() => v,
                        _ => continue,
                    };
                    if seen.contains(&value) {
                        return Err(Error::IndexViolation {
                            collection: collection.to_string(),
                            index: field.to_string(),
                        });
                    }
                    seen.push(value);
                }
            }
            let mut indexes = data.unique_indexes.write();
            if !indexes.iter().any(|f| f == field) {
                indexes.push(field.to_string());
            }
            Ok(())
        })();
        data.writer.release();
        result
    }

    fn find_id_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<String>> {
        let data = self.data(collection);
        let docs = data.docs.read();
        Ok(docs
            .iter()
            .find(|(_, doc)| doc.get(field) == Some(value))
            .map(|(id, _)| id.clone()))
    }

    fn begin<'a>(&'a self, collection: &str) -> Result<Box<dyn BackendTransaction + 'a>> {
        let data = self.data(collection);
        data.writer.acquire();
        Ok(Box::new(MemTransaction {
            collection: collection.to_string(),
            data,
            staged: None,
            finished: false,
            started: Instant::now(),
            ping: Arc::clone(&self.ping),
        }))
    }

    fn average_ping(&self) -> Duration {
        self.ping.average()
    }
}

/// A writer-exclusive transaction over one in-memory collection
struct MemTransaction {
    collection: String,
    data: Arc<CollectionData>,
    staged: Option<(String, Document)>,
    finished: bool,
    started: Instant,
    ping: Arc<PingTracker>,
}

impl BackendTransaction for MemTransaction {
    fn read(&mut self, id: &str) -> Result<Option<Document>> {
        if let Some((staged_id, staged_doc)) = &self.staged {
            if staged_id == id {
                return Ok(Some(staged_doc.clone()));
            }
        }
        Ok(self.data.docs.read().get(id).cloned())
    }

    fn replace_if_match(
        &mut self,
        id: &str,
        expected_version: u64,
        doc: Document,
    ) -> Result<bool> {
        if doc_id(&doc)? != id {
            return Err(Error::Serialization(format!(
                "document '_id' does not match target id '{id}'"
            )));
        }
        let current = self.read(id)?;
        let stored_version = match current {
            Some(current) => doc_version(&current)?,
            None => return Ok(false),
        };
        if stored_version != expected_version {
            return Ok(false);
        }
        let docs = self.data.docs.read();
        if let Some(index) = self.data.unique_conflict(&docs, &doc, id) {
            return Err(Error::IndexViolation {
                collection: self.collection.clone(),
                index,
            });
        }
        drop(docs);
        self.staged = Some((id.to_string(), doc));
        Ok(true)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        if let Some((id, doc)) = self.staged.take() {
            self.data.docs.write().insert(id, doc);
        }
        self.finished = true;
        self.data.writer.release();
        self.ping.observe(self.started.elapsed());
        Ok(())
    }
}

impl Drop for MemTransaction {
    fn drop(&mut self) {
        // Aborted: staged work is discarded, the writer gate must open
        if !self.finished {
            self.staged = None;
            self.data.writer.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, version: u64, extra: &[(&str, Value)]) -> Document {
        let mut doc = Document::new();
        doc.insert("_id".to_string(), json!(id));
        doc.insert("version".to_string(), json!(version));
        for (k, v) in extra {
            doc.insert(k.to_string(), v.clone());
        }
        doc
    }

    #[test]
    fn test_insert_and_read() {
        let backend = MemoryBackend::new();
        backend.insert_new("users", doc("a", 0, &[])).unwrap();
        let read = backend.read("users", "a").unwrap().unwrap();
        assert_eq!(doc_version(&read).unwrap(), 0);
        assert!(backend.read("users", "missing").unwrap().is_none());
        assert!(backend.read("other", "a").unwrap().is_none());
    }

    #[test]
    fn test_insert_duplicate_rejected() {
        let backend = MemoryBackend::new();
        backend.insert_new("users", doc("a", 0, &[])).unwrap();
        let err = backend.insert_new("users", doc("a", 0, &[])).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
    }

    #[test]
    fn test_read_only_queries() {
        let backend = MemoryBackend::new();
        backend.insert_new("users", doc("a", 0, &[])).unwrap();
        backend.insert_new("users", doc("b", 3, &[])).unwrap();
        assert!(backend.contains("users", "a").unwrap());
        assert!(!backend.contains("users", "missing").unwrap());
        assert_eq!(backend.count("users").unwrap(), 2);
        let all = backend.read_all("users").unwrap();
        assert_eq!(all.len(), 2);
        let mut ids = backend.read_ids("users").unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_delete_and_count() {
        let backend = MemoryBackend::new();
        backend.insert_new("users", doc("a", 0, &[])).unwrap();
        backend.insert_new("users", doc("b", 0, &[])).unwrap();
        assert_eq!(backend.count("users").unwrap(), 2);
        assert!(backend.delete("users", "a").unwrap());
        assert!(!backend.delete("users", "a").unwrap());
        assert_eq!(backend.count("users").unwrap(), 1);
        assert_eq!(backend.delete_all("users").unwrap(), 1);
        assert_eq!(backend.count("users").unwrap(), 0);
    }

    #[test]
    fn test_transaction_version_match_commits() {
        let backend = MemoryBackend::new();
        backend.insert_new("users", doc("a", 3, &[])).unwrap();

        let mut txn = backend.begin("users").unwrap();
        let current = txn.read("a").unwrap().unwrap();
        assert_eq!(doc_version(&current).unwrap(), 3);
        assert!(txn.replace_if_match("a", 3, doc("a", 4, &[])).unwrap());
        txn.commit().unwrap();

        let read = backend.read("users", "a").unwrap().unwrap();
        assert_eq!(doc_version(&read).unwrap(), 4);
    }

    #[test]
    fn test_transaction_version_mismatch() {
        let backend = MemoryBackend::new();
        backend.insert_new("users", doc("a", 5, &[])).unwrap();

        let mut txn = backend.begin("users").unwrap();
        assert!(!txn.replace_if_match("a", 4, doc("a", 5, &[])).unwrap());
        txn.commit().unwrap();

        let read = backend.read("users", "a").unwrap().unwrap();
        assert_eq!(doc_version(&read).unwrap(), 5);
    }

    #[test]
    fn test_transaction_abort_on_drop() {
        let backend = MemoryBackend::new();
        backend.insert_new("users", doc("a", 0, &[])).unwrap();

        {
            let mut txn = backend.begin("users").unwrap();
            assert!(txn.replace_if_match("a", 0, doc("a", 1, &[])).unwrap());
            // dropped without commit
        }

        let read = backend.read("users", "a").unwrap().unwrap();
        assert_eq!(doc_version(&read).unwrap(), 0);

        // The writer gate reopened; a fresh transaction proceeds
        let mut txn = backend.begin("users").unwrap();
        assert!(txn.replace_if_match("a", 0, doc("a", 1, &[])).unwrap());
        txn.commit().unwrap();
    }

    #[test]
    fn test_transaction_reads_staged_write() {
        let backend = MemoryBackend::new();
        backend.insert_new("users", doc("a", 0, &[])).unwrap();

        let mut txn = backend.begin("users").unwrap();
        assert!(txn.replace_if_match("a", 0, doc("a", 1, &[])).unwrap());
        let staged = txn.read("a").unwrap().unwrap();
        assert_eq!(doc_version(&staged).unwrap(), 1);
        drop(txn);
    }

    #[test]
    fn test_replace_missing_document_is_mismatch() {
        let backend = MemoryBackend::new();
        let mut txn = backend.begin("users").unwrap();
        assert!(!txn.replace_if_match("ghost", 0, doc("ghost", 1, &[])).unwrap());
        txn.commit().unwrap();
    }

    #[test]
    fn test_unique_index_enforced_on_insert() {
        let backend = MemoryBackend::new();
        backend.register_unique_index("users", "username").unwrap();
        backend
            .insert_new("users", doc("a", 0, &[("username", json!("kaz"))]))
            .unwrap();
        let err = backend
            .insert_new("users", doc("b", 0, &[("username", json!("kaz"))]))
            .unwrap_err();
        assert!(matches!(err, Error::IndexViolation { .. }));
        // Null values never collide
        backend
            .insert_new("users", doc("c", 0, &[("username", Value::Null)]))
            .unwrap();
        backend
            .insert_new("users", doc("d", 0, &[("username", Value::Null)]))
            .unwrap();
    }

    #[test]
    fn test_unique_index_enforced_on_replace() {
        let backend = MemoryBackend::new();
        backend.register_unique_index("users", "username").unwrap();
        backend
            .insert_new("users", doc("a", 0, &[("username", json!("kaz"))]))
            .unwrap();
        backend
            .insert_new("users", doc("b", 0, &[("username", json!("jam"))]))
            .unwrap();

        let mut txn = backend.begin("users").unwrap();
        let err = txn
            .replace_if_match("b", 0, doc("b", 1, &[("username", json!("kaz"))]))
            .unwrap_err();
        assert!(matches!(err, Error::IndexViolation { .. }));
        drop(txn);

        // Replacing a document with itself under the same indexed value is fine
        let mut txn = backend.begin("users").unwrap();
        assert!(txn
            .replace_if_match("a", 0, doc("a", 1, &[("username", json!("kaz"))]))
            .unwrap());
        txn.commit().unwrap();
    }

    #[test]
    fn test_register_unique_index_rejects_existing_collisions() {
        let backend = MemoryBackend::new();
        backend
            .insert_new("users", doc("a", 0, &[("username", json!("kaz"))]))
            .unwrap();
        backend
            .insert_new("users", doc("b", 0, &[("username", json!("kaz"))]))
            .unwrap();
        let err = backend.register_unique_index("users", "username").unwrap_err();
        assert!(matches!(err, Error::IndexViolation { .. }));
    }

    #[test]
    fn test_find_id_by_field() {
        let backend = MemoryBackend::new();
        backend
            .insert_new("users", doc("a", 0, &[("username", json!("kaz"))]))
            .unwrap();
        assert_eq!(
            backend
                .find_id_by_field("users", "username", &json!("kaz"))
                .unwrap(),
            Some("a".to_string())
        );
        assert_eq!(
            backend
                .find_id_by_field("users", "username", &json!("nobody"))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_ping_estimate_moves_with_samples() {
        let backend = MemoryBackend::new();
        let initial = backend.average_ping();
        backend.ping.observe(Duration::from_millis(100));
        assert!(backend.average_ping() > initial);
    }
}
