//! In-process record cache
//!
//! One [`LocalStore`] per collection holds the authoritative in-memory
//! copies that callers share. Records are stored behind `Arc`; the cache
//! never clones record state, so a reconciled record is immediately
//! current for every holder.

use dashmap::DashMap;
use std::sync::Arc;
use tierdb_core::{Error, Record, Result, StoreKey};
use tracing::warn;

/// Thread-safe key → record cache
pub struct LocalStore<X: Record> {
    map: DashMap<X::Key, Arc<X>>,
}

impl<X: Record> Default for LocalStore<X> {
    fn default() -> Self {
        Self::new()
    }
}

impl<X: Record> LocalStore<X> {
    /// Create an empty cache
    pub fn new() -> Self {
        LocalStore {
            map: DashMap::new(),
        }
    }

    /// The cached record for `key`, if present
    pub fn get(&self, key: &X::Key) -> Option<Arc<X>> {
        self.map.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Cache `record` under its own key, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// `ContractViolation` if the record has been invalidated; key access
    /// errors if the record is unbound or keyless.
    pub fn save(&self, record: Arc<X>) -> Result<()> {
        if !record.is_valid() {
            warn!("refusing to cache an invalidated record");
            return Err(Error::ContractViolation(
                "cannot cache an invalidated record".to_string(),
            ));
        }
        let key = record.key()?;
        self.map.insert(key, record);
        Ok(())
    }

    /// Whether `key` is cached
    pub fn has(&self, key: &X::Key) -> bool {
        self.map.contains_key(key)
    }

    /// Drop the entry for `key`, invalidating the removed record so stale
    /// holders cannot write through it. Returns whether an entry existed.
    pub fn remove(&self, key: &X::Key) -> bool {
        match self.map.remove(key) {
            Some((_, record)) => {
                record.invalidate();
                true
            }
            None => false,
        }
    }

    /// Snapshot of every cached key
    pub fn keys(&self) -> Vec<X::Key> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of up to `limit` cached keys in canonical string form
    pub fn key_strings(&self, limit: usize) -> Vec<String> {
        self.map
            .iter()
            .take(limit)
            .map(|entry| entry.key().to_key_string())
            .collect()
    }

    /// Snapshot of every cached record
    pub fn values(&self) -> Vec<Arc<X>> {
        self.map
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Drop every entry, invalidating all removed records. Returns the
    /// number of entries removed.
    pub fn clear(&self) -> usize {
        let keys = self.keys();
        let mut removed = 0;
        for key in keys {
            if self.remove(&key) {
                removed += 1;
            }
        }
        removed
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tierdb_core::{FieldRef, RecordMeta, RequiredCell};

    #[derive(Clone, Default, Serialize, Deserialize)]
    struct Session {
        #[serde(flatten)]
        meta: RecordMeta<String>,
        hits: RequiredCell<u64>,
    }

    impl Record for Session {
        type Key = String;
        fn meta(&self) -> &RecordMeta<String> {
            &self.meta
        }
        fn custom_fields(&self) -> Vec<FieldRef<'_>> {
            vec![FieldRef::new("hits", &self.hits)]
        }
    }

    fn session(key: &str) -> Arc<Session> {
        let s = Session::default();
        s.initialize().unwrap();
        s.meta.id_cell().set(key.to_string()).unwrap();
        Arc::new(s)
    }

    #[test]
    fn test_save_and_get_share_one_instance() {
        let store: LocalStore<Session> = LocalStore::new();
        let s = session("a");
        store.save(Arc::clone(&s)).unwrap();

        let cached = store.get(&"a".to_string()).unwrap();
        assert!(Arc::ptr_eq(&s, &cached));
        assert!(store.has(&"a".to_string()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_invalidates() {
        let store: LocalStore<Session> = LocalStore::new();
        let s = session("a");
        store.save(Arc::clone(&s)).unwrap();

        assert!(store.remove(&"a".to_string()));
        assert!(!s.is_valid());
        assert!(!store.remove(&"a".to_string()));
        assert!(store.get(&"a".to_string()).is_none());
    }

    #[test]
    fn test_invalidated_record_not_cacheable() {
        let store: LocalStore<Session> = LocalStore::new();
        let s = session("a");
        s.invalidate();
        assert!(store.save(s).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let store: LocalStore<Session> = LocalStore::new();
        let a = session("a");
        let b = session("b");
        store.save(Arc::clone(&a)).unwrap();
        store.save(Arc::clone(&b)).unwrap();

        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
        assert!(!a.is_valid());
        assert!(!b.is_valid());
    }

    #[test]
    fn test_key_strings_respects_limit() {
        let store: LocalStore<Session> = LocalStore::new();
        for k in ["a", "b", "c"] {
            store.save(session(k)).unwrap();
        }
        assert_eq!(store.key_strings(2).len(), 2);
        assert_eq!(store.key_strings(10).len(), 3);
    }
}
