//! Typed view of one durable collection
//!
//! [`DatabaseStore`] wraps a backend and a collection name with the record
//! type, handling the document codec at the boundary. Records coming out
//! of the durable tier are initialized and flipped read-only before anyone
//! sees them; mutation happens only through the update engine.

use crate::backend::DurableBackend;
use crate::document::{from_document, to_document};
use std::marker::PhantomData;
use std::sync::Arc;
use tierdb_core::{Record, Result, StoreKey};

/// Record-typed adapter over a [`DurableBackend`] collection
pub struct DatabaseStore<X: Record> {
    collection: String,
    backend: Arc<dyn DurableBackend>,
    _record: PhantomData<fn() -> X>,
}

impl<X: Record> DatabaseStore<X> {
    /// Bind `collection` on `backend` to the record type `X`
    pub fn new(collection: impl Into<String>, backend: Arc<dyn DurableBackend>) -> Self {
        DatabaseStore {
            collection: collection.into(),
            backend,
            _record: PhantomData,
        }
    }

    /// The underlying backend
    pub fn backend(&self) -> &Arc<dyn DurableBackend> {
        &self.backend
    }

    /// The durable collection name
    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// Read a record by key. The result is initialized and read-only.
    pub fn read(&self, key: &X::Key) -> Result<Option<Arc<X>>> {
        let doc = self.backend.read(&self.collection, &key.to_key_string())?;
        match doc {
            Some(doc) => {
                let record: X = from_document(&doc)?;
                record.set_read_only(true);
                Ok(Some(Arc::new(record)))
            }
            None => Ok(None),
        }
    }

    /// Insert a record whose key must not already exist durably
    pub fn save_new(&self, record: &X) -> Result<()> {
        let doc = to_document(record)?;
        self.backend.insert_new(&self.collection, doc)
    }

    /// Whether a record with this key exists durably
    pub fn has(&self, key: &X::Key) -> Result<bool> {
        self.backend.contains(&self.collection, &key.to_key_string())
    }

    /// Delete the record with this key, reporting whether it existed
    pub fn delete(&self, key: &X::Key) -> Result<bool> {
        self.backend.delete(&self.collection, &key.to_key_string())
    }

    /// Delete every record in the collection, returning the count removed
    pub fn delete_all(&self) -> Result<u64> {
        self.backend.delete_all(&self.collection)
    }

    /// Number of durable records in the collection
    pub fn size(&self) -> Result<u64> {
        self.backend.count(&self.collection)
    }

    /// Snapshot of every durable key
    pub fn read_keys(&self) -> Result<Vec<X::Key>> {
        let ids = self.backend.read_ids(&self.collection)?;
        ids.iter().map(|id| X::Key::from_key_string(id)).collect()
    }

    /// Snapshot of every durable record, each initialized and read-only
    pub fn read_all(&self) -> Result<Vec<Arc<X>>> {
        let docs = self.backend.read_all(&self.collection)?;
        docs.iter()
            .map(|doc| {
                let record: X = from_document(doc)?;
                record.set_read_only(true);
                Ok(Arc::new(record))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use serde::{Deserialize, Serialize};
    use tierdb_core::{Error, FieldRef, RecordMeta, RequiredCell};
    use uuid::Uuid;

    #[derive(Clone, Default, Serialize, Deserialize)]
    struct Token {
        #[serde(flatten)]
        meta: RecordMeta<Uuid>,
        scope: RequiredCell<String>,
    }

    impl Record for Token {
        type Key = Uuid;
        fn meta(&self) -> &RecordMeta<Uuid> {
            &self.meta
        }
        fn custom_fields(&self) -> Vec<FieldRef<'_>> {
            vec![FieldRef::new("scope", &self.scope)]
        }
    }

    fn store() -> DatabaseStore<Token> {
        DatabaseStore::new("tokens", Arc::new(MemoryBackend::new()))
    }

    fn token(key: Uuid, scope: &str) -> Token {
        let t = Token::default();
        t.initialize().unwrap();
        t.meta.id_cell().set(key).unwrap();
        t.scope.set(scope.to_string()).unwrap();
        t
    }

    #[test]
    fn test_save_new_then_read() {
        let store = store();
        let key = Uuid::new_v4();
        store.save_new(&token(key, "admin")).unwrap();

        let read = store.read(&key).unwrap().unwrap();
        assert_eq!(read.key().unwrap(), key);
        assert_eq!(read.scope.get().unwrap(), "admin");
        // Durable reads come back read-only
        assert!(read.is_read_only());
        assert!(read.scope.set("other".to_string()).is_err());
    }

    #[test]
    fn test_save_new_duplicate_rejected() {
        let store = store();
        let key = Uuid::new_v4();
        store.save_new(&token(key, "a")).unwrap();
        let err = store.save_new(&token(key, "b")).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
    }

    #[test]
    fn test_has_delete_size() {
        let store = store();
        let key = Uuid::new_v4();
        assert!(!store.has(&key).unwrap());
        store.save_new(&token(key, "a")).unwrap();
        assert!(store.has(&key).unwrap());
        assert_eq!(store.size().unwrap(), 1);
        assert!(store.delete(&key).unwrap());
        assert!(!store.delete(&key).unwrap());
        assert_eq!(store.size().unwrap(), 0);
    }

    #[test]
    fn test_read_keys_round_trip_typed() {
        let store = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.save_new(&token(a, "x")).unwrap();
        store.save_new(&token(b, "y")).unwrap();

        let mut keys = store.read_keys().unwrap();
        keys.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_read_all_initialized() {
        let store = store();
        store.save_new(&token(Uuid::new_v4(), "x")).unwrap();
        store.save_new(&token(Uuid::new_v4(), "y")).unwrap();

        let all = store.read_all().unwrap();
        assert_eq!(all.len(), 2);
        for record in all {
            assert!(record.is_read_only());
            record.scope.get().unwrap();
        }
    }
}
