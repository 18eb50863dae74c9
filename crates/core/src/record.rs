//! Versioned, keyed, field-structured records
//!
//! A record type declares its custom fields explicitly through a pure
//! accessor ([`Record::custom_fields`]); there is no runtime field
//! discovery. The built-in `_id` and `version` cells live in
//! [`RecordMeta`], which record structs embed with `#[serde(flatten)]` so
//! that the serialized form is exactly the wire document of the durable
//! tier.
//!
//! Records are cloned for working copies and deserialized from documents;
//! in both cases the cells come back unbound and [`Record::initialize`]
//! must run before any field access.

use crate::error::{Error, Result};
use crate::field::{FieldSlot, KeyCell, RecordState, RequiredCell};
use crate::key::StoreKey;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Wire name of the primary-key field
pub const ID_FIELD: &str = "_id";
/// Wire name of the optimistic-versioning field
pub const VERSION_FIELD: &str = "version";

/// A named reference to one of a record's field cells
pub struct FieldRef<'a> {
    /// Declared field name (also the wire name)
    pub name: &'static str,
    /// The cell itself
    pub slot: &'a dyn FieldSlot,
}

impl<'a> FieldRef<'a> {
    /// Pair a declared name with its cell
    pub fn new(name: &'static str, slot: &'a dyn FieldSlot) -> Self {
        FieldRef { name, slot }
    }
}

/// Built-in record metadata: the `_id` and `version` cells plus the shared
/// lifecycle state that gates every cell of the record.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordMeta<K: StoreKey> {
    #[serde(rename = "_id")]
    id: KeyCell<K>,
    #[serde(rename = "version")]
    version: RequiredCell<u64>,
    #[serde(skip)]
    state: Arc<RecordState>,
}

impl<K: StoreKey> RecordMeta<K> {
    /// The primary-key cell
    pub fn id_cell(&self) -> &KeyCell<K> {
        &self.id
    }

    /// The version cell
    pub fn version_cell(&self) -> &RequiredCell<u64> {
        &self.version
    }

    /// The lifecycle state shared with every cell of this record
    pub fn state(&self) -> &Arc<RecordState> {
        &self.state
    }
}

impl<K: StoreKey> Default for RecordMeta<K> {
    fn default() -> Self {
        RecordMeta {
            id: KeyCell::unset(),
            version: RequiredCell::new(0),
            state: Arc::new(RecordState::new()),
        }
    }
}

impl<K: StoreKey> Clone for RecordMeta<K> {
    fn clone(&self) -> Self {
        // A cloned record gets fresh, writable lifecycle state; sharing the
        // source's state would let a working copy flip the original's gate.
        RecordMeta {
            id: self.id.clone(),
            version: self.version.clone(),
            state: Arc::new(RecordState::new()),
        }
    }
}

impl<K: StoreKey> PartialEq for RecordMeta<K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.version == other.version
    }
}

/// A versioned, keyed value managed by a collection.
///
/// The key and the declared field names never change after construction.
/// The version starts at 0 and is advanced only by the update engine as it
/// reconciles the record with the durable store.
pub trait Record: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The key type identifying records of this shape
    type Key: StoreKey;

    /// The built-in `_id`/`version` cells and lifecycle state
    fn meta(&self) -> &RecordMeta<Self::Key>;

    /// Pure enumeration of the user-declared fields, in declaration order
    fn custom_fields(&self) -> Vec<FieldRef<'_>>;

    /// All fields: built-ins first, then the declared custom fields
    fn fields(&self) -> Vec<FieldRef<'_>> {
        let meta = self.meta();
        let mut all = vec![
            FieldRef::new(ID_FIELD, meta.id_cell()),
            FieldRef::new(VERSION_FIELD, meta.version_cell()),
        ];
        all.extend(self.custom_fields());
        all
    }

    /// Name → cell map over all fields, rejecting duplicate names
    ///
    /// # Errors
    ///
    /// `ContractViolation` if two fields share a declared name.
    fn field_map(&self) -> Result<FxHashMap<&'static str, &dyn FieldSlot>> {
        let fields = self.fields();
        let mut map = FxHashMap::with_capacity_and_hasher(fields.len(), Default::default());
        for field in fields {
            if map.insert(field.name, field.slot).is_some() {
                return Err(Error::ContractViolation(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
        }
        Ok(map)
    }

    /// Bind every cell to this record's lifecycle state.
    ///
    /// Must be called after construction, cloning, or deserialization and
    /// before any field access. Idempotent.
    ///
    /// # Errors
    ///
    /// `ContractViolation` if the declared field names collide.
    fn initialize(&self) -> Result<()> {
        // field_map() doubles as duplicate-name validation
        self.field_map()?;
        let state = self.meta().state();
        for field in self.fields() {
            field.slot.bind(field.name, state);
        }
        Ok(())
    }

    /// The record's key
    ///
    /// # Errors
    ///
    /// Propagates cell access errors (unbound record, unset key).
    fn key(&self) -> Result<Self::Key> {
        self.meta().id_cell().get()
    }

    /// The record's key in canonical string form (the `_id` wire value)
    ///
    /// # Errors
    ///
    /// Propagates cell access errors (unbound record, unset key).
    fn key_string(&self) -> Result<String> {
        Ok(self.key()?.to_key_string())
    }

    /// The record's current version
    ///
    /// # Errors
    ///
    /// Propagates cell access errors (unbound record).
    fn version(&self) -> Result<u64> {
        self.meta().version_cell().get()
    }

    /// Whether field mutation is currently forbidden
    fn is_read_only(&self) -> bool {
        self.meta().state().is_read_only()
    }

    /// Flip the read-only flag (engine-controlled windows only)
    fn set_read_only(&self, read_only: bool) {
        self.meta().state().set_read_only(read_only);
    }

    /// Whether this record can still be saved or updated
    fn is_valid(&self) -> bool {
        self.meta().state().is_valid()
    }

    /// Permanently invalidate this record (deleted or evicted)
    fn invalidate(&self) {
        self.meta().state().invalidate();
    }
}

/// RAII writable window over a record's state.
///
/// Opening the window clears the read-only flag; dropping it restores
/// read-only on every exit path, including early returns and panics.
pub struct WritableWindow {
    state: Arc<RecordState>,
}

impl WritableWindow {
    /// Open a writable window on `state`
    pub fn open(state: &Arc<RecordState>) -> Self {
        state.set_read_only(false);
        WritableWindow {
            state: Arc::clone(state),
        }
    }
}

impl Drop for WritableWindow {
    fn drop(&mut self) {
        self.state.set_read_only(true);
    }
}

/// Copy every named field value from `source` into `target` without
/// changing `target`'s identity.
///
/// `target` is made writable for the duration of the copy and restored to
/// read-only afterwards. A field missing from `source` keeps its current
/// value (with a warning); a same-named field of a different cell type is
/// an error.
///
/// Callers that may race on the same key must serialize their calls per
/// key; the window itself does not lock the record.
///
/// # Errors
///
/// `FieldTypeMismatch` on cell type conflicts, `ContractViolation` on
/// duplicate field names, plus cell gating errors if `target` was
/// invalidated.
pub fn reconcile_from_newer<X: Record>(target: &X, source: &X) -> Result<()> {
    let source_map = source.field_map()?;
    let _window = WritableWindow::open(target.meta().state());
    for field in target.fields() {
        match source_map.get(field.name) {
            Some(source_slot) => field.slot.assign_from(field.name, *source_slot)?,
            None => {
                warn!(field = field.name, "source record has no value for field; keeping current value");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::OptionalCell;

    #[derive(Clone, Default, Serialize, Deserialize)]
    struct Profile {
        #[serde(flatten)]
        meta: RecordMeta<String>,
        username: RequiredCell<String>,
        balance: RequiredCell<i64>,
        nickname: OptionalCell<String>,
    }

    impl Record for Profile {
        type Key = String;

        fn meta(&self) -> &RecordMeta<String> {
            &self.meta
        }

        fn custom_fields(&self) -> Vec<FieldRef<'_>> {
            vec![
                FieldRef::new("username", &self.username),
                FieldRef::new("balance", &self.balance),
                FieldRef::new("nickname", &self.nickname),
            ]
        }
    }

    fn make_profile(key: &str, username: &str, balance: i64) -> Profile {
        let p = Profile::default();
        p.initialize().unwrap();
        p.meta.id_cell().set(key.to_string()).unwrap();
        p.username.set(username.to_string()).unwrap();
        p.balance.set(balance).unwrap();
        p
    }

    #[test]
    fn test_initialize_binds_all_cells() {
        let p = Profile::default();
        assert!(p.key().is_err());
        p.initialize().unwrap();
        p.meta.id_cell().set("k1".to_string()).unwrap();
        assert_eq!(p.key().unwrap(), "k1");
        assert_eq!(p.version().unwrap(), 0);
    }

    #[test]
    fn test_duplicate_field_names_rejected() {
        #[derive(Clone, Default, Serialize, Deserialize)]
        struct Broken {
            #[serde(flatten)]
            meta: RecordMeta<String>,
            a: RequiredCell<u64>,
            b: RequiredCell<u64>,
        }

        impl Record for Broken {
            type Key = String;
            fn meta(&self) -> &RecordMeta<String> {
                &self.meta
            }
            fn custom_fields(&self) -> Vec<FieldRef<'_>> {
                vec![FieldRef::new("same", &self.a), FieldRef::new("same", &self.b)]
            }
        }

        let b = Broken::default();
        assert!(matches!(b.initialize(), Err(Error::ContractViolation(_))));
    }

    #[test]
    fn test_read_only_transition() {
        let p = make_profile("k", "kaz", 10);
        p.set_read_only(true);
        assert!(p.balance.set(20).is_err());
        p.set_read_only(false);
        p.balance.set(20).unwrap();
        assert_eq!(p.balance.get().unwrap(), 20);
    }

    #[test]
    fn test_clone_gets_fresh_state() {
        let p = make_profile("k", "kaz", 10);
        p.set_read_only(true);
        let copy = p.clone();
        copy.initialize().unwrap();
        // The clone is writable even though the original is read-only
        copy.balance.set(99).unwrap();
        assert!(p.balance.set(99).is_err());
        assert_eq!(p.balance.get().unwrap(), 10);
    }

    #[test]
    fn test_serde_wire_shape() {
        let p = make_profile("user-1", "kaz", 42);
        let doc = serde_json::to_value(&p).unwrap();
        assert_eq!(doc["_id"], "user-1");
        assert_eq!(doc["version"], 0);
        assert_eq!(doc["username"], "kaz");
        assert_eq!(doc["balance"], 42);
        assert_eq!(doc["nickname"], serde_json::Value::Null);

        let back: Profile = serde_json::from_value(doc).unwrap();
        back.initialize().unwrap();
        assert_eq!(back.key().unwrap(), "user-1");
        assert_eq!(back.version().unwrap(), 0);
        assert_eq!(back.username.get().unwrap(), "kaz");
    }

    #[test]
    fn test_reconcile_copies_values_in_place() {
        let cached = make_profile("k", "old", 1);
        cached.set_read_only(true);

        let newer = make_profile("k", "new", 7);
        newer.meta.version_cell().set(3).unwrap();
        newer.set_read_only(true);

        reconcile_from_newer(&cached, &newer).unwrap();

        assert_eq!(cached.username.get().unwrap(), "new");
        assert_eq!(cached.balance.get().unwrap(), 7);
        assert_eq!(cached.version().unwrap(), 3);
        // Window closed: read-only restored
        assert!(cached.is_read_only());
    }

    #[test]
    fn test_reconcile_restores_read_only_on_error() {
        let cached = make_profile("k", "old", 1);
        cached.set_read_only(true);
        cached.invalidate();

        let newer = make_profile("k", "new", 7);
        // Invalidated target cannot be written
        assert!(reconcile_from_newer(&cached, &newer).is_err());
        assert!(cached.is_read_only());
    }

    #[test]
    fn test_invalidate_is_permanent() {
        let p = make_profile("k", "kaz", 10);
        p.invalidate();
        assert!(!p.is_valid());
        assert!(p.balance.set(11).is_err());
    }
}
