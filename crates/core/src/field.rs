//! Field cells: independently lockable, writability-gated value slots
//!
//! Reconciliation copies cell *values*, never object identity, so a record's
//! fields are modelled as individually boxed cells. Every cell is gated by
//! its parent record's [`RecordState`]: mutation is only permitted while the
//! record is writable and valid.
//!
//! Cells start **unbound**. [`crate::record::Record::initialize`] binds each
//! cell to its parent's state and gives it its declared name; a `Clone` or a
//! deserialized cell is unbound again until the owning record is
//! re-initialized. Accessing an unbound cell is an error, not a panic.

use crate::error::{Error, Result};
use crate::key::StoreKey;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle state shared by a record and all of its cells
///
/// Transitions: `writable → read-only` after initialization/update
/// completes, and `read-only → writable` only inside the engine's own
/// controlled windows (creation, reconciliation, update application).
/// `invalidate` is one-way: an invalidated record is permanently
/// non-writable.
#[derive(Debug)]
pub struct RecordState {
    read_only: AtomicBool,
    valid: AtomicBool,
}

impl RecordState {
    /// New state: writable and valid
    pub fn new() -> Self {
        RecordState {
            read_only: AtomicBool::new(false),
            valid: AtomicBool::new(true),
        }
    }

    /// Whether mutation through cells is currently forbidden
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Flip the read-only flag
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    /// Whether the record can still be saved or updated
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Permanently invalidate the record (it was deleted or evicted)
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        self.read_only.store(true, Ordering::Release);
    }
}

impl Default for RecordState {
    fn default() -> Self {
        RecordState::new()
    }
}

/// A cell's binding to its parent record
#[derive(Clone)]
struct CellBinding {
    name: &'static str,
    state: Arc<RecordState>,
}

/// Binding slot shared by every cell type
#[derive(Default)]
struct Binding(RwLock<Option<CellBinding>>);

impl Binding {
    fn bind(&self, name: &'static str, state: &Arc<RecordState>) {
        *self.0.write() = Some(CellBinding {
            name,
            state: Arc::clone(state),
        });
    }

    fn name(&self) -> &'static str {
        self.0.read().as_ref().map_or("<unbound>", |b| b.name)
    }

    fn is_bound(&self) -> bool {
        self.0.read().is_some()
    }

    fn check_readable(&self) -> Result<()> {
        if self.is_bound() {
            Ok(())
        } else {
            Err(Error::UnboundField(self.name().to_string()))
        }
    }

    fn check_writable(&self) -> Result<()> {
        let guard = self.0.read();
        let binding = guard
            .as_ref()
            .ok_or_else(|| Error::UnboundField("<unbound>".to_string()))?;
        if binding.state.is_read_only() || !binding.state.is_valid() {
            return Err(Error::ReadOnlyField(binding.name.to_string()));
        }
        Ok(())
    }
}

/// Object-safe view of a cell, used for by-name value copies and index
/// value extraction
pub trait FieldSlot: Send + Sync {
    /// Downcast support for same-type value copies
    fn as_any(&self) -> &dyn Any;

    /// Bind this cell to its parent record's state under its declared name
    fn bind(&self, name: &'static str, state: &Arc<RecordState>);

    /// Whether this cell has been bound to a parent record
    fn is_bound(&self) -> bool;

    /// Copy the value out of `source` (which must be the same concrete cell
    /// type) into this cell. Used by reconciliation; still subject to the
    /// writability gate.
    ///
    /// # Errors
    ///
    /// `FieldTypeMismatch` if `source` is a different cell type,
    /// `ReadOnlyField`/`UnboundField` if this cell cannot be written.
    fn assign_from(&self, name: &str, source: &dyn FieldSlot) -> Result<()>;

    /// The cell's current value as JSON (for index comparisons)
    ///
    /// # Errors
    ///
    /// `Serialization` if the value cannot be represented as JSON.
    fn json_value(&self) -> Result<serde_json::Value>;
}

// ============================================================================
// Scalar cells
// ============================================================================

/// A required field: always yields a value
pub struct RequiredCell<T> {
    value: RwLock<T>,
    binding: Binding,
}

impl<T> RequiredCell<T> {
    /// Create a cell holding `value` (the field's default until set)
    pub fn new(value: T) -> Self {
        RequiredCell {
            value: RwLock::new(value),
            binding: Binding::default(),
        }
    }

    /// Read the current value
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        self.binding.check_readable()?;
        Ok(self.value.read().clone())
    }

    /// Borrow the current value through a closure (no clone)
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.binding.check_readable()?;
        Ok(f(&self.value.read()))
    }

    /// Replace the value
    ///
    /// # Errors
    ///
    /// `ReadOnlyField` while the record is read-only or invalidated,
    /// `UnboundField` if the record was never initialized.
    pub fn set(&self, value: T) -> Result<()> {
        self.binding.check_writable()?;
        *self.value.write() = value;
        Ok(())
    }
}

impl<T: Clone> Clone for RequiredCell<T> {
    fn clone(&self) -> Self {
        // The clone carries the value but not the binding; the cloned
        // record must be re-initialized before use.
        RequiredCell::new(self.value.read().clone())
    }
}

impl<T: PartialEq> PartialEq for RequiredCell<T> {
    fn eq(&self, other: &Self) -> bool {
        *self.value.read() == *other.value.read()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RequiredCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RequiredCell").field(&*self.value.read()).finish()
    }
}

impl<T: Default> Default for RequiredCell<T> {
    fn default() -> Self {
        RequiredCell::new(T::default())
    }
}

impl<T: Serialize> Serialize for RequiredCell<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.value.read().serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for RequiredCell<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(RequiredCell::new(T::deserialize(deserializer)?))
    }
}

impl<T> FieldSlot for RequiredCell<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn bind(&self, name: &'static str, state: &Arc<RecordState>) {
        self.binding.bind(name, state);
    }

    fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    fn assign_from(&self, name: &str, source: &dyn FieldSlot) -> Result<()> {
        let source = source
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| Error::FieldTypeMismatch(name.to_string()))?;
        self.binding.check_writable()?;
        let value = source.value.read().clone();
        *self.value.write() = value;
        Ok(())
    }

    fn json_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&*self.value.read()).map_err(Error::from)
    }
}

/// An optional field: may be empty
pub struct OptionalCell<T> {
    value: RwLock<Option<T>>,
    binding: Binding,
}

impl<T> OptionalCell<T> {
    /// Create an empty cell
    pub fn empty() -> Self {
        OptionalCell {
            value: RwLock::new(None),
            binding: Binding::default(),
        }
    }

    /// Create a cell holding `value`
    pub fn some(value: T) -> Self {
        OptionalCell {
            value: RwLock::new(Some(value)),
            binding: Binding::default(),
        }
    }

    /// Read the current value, if any
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn get(&self) -> Result<Option<T>>
    where
        T: Clone,
    {
        self.binding.check_readable()?;
        Ok(self.value.read().clone())
    }

    /// Read the current value, or `default` if empty
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn get_or(&self, default: T) -> Result<T>
    where
        T: Clone,
    {
        Ok(self.get()?.unwrap_or(default))
    }

    /// Whether the cell currently holds no value
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn is_empty(&self) -> Result<bool> {
        self.binding.check_readable()?;
        Ok(self.value.read().is_none())
    }

    /// Replace the value
    ///
    /// # Errors
    ///
    /// `ReadOnlyField`/`UnboundField` per the writability gate.
    pub fn set(&self, value: Option<T>) -> Result<()> {
        self.binding.check_writable()?;
        *self.value.write() = value;
        Ok(())
    }

    /// Clear the value
    ///
    /// # Errors
    ///
    /// `ReadOnlyField`/`UnboundField` per the writability gate.
    pub fn clear(&self) -> Result<()> {
        self.set(None)
    }
}

impl<T: Clone> Clone for OptionalCell<T> {
    fn clone(&self) -> Self {
        OptionalCell {
            value: RwLock::new(self.value.read().clone()),
            binding: Binding::default(),
        }
    }
}

impl<T: PartialEq> PartialEq for OptionalCell<T> {
    fn eq(&self, other: &Self) -> bool {
        *self.value.read() == *other.value.read()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for OptionalCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OptionalCell").field(&*self.value.read()).finish()
    }
}

impl<T> Default for OptionalCell<T> {
    fn default() -> Self {
        OptionalCell::empty()
    }
}

impl<T: Serialize> Serialize for OptionalCell<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.value.read().serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OptionalCell<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(OptionalCell {
            value: RwLock::new(Option::<T>::deserialize(deserializer)?),
            binding: Binding::default(),
        })
    }
}

impl<T> FieldSlot for OptionalCell<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn bind(&self, name: &'static str, state: &Arc<RecordState>) {
        self.binding.bind(name, state);
    }

    fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    fn assign_from(&self, name: &str, source: &dyn FieldSlot) -> Result<()> {
        let source = source
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| Error::FieldTypeMismatch(name.to_string()))?;
        self.binding.check_writable()?;
        let value = source.value.read().clone();
        *self.value.write() = value;
        Ok(())
    }

    fn json_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&*self.value.read()).map_err(Error::from)
    }
}

// ============================================================================
// Key cell
// ============================================================================

/// The record's primary-key cell.
///
/// Serializes as the key's canonical string form, which is exactly the `_id`
/// wire value. The key may be unset on a freshly constructed record; the
/// engine sets it before the initializer runs.
pub struct KeyCell<K: StoreKey> {
    value: RwLock<Option<K>>,
    binding: Binding,
}

impl<K: StoreKey> KeyCell<K> {
    /// Create an unset key cell
    pub fn unset() -> Self {
        KeyCell {
            value: RwLock::new(None),
            binding: Binding::default(),
        }
    }

    /// Create a cell holding `key`
    pub fn of(key: K) -> Self {
        KeyCell {
            value: RwLock::new(Some(key)),
            binding: Binding::default(),
        }
    }

    /// The key
    ///
    /// # Errors
    ///
    /// `UnboundField` if the record was never initialized, `InvalidKey` if
    /// the key was never set.
    pub fn get(&self) -> Result<K> {
        self.binding.check_readable()?;
        self.value
            .read()
            .clone()
            .ok_or_else(|| Error::InvalidKey("record key is not set".to_string()))
    }

    /// Set the key (subject to the writability gate)
    ///
    /// # Errors
    ///
    /// `ReadOnlyField`/`UnboundField` per the writability gate.
    pub fn set(&self, key: K) -> Result<()> {
        self.binding.check_writable()?;
        *self.value.write() = Some(key);
        Ok(())
    }
}

impl<K: StoreKey> Clone for KeyCell<K> {
    fn clone(&self) -> Self {
        KeyCell {
            value: RwLock::new(self.value.read().clone()),
            binding: Binding::default(),
        }
    }
}

impl<K: StoreKey> PartialEq for KeyCell<K> {
    fn eq(&self, other: &Self) -> bool {
        *self.value.read() == *other.value.read()
    }
}

impl<K: StoreKey> std::fmt::Debug for KeyCell<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KeyCell").field(&*self.value.read()).finish()
    }
}

impl<K: StoreKey> Default for KeyCell<K> {
    fn default() -> Self {
        KeyCell::unset()
    }
}

impl<K: StoreKey> Serialize for KeyCell<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match &*self.value.read() {
            Some(key) => serializer.serialize_str(&key.to_key_string()),
            None => Err(serde::ser::Error::custom("record key is not set")),
        }
    }
}

impl<'de, K: StoreKey> Deserialize<'de> for KeyCell<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let key = K::from_key_string(&s).map_err(serde::de::Error::custom)?;
        Ok(KeyCell::of(key))
    }
}

impl<K: StoreKey> FieldSlot for KeyCell<K> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn bind(&self, name: &'static str, state: &Arc<RecordState>) {
        self.binding.bind(name, state);
    }

    fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    fn assign_from(&self, name: &str, source: &dyn FieldSlot) -> Result<()> {
        let source = source
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| Error::FieldTypeMismatch(name.to_string()))?;
        self.binding.check_writable()?;
        let value = source.value.read().clone();
        *self.value.write() = value;
        Ok(())
    }

    fn json_value(&self) -> Result<serde_json::Value> {
        match &*self.value.read() {
            Some(key) => Ok(serde_json::Value::String(key.to_key_string())),
            None => Err(Error::InvalidKey("record key is not set".to_string())),
        }
    }
}

// ============================================================================
// Container cells
// ============================================================================

/// An ordered-sequence field, mutation-gated like its parent record
pub struct ListCell<T: Send + Sync> {
    value: RwLock<Vec<T>>,
    binding: Binding,
}

impl<T: Send + Sync> ListCell<T> {
    /// Create a cell holding `values`
    pub fn new(values: Vec<T>) -> Self {
        ListCell {
            value: RwLock::new(values),
            binding: Binding::default(),
        }
    }

    /// Snapshot of the current elements
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn to_vec(&self) -> Result<Vec<T>>
    where
        T: Clone,
    {
        self.binding.check_readable()?;
        Ok(self.value.read().clone())
    }

    /// Number of elements
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn len(&self) -> Result<usize> {
        self.binding.check_readable()?;
        Ok(self.value.read().len())
    }

    /// Whether the sequence is empty
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Append an element
    ///
    /// # Errors
    ///
    /// `ReadOnlyField`/`UnboundField` per the writability gate.
    pub fn push(&self, value: T) -> Result<()> {
        self.binding.check_writable()?;
        self.value.write().push(value);
        Ok(())
    }

    /// Remove and return the element at `index`, if in bounds
    ///
    /// # Errors
    ///
    /// `ReadOnlyField`/`UnboundField` per the writability gate.
    pub fn remove(&self, index: usize) -> Result<Option<T>> {
        self.binding.check_writable()?;
        let mut values = self.value.write();
        if index < values.len() {
            Ok(Some(values.remove(index)))
        } else {
            Ok(None)
        }
    }

    /// Remove all elements
    ///
    /// # Errors
    ///
    /// `ReadOnlyField`/`UnboundField` per the writability gate.
    pub fn clear(&self) -> Result<()> {
        self.binding.check_writable()?;
        self.value.write().clear();
        Ok(())
    }
}

impl<T: Clone + Send + Sync> Clone for ListCell<T> {
    fn clone(&self) -> Self {
        ListCell {
            value: RwLock::new(self.value.read().clone()),
            binding: Binding::default(),
        }
    }
}

impl<T: Send + Sync> Default for ListCell<T> {
    fn default() -> Self {
        ListCell::new(Vec::new())
    }
}

impl<T: Serialize + Send + Sync> Serialize for ListCell<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.value.read().serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de> + Send + Sync> Deserialize<'de> for ListCell<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(ListCell::new(Vec::<T>::deserialize(deserializer)?))
    }
}

impl<T> FieldSlot for ListCell<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn bind(&self, name: &'static str, state: &Arc<RecordState>) {
        self.binding.bind(name, state);
    }

    fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    fn assign_from(&self, name: &str, source: &dyn FieldSlot) -> Result<()> {
        let source = source
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| Error::FieldTypeMismatch(name.to_string()))?;
        self.binding.check_writable()?;
        let value = source.value.read().clone();
        *self.value.write() = value;
        Ok(())
    }

    fn json_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&*self.value.read()).map_err(Error::from)
    }
}

/// A unique-membership set field, mutation-gated like its parent record
pub struct SetCell<T: Eq + Hash + Send + Sync> {
    value: RwLock<HashSet<T>>,
    binding: Binding,
}

impl<T: Eq + Hash + Send + Sync> SetCell<T> {
    /// Create a cell holding `values`
    pub fn new(values: HashSet<T>) -> Self {
        SetCell {
            value: RwLock::new(values),
            binding: Binding::default(),
        }
    }

    /// Membership test
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn contains(&self, value: &T) -> Result<bool> {
        self.binding.check_readable()?;
        Ok(self.value.read().contains(value))
    }

    /// Number of members
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn len(&self) -> Result<usize> {
        self.binding.check_readable()?;
        Ok(self.value.read().len())
    }

    /// Whether the set is empty
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of the current members
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn to_set(&self) -> Result<HashSet<T>>
    where
        T: Clone,
    {
        self.binding.check_readable()?;
        Ok(self.value.read().clone())
    }

    /// Insert a member; returns whether it was newly added
    ///
    /// # Errors
    ///
    /// `ReadOnlyField`/`UnboundField` per the writability gate.
    pub fn insert(&self, value: T) -> Result<bool> {
        self.binding.check_writable()?;
        Ok(self.value.write().insert(value))
    }

    /// Remove a member; returns whether it was present
    ///
    /// # Errors
    ///
    /// `ReadOnlyField`/`UnboundField` per the writability gate.
    pub fn remove(&self, value: &T) -> Result<bool> {
        self.binding.check_writable()?;
        Ok(self.value.write().remove(value))
    }
}

impl<T: Eq + Hash + Clone + Send + Sync> Clone for SetCell<T> {
    fn clone(&self) -> Self {
        SetCell {
            value: RwLock::new(self.value.read().clone()),
            binding: Binding::default(),
        }
    }
}

impl<T: Eq + Hash + Send + Sync> Default for SetCell<T> {
    fn default() -> Self {
        SetCell::new(HashSet::new())
    }
}

impl<T: Eq + Hash + Serialize + Send + Sync> Serialize for SetCell<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.value.read().serialize(serializer)
    }
}

impl<'de, T: Eq + Hash + Deserialize<'de> + Send + Sync> Deserialize<'de> for SetCell<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(SetCell::new(HashSet::<T>::deserialize(deserializer)?))
    }
}

impl<T> FieldSlot for SetCell<T>
where
    T: Eq + Hash + Clone + Serialize + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn bind(&self, name: &'static str, state: &Arc<RecordState>) {
        self.binding.bind(name, state);
    }

    fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    fn assign_from(&self, name: &str, source: &dyn FieldSlot) -> Result<()> {
        let source = source
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| Error::FieldTypeMismatch(name.to_string()))?;
        self.binding.check_writable()?;
        let value = source.value.read().clone();
        *self.value.write() = value;
        Ok(())
    }

    fn json_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&*self.value.read()).map_err(Error::from)
    }
}

/// A key→value mapping field, mutation-gated like its parent record
pub struct MapCell<K: Eq + Hash + Send + Sync, V: Send + Sync> {
    value: RwLock<HashMap<K, V>>,
    binding: Binding,
}

impl<K: Eq + Hash + Send + Sync, V: Send + Sync> MapCell<K, V> {
    /// Create a cell holding `entries`
    pub fn new(entries: HashMap<K, V>) -> Self {
        MapCell {
            value: RwLock::new(entries),
            binding: Binding::default(),
        }
    }

    /// Look up a value by key
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn get(&self, key: &K) -> Result<Option<V>>
    where
        V: Clone,
    {
        self.binding.check_readable()?;
        Ok(self.value.read().get(key).cloned())
    }

    /// Whether the mapping contains `key`
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.binding.check_readable()?;
        Ok(self.value.read().contains_key(key))
    }

    /// Number of entries
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn len(&self) -> Result<usize> {
        self.binding.check_readable()?;
        Ok(self.value.read().len())
    }

    /// Whether the mapping is empty
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of the current entries
    ///
    /// # Errors
    ///
    /// `UnboundField` if the owning record was never initialized.
    pub fn to_map(&self) -> Result<HashMap<K, V>>
    where
        K: Clone,
        V: Clone,
    {
        self.binding.check_readable()?;
        Ok(self.value.read().clone())
    }

    /// Insert an entry; returns the previous value for `key`, if any
    ///
    /// # Errors
    ///
    /// `ReadOnlyField`/`UnboundField` per the writability gate.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.binding.check_writable()?;
        Ok(self.value.write().insert(key, value))
    }

    /// Remove an entry; returns the removed value, if any
    ///
    /// # Errors
    ///
    /// `ReadOnlyField`/`UnboundField` per the writability gate.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.binding.check_writable()?;
        Ok(self.value.write().remove(key))
    }
}

impl<K: Eq + Hash + Clone + Send + Sync, V: Clone + Send + Sync> Clone for MapCell<K, V> {
    fn clone(&self) -> Self {
        MapCell {
            value: RwLock::new(self.value.read().clone()),
            binding: Binding::default(),
        }
    }
}

impl<K: Eq + Hash + Send + Sync, V: Send + Sync> Default for MapCell<K, V> {
    fn default() -> Self {
        MapCell::new(HashMap::new())
    }
}

impl<K, V> Serialize for MapCell<K, V>
where
    K: Eq + Hash + Serialize + Send + Sync,
    V: Serialize + Send + Sync,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.value.read().serialize(serializer)
    }
}

impl<'de, K, V> Deserialize<'de> for MapCell<K, V>
where
    K: Eq + Hash + Deserialize<'de> + Send + Sync,
    V: Deserialize<'de> + Send + Sync,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(MapCell::new(HashMap::<K, V>::deserialize(deserializer)?))
    }
}

impl<K, V> FieldSlot for MapCell<K, V>
where
    K: Eq + Hash + Clone + Serialize + Send + Sync + 'static,
    V: Clone + Serialize + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn bind(&self, name: &'static str, state: &Arc<RecordState>) {
        self.binding.bind(name, state);
    }

    fn is_bound(&self) -> bool {
        self.binding.is_bound()
    }

    fn assign_from(&self, name: &str, source: &dyn FieldSlot) -> Result<()> {
        let source = source
            .as_any()
            .downcast_ref::<Self>()
            .ok_or_else(|| Error::FieldTypeMismatch(name.to_string()))?;
        self.binding.check_writable()?;
        let value = source.value.read().clone();
        *self.value.write() = value;
        Ok(())
    }

    fn json_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&*self.value.read()).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_state() -> Arc<RecordState> {
        Arc::new(RecordState::new())
    }

    #[test]
    fn test_unbound_cell_rejects_access() {
        let cell = RequiredCell::new(5u64);
        assert!(matches!(cell.get(), Err(Error::UnboundField(_))));
        assert!(matches!(cell.set(6), Err(Error::UnboundField(_))));
    }

    #[test]
    fn test_required_cell_set_get() {
        let state = bound_state();
        let cell = RequiredCell::new(5u64);
        cell.bind("count", &state);
        assert_eq!(cell.get().unwrap(), 5);
        cell.set(9).unwrap();
        assert_eq!(cell.get().unwrap(), 9);
    }

    #[test]
    fn test_read_only_gate() {
        let state = bound_state();
        let cell = RequiredCell::new(5u64);
        cell.bind("count", &state);
        state.set_read_only(true);
        let err = cell.set(6).unwrap_err();
        assert!(matches!(err, Error::ReadOnlyField(name) if name == "count"));
        // Reads still allowed
        assert_eq!(cell.get().unwrap(), 5);
    }

    #[test]
    fn test_invalidated_record_is_permanently_non_writable() {
        let state = bound_state();
        let cell = RequiredCell::new(1u64);
        cell.bind("count", &state);
        state.invalidate();
        assert!(cell.set(2).is_err());
        // Even flipping read_only back does not help once invalid
        state.set_read_only(false);
        assert!(cell.set(2).is_err());
    }

    #[test]
    fn test_clone_drops_binding() {
        let state = bound_state();
        let cell = RequiredCell::new(5u64);
        cell.bind("count", &state);
        let copy = cell.clone();
        assert!(!copy.is_bound());
        assert!(matches!(copy.get(), Err(Error::UnboundField(_))));
    }

    #[test]
    fn test_assign_from_copies_value_not_identity() {
        let state_a = bound_state();
        let state_b = bound_state();
        let a = RequiredCell::new(1u64);
        let b = RequiredCell::new(42u64);
        a.bind("count", &state_a);
        b.bind("count", &state_b);
        a.assign_from("count", &b).unwrap();
        assert_eq!(a.get().unwrap(), 42);
        // Source unchanged
        assert_eq!(b.get().unwrap(), 42);
    }

    #[test]
    fn test_assign_from_type_mismatch() {
        let state = bound_state();
        let a = RequiredCell::new(1u64);
        let b = RequiredCell::new("text".to_string());
        a.bind("f", &state);
        b.bind("f", &state);
        let err = a.assign_from("f", &b).unwrap_err();
        assert!(matches!(err, Error::FieldTypeMismatch(_)));
    }

    #[test]
    fn test_optional_cell() {
        let state = bound_state();
        let cell: OptionalCell<String> = OptionalCell::empty();
        cell.bind("nickname", &state);
        assert!(cell.is_empty().unwrap());
        assert_eq!(cell.get_or("anon".into()).unwrap(), "anon");
        cell.set(Some("kaz".into())).unwrap();
        assert_eq!(cell.get().unwrap(), Some("kaz".to_string()));
        cell.clear().unwrap();
        assert!(cell.is_empty().unwrap());
    }

    #[test]
    fn test_key_cell_serializes_as_string() {
        let cell: KeyCell<u64> = KeyCell::of(77);
        let json = serde_json::to_value(&cell).unwrap();
        assert_eq!(json, serde_json::Value::String("77".to_string()));
        let back: KeyCell<u64> = serde_json::from_value(json).unwrap();
        let state = bound_state();
        back.bind("_id", &state);
        assert_eq!(back.get().unwrap(), 77);
    }

    #[test]
    fn test_key_cell_unset_serialize_fails() {
        let cell: KeyCell<u64> = KeyCell::unset();
        assert!(serde_json::to_value(&cell).is_err());
    }

    #[test]
    fn test_list_cell_gating() {
        let state = bound_state();
        let cell: ListCell<u32> = ListCell::default();
        cell.bind("scores", &state);
        cell.push(3).unwrap();
        cell.push(1).unwrap();
        assert_eq!(cell.len().unwrap(), 2);
        state.set_read_only(true);
        assert!(cell.push(9).is_err());
        assert_eq!(cell.to_vec().unwrap(), vec![3, 1]);
    }

    #[test]
    fn test_set_cell() {
        let state = bound_state();
        let cell: SetCell<String> = SetCell::default();
        cell.bind("tags", &state);
        assert!(cell.insert("red".into()).unwrap());
        assert!(!cell.insert("red".into()).unwrap());
        assert!(cell.contains(&"red".to_string()).unwrap());
        assert!(cell.remove(&"red".to_string()).unwrap());
        assert!(cell.is_empty().unwrap());
    }

    #[test]
    fn test_map_cell() {
        let state = bound_state();
        let cell: MapCell<String, u64> = MapCell::default();
        cell.bind("balances", &state);
        assert_eq!(cell.insert("gold".into(), 10).unwrap(), None);
        assert_eq!(cell.get(&"gold".to_string()).unwrap(), Some(10));
        assert_eq!(cell.remove(&"gold".to_string()).unwrap(), Some(10));
        assert!(cell.is_empty().unwrap());
    }

    #[test]
    fn test_cell_serde_round_trip() {
        let cell = RequiredCell::new(123u64);
        let json = serde_json::to_string(&cell).unwrap();
        assert_eq!(json, "123");
        let back: RequiredCell<u64> = serde_json::from_str(&json).unwrap();
        assert!(!back.is_bound());
        assert_eq!(back, cell);
    }
}
