//! Unique secondary indexes
//!
//! An [`IndexedField`] pairs a declared field name with a typed extractor
//! producing the field's JSON value. Uniqueness is enforced by the durable
//! backend; the collection resolves lookups cache-first and re-validates
//! database hits against the live record before returning them.

use serde::Serialize;
use serde_json::Value;
use tierdb_core::{Record, Result};

/// A declared unique index over one field of a record type
pub struct IndexedField<X: Record> {
    name: &'static str,
    extract: Box<dyn Fn(&X) -> Result<Value> + Send + Sync>,
}

impl<X: Record> IndexedField<X> {
    /// Declare an index on `name`, extracted by `f`.
    ///
    /// The extractor reads the field through its cell, so it observes the
    /// record's live value, and the extracted type only needs to serialize
    /// to the same JSON as the wire document.
    pub fn new<T, F>(name: &'static str, f: F) -> Self
    where
        T: Serialize,
        F: Fn(&X) -> Result<T> + Send + Sync + 'static,
    {
        IndexedField {
            name,
            extract: Box::new(move |record| {
                let value = f(record)?;
                Ok(serde_json::to_value(value)?)
            }),
        }
    }

    /// The declared (wire) field name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The field's current JSON value on `record`
    pub fn value_of(&self, record: &X) -> Result<Value> {
        (self.extract)(record)
    }
}

/// Serialize a query value the same way the wire document does
///
/// # Errors
///
/// `Serialization` if the value cannot be represented as JSON.
pub fn query_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
