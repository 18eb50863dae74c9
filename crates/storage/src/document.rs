//! Record ↔ document wire mapping
//!
//! The durable tier stores each record as a document whose primary key
//! field is named exactly `_id` (the key's canonical string form) and whose
//! version field is named exactly `version` (integer). The compare-and-swap
//! filter of the update engine is `{_id: <key>, version: <expected>}`.

use serde_json::Value;
use tierdb_core::{Error, Record, Result, ID_FIELD, VERSION_FIELD};

/// A durable-tier document
pub type Document = serde_json::Map<String, Value>;

/// Serialize a record into its wire document.
///
/// Validates the wire contract on the way out: `_id` must be a string and
/// `version` a non-negative integer.
///
/// # Errors
///
/// `Serialization` if the record does not produce a JSON object honoring
/// the contract.
pub fn to_document<X: Record>(record: &X) -> Result<Document> {
    let value = serde_json::to_value(record)?;
    let doc = match value {
        Value::Object(map) => map,
        other => {
            return Err(Error::Serialization(format!(
                "record serialized to non-object JSON: {other}"
            )))
        }
    };
    doc_id(&doc)?;
    doc_version(&doc)?;
    Ok(doc)
}

/// Deserialize a record from its wire document and initialize it.
///
/// The returned record is bound (cells usable) but still writable; callers
/// decide when to flip it read-only.
///
/// # Errors
///
/// `Serialization` if the document does not match the record shape.
pub fn from_document<X: Record>(doc: &Document) -> Result<X> {
    let record: X = serde_json::from_value(Value::Object(doc.clone()))?;
    record.initialize()?;
    Ok(record)
}

/// The document's `_id` value
///
/// # Errors
///
/// `Serialization` if `_id` is missing or not a string.
pub fn doc_id(doc: &Document) -> Result<&str> {
    doc.get(ID_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Serialization(format!("document is missing a string '{ID_FIELD}'")))
}

/// The document's `version` value
///
/// # Errors
///
/// `Serialization` if `version` is missing or not a non-negative integer.
pub fn doc_version(doc: &Document) -> Result<u64> {
    doc.get(VERSION_FIELD)
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            Error::Serialization(format!("document is missing an integer '{VERSION_FIELD}'"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tierdb_core::{FieldRef, RecordMeta, RequiredCell};

    #[derive(Clone, Default, Serialize, Deserialize)]
    struct Counter {
        #[serde(flatten)]
        meta: RecordMeta<u64>,
        count: RequiredCell<i64>,
    }

    impl Record for Counter {
        type Key = u64;
        fn meta(&self) -> &RecordMeta<u64> {
            &self.meta
        }
        fn custom_fields(&self) -> Vec<FieldRef<'_>> {
            vec![FieldRef::new("count", &self.count)]
        }
    }

    fn make_counter(key: u64, count: i64) -> Counter {
        let c = Counter::default();
        c.initialize().unwrap();
        c.meta().id_cell().set(key).unwrap();
        c.count.set(count).unwrap();
        c
    }

    #[test]
    fn test_document_round_trip() {
        let c = make_counter(9, -4);
        let doc = to_document(&c).unwrap();
        assert_eq!(doc_id(&doc).unwrap(), "9");
        assert_eq!(doc_version(&doc).unwrap(), 0);

        let back: Counter = from_document(&doc).unwrap();
        assert_eq!(back.key().unwrap(), 9);
        assert_eq!(back.count.get().unwrap(), -4);
    }

    #[test]
    fn test_id_is_string_even_for_numeric_keys() {
        let c = make_counter(123, 0);
        let doc = to_document(&c).unwrap();
        assert_eq!(doc.get("_id").unwrap(), &Value::String("123".to_string()));
    }

    #[test]
    fn test_unset_key_fails_to_serialize() {
        let c = Counter::default();
        c.initialize().unwrap();
        assert!(to_document(&c).is_err());
    }

    #[test]
    fn test_missing_version_rejected() {
        let mut doc = Document::new();
        doc.insert("_id".to_string(), Value::String("1".to_string()));
        assert!(doc_version(&doc).is_err());
    }
}
