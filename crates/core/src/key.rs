//! Key abstraction for records
//!
//! Every record is identified by an immutable key of a generic key type.
//! The durable tier stores keys in canonical string form (the `_id` field),
//! so a key type must provide a lossless string round-trip.

use crate::error::{Error, Result};
use std::fmt::Debug;
use std::hash::Hash;
use uuid::Uuid;

/// A type usable as a record key.
///
/// Implementations must guarantee `from_key_string(k.to_key_string()) == k`.
/// The string form is what the durable store indexes under `_id`, so it must
/// be stable across processes.
pub trait StoreKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Canonical string form of this key (the `_id` wire value)
    fn to_key_string(&self) -> String;

    /// Parse a key back from its canonical string form
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKey` if the string is not a valid key of
    /// this type.
    fn from_key_string(s: &str) -> Result<Self>;
}

impl StoreKey for String {
    fn to_key_string(&self) -> String {
        self.clone()
    }

    fn from_key_string(s: &str) -> Result<Self> {
        Ok(s.to_string())
    }
}

impl StoreKey for Uuid {
    fn to_key_string(&self) -> String {
        self.to_string()
    }

    fn from_key_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s).map_err(|e| Error::InvalidKey(format!("{s}: {e}")))
    }
}

impl StoreKey for u64 {
    fn to_key_string(&self) -> String {
        self.to_string()
    }

    fn from_key_string(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .map_err(|e| Error::InvalidKey(format!("{s}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_key_round_trip() {
        let key = "player-one".to_string();
        let s = key.to_key_string();
        assert_eq!(String::from_key_string(&s).unwrap(), key);
    }

    #[test]
    fn test_uuid_key_round_trip() {
        let key = Uuid::new_v4();
        let s = key.to_key_string();
        assert_eq!(Uuid::from_key_string(&s).unwrap(), key);
    }

    #[test]
    fn test_uuid_key_rejects_garbage() {
        let result = Uuid::from_key_string("not-a-uuid");
        assert!(matches!(result, Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_u64_key_round_trip() {
        let key: u64 = 982451653;
        assert_eq!(u64::from_key_string(&key.to_key_string()).unwrap(), key);
    }

    #[test]
    fn test_u64_key_rejects_negative() {
        assert!(u64::from_key_string("-3").is_err());
    }
}
