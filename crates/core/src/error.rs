//! Error types for tierdb
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use std::io;
use thiserror::Error;

/// Result type alias for tierdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the two-tier store
#[derive(Debug, Error)]
pub enum Error {
    /// Key absent where presence was required
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create collided with an existing primary key
    #[error("Duplicate key '{key}' in collection '{collection}'")]
    DuplicateKey {
        /// Collection name
        collection: String,
        /// String form of the colliding key
        key: String,
    },

    /// A collection with this name is already registered
    #[error("Duplicate collection name: {0}")]
    DuplicateCollection(String),

    /// Optimistic update exhausted its attempt ceiling
    #[error("Update retry limit exceeded after {attempts} attempts")]
    RetryLimitExceeded {
        /// Number of attempts made
        attempts: u32,
    },

    /// An update function violated the key/version invariants (caller bug, never retried)
    #[error("Update contract violation: {0}")]
    ContractViolation(String),

    /// Durable-store connectivity or protocol failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Low-level write conflict reported by the durable store.
    /// Retryable like a version mismatch, but does not require a re-read.
    #[error("Durable-store write conflict")]
    WriteConflict,

    /// Mutation attempted through a field of a read-only record
    #[error("Cannot modify field '{0}' in read-only mode")]
    ReadOnlyField(String),

    /// Field accessed before being bound to a parent record
    #[error("Field '{0}' is not bound to a record")]
    UnboundField(String),

    /// Reconciliation found two slots of the same name but different types
    #[error("Field '{0}' has mismatched types between records")]
    FieldTypeMismatch(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Key string could not be parsed back into the declared key type
    #[error("Invalid key string: {0}")]
    InvalidKey(String),

    /// A declared dependency names a collection that does not exist
    #[error("Collection '{collection}' depends on unknown collection '{dependency}'")]
    UnknownDependency {
        /// Dependent collection
        collection: String,
        /// Missing dependency name
        dependency: String,
    },

    /// Dependency declarations form a cycle
    #[error("Dependency cycle involving collections: {0:?}")]
    DependencyCycle(Vec<String>),

    /// Operation attempted on a collection that is not running
    #[error("Collection '{0}' is not running")]
    CollectionStopped(String),

    /// A unique index would be (or already is) violated
    #[error("Unique index '{index}' violated in collection '{collection}'")]
    IndexViolation {
        /// Collection name
        collection: String,
        /// Index field name
        index: String,
    },

    /// External deadline elapsed before the operation completed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// I/O error (config loading, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// An update function's deliberate refusal to proceed.
///
/// This is a controlled negative outcome, not a failure: the update engine
/// stops immediately (no retry, no durable write) and surfaces it as the
/// `Rejected` outcome variant.
#[derive(Debug, Error)]
#[error("Update rejected: {reason}")]
pub struct RejectedUpdate {
    /// Why the update function declined
    pub reason: String,
}

impl RejectedUpdate {
    /// Create a rejection with the given reason
    pub fn new(reason: impl Into<String>) -> Self {
        RejectedUpdate {
            reason: reason.into(),
        }
    }
}
