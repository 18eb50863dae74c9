//! Core types and traits for tierdb
//!
//! This crate defines the foundational types used throughout the system:
//! - StoreKey: key abstraction with a canonical string form
//! - Field cells: writability-gated value slots (the unit of reconciliation)
//! - Record / RecordMeta: versioned, keyed, field-structured values
//! - Outcome / UpdateOutcome: closed completion variants for async operations
//! - Error: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod field;
pub mod key;
pub mod outcome;
pub mod record;

pub use error::{Error, RejectedUpdate, Result};
pub use field::{
    FieldSlot, KeyCell, ListCell, MapCell, OptionalCell, RecordState, RequiredCell, SetCell,
};
pub use key::StoreKey;
pub use outcome::{Outcome, UpdateOutcome};
pub use record::{
    reconcile_from_newer, FieldRef, Record, RecordMeta, WritableWindow, ID_FIELD, VERSION_FIELD,
};
