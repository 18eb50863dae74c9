//! Outcome variants for asynchronous operations
//!
//! Every asynchronous operation completes into exactly one variant of a
//! small closed set, used uniformly across the engine:
//!
//! - [`Outcome`] for read-style operations: `Success`, `Empty`, `Failure`
//! - [`UpdateOutcome`] for updates, which adds `Rejected`: the update
//!   function's deliberate, non-exceptional refusal to proceed
//!
//! Operations never panic or raise on the caller's thread; only a blocking
//! `into_result()` call re-raises a `Failure` as an `Err` at the call site.

use crate::error::{Error, RejectedUpdate};

/// Completion of a read-style operation
#[derive(Debug)]
pub enum Outcome<T> {
    /// The operation produced a value
    Success(T),
    /// No such record (not an error for read-style operations)
    Empty,
    /// An unexpected error, wrapping the underlying cause
    Failure(Error),
}

impl<T> Outcome<T> {
    /// True if this outcome carries a value
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// True if the record was absent
    pub fn is_empty(&self) -> bool {
        matches!(self, Outcome::Empty)
    }

    /// True if the operation failed
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    /// The value, if present
    pub fn success(self) -> Option<T> {
        match self {
            Outcome::Success(v) => Some(v),
            _ => None,
        }
    }

    /// Map the success value to another type
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Success(v) => Outcome::Success(f(v)),
            Outcome::Empty => Outcome::Empty,
            Outcome::Failure(e) => Outcome::Failure(e),
        }
    }

    /// Convert into a `Result`, re-raising failures at the call site.
    /// `Empty` maps to `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns the wrapped error if this outcome is a `Failure`.
    pub fn into_result(self) -> Result<Option<T>, Error> {
        match self {
            Outcome::Success(v) => Ok(Some(v)),
            Outcome::Empty => Ok(None),
            Outcome::Failure(e) => Err(e),
        }
    }
}

impl<T> From<Result<Option<T>, Error>> for Outcome<T> {
    fn from(r: Result<Option<T>, Error>) -> Self {
        match r {
            Ok(Some(v)) => Outcome::Success(v),
            Ok(None) => Outcome::Empty,
            Err(e) => Outcome::Failure(e),
        }
    }
}

/// Completion of an update operation
///
/// `Rejected` is distinct from `Failure`: it is a controlled negative
/// outcome produced by the update function itself, never retried and never
/// persisted.
#[derive(Debug)]
pub enum UpdateOutcome<T> {
    /// The update committed; carries the reconciled record
    Success(T),
    /// An unexpected error, wrapping the underlying cause
    Failure(Error),
    /// The update function deliberately declined to proceed
    Rejected(RejectedUpdate),
}

impl<T> UpdateOutcome<T> {
    /// True if the update committed
    pub fn is_success(&self) -> bool {
        matches!(self, UpdateOutcome::Success(_))
    }

    /// True if the update failed unexpectedly
    pub fn is_failure(&self) -> bool {
        matches!(self, UpdateOutcome::Failure(_))
    }

    /// True if the update function declined to proceed
    pub fn is_rejected(&self) -> bool {
        matches!(self, UpdateOutcome::Rejected(_))
    }

    /// The committed record, if any
    pub fn success(self) -> Option<T> {
        match self {
            UpdateOutcome::Success(v) => Some(v),
            _ => None,
        }
    }

    /// Convert into a `Result`, re-raising failures at the call site.
    /// A rejection becomes `Ok(Err(rejection))` so callers can still treat
    /// it as a non-exceptional branch.
    ///
    /// # Errors
    ///
    /// Returns the wrapped error if this outcome is a `Failure`.
    pub fn into_result(self) -> Result<Result<T, RejectedUpdate>, Error> {
        match self {
            UpdateOutcome::Success(v) => Ok(Ok(v)),
            UpdateOutcome::Rejected(r) => Ok(Err(r)),
            UpdateOutcome::Failure(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_success() {
        let o = Outcome::Success(7);
        assert!(o.is_success());
        assert_eq!(o.success(), Some(7));
    }

    #[test]
    fn test_outcome_empty_into_result() {
        let o: Outcome<u32> = Outcome::Empty;
        assert!(o.is_empty());
        assert_eq!(o.into_result().unwrap(), None);
    }

    #[test]
    fn test_outcome_failure_into_result() {
        let o: Outcome<u32> = Outcome::Failure(Error::NotFound("k".into()));
        assert!(o.into_result().is_err());
    }

    #[test]
    fn test_outcome_map() {
        let o = Outcome::Success(2).map(|v| v * 10);
        assert_eq!(o.success(), Some(20));
    }

    #[test]
    fn test_outcome_from_result() {
        let o: Outcome<u32> = Ok(Some(1)).into();
        assert!(o.is_success());
        let o: Outcome<u32> = Ok(None).into();
        assert!(o.is_empty());
        let o: Outcome<u32> = Err(Error::WriteConflict).into();
        assert!(o.is_failure());
    }

    #[test]
    fn test_update_outcome_rejected_is_not_failure() {
        let o: UpdateOutcome<u32> = UpdateOutcome::Rejected(RejectedUpdate::new("no"));
        assert!(o.is_rejected());
        assert!(!o.is_failure());
        // A rejection is an Ok branch at the result level
        assert!(o.into_result().unwrap().is_err());
    }
}
