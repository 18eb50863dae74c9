//! Optimistic compare-and-swap update engine
//!
//! An update runs against a writable working copy cloned from the cached
//! record. The engine applies the caller's update function, advances the
//! version itself, and attempts an atomic replace of the durable row
//! matching both the key and the expected prior version. A miss means
//! another writer advanced the version first; the engine re-reads, rebuilds
//! the working copy, and retries with paced backoff up to a bounded number
//! of attempts.
//!
//! On success the cached record is reconciled field by field from the
//! committed working copy, preserving its identity for long-lived holders.

use crate::backoff::RetryBackoff;
use std::sync::Arc;
use std::thread;
use tierdb_core::{
    reconcile_from_newer, Error, Record, RejectedUpdate, Result, UpdateOutcome, WritableWindow,
};
use tierdb_storage::{from_document, to_document, DatabaseStore, Document};
use tracing::{debug, trace};

/// Default attempt ceiling for one update
pub const DEFAULT_MAX_ATTEMPTS: u32 = 50;

/// Runs bounded-retry compare-and-swap updates against a durable store
#[derive(Debug, Clone)]
pub struct UpdateEngine {
    max_attempts: u32,
    backoff: RetryBackoff,
}

impl Default for UpdateEngine {
    fn default() -> Self {
        UpdateEngine {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: RetryBackoff::default(),
        }
    }
}

enum Halt {
    Rejected(RejectedUpdate),
    Failed(Error),
}

impl From<Error> for Halt {
    fn from(e: Error) -> Self {
        Halt::Failed(e)
    }
}

enum Replace {
    Committed,
    Mismatch(Option<Document>),
}

impl UpdateEngine {
    /// Engine with a custom attempt ceiling and backoff schedule
    pub fn new(max_attempts: u32, backoff: RetryBackoff) -> Self {
        UpdateEngine {
            max_attempts,
            backoff,
        }
    }

    /// The configured attempt ceiling
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `update` against `cached` with compare-and-swap retry.
    ///
    /// `update` receives a writable working copy and mutates it through its
    /// cells; it must change neither the key nor the version (the engine
    /// advances the version itself). It may run several times under
    /// contention, so it must be repeatable. Returning a [`RejectedUpdate`]
    /// stops the engine immediately with no durable write and no retry.
    ///
    /// On success the cached record has been reconciled in place to the
    /// committed state and is returned as the `Success` value.
    pub fn execute<X, F>(
        &self,
        store: &DatabaseStore<X>,
        cached: &Arc<X>,
        update: F,
    ) -> UpdateOutcome<Arc<X>>
    where
        X: Record,
        F: Fn(&X) -> std::result::Result<(), RejectedUpdate>,
    {
        match self.run(store, cached, &update) {
            Ok(()) => UpdateOutcome::Success(Arc::clone(cached)),
            Err(Halt::Rejected(rejection)) => UpdateOutcome::Rejected(rejection),
            Err(Halt::Failed(error)) => UpdateOutcome::Failure(error),
        }
    }

    fn run<X, F>(
        &self,
        store: &DatabaseStore<X>,
        cached: &Arc<X>,
        update: &F,
    ) -> std::result::Result<(), Halt>
    where
        X: Record,
        F: Fn(&X) -> std::result::Result<(), RejectedUpdate>,
    {
        let key_string = cached.key_string()?;
        let mut working: X = (**cached).clone();
        working.initialize()?;
        // applied tracks whether the working copy already carries the
        // update and the version bump; a low-level write conflict retries
        // without re-applying.
        let mut applied = false;
        let mut attempts: u32 = 0;

        loop {
            if attempts >= self.max_attempts {
                return Err(Halt::Failed(Error::RetryLimitExceeded { attempts }));
            }
            if !applied {
                self.apply(&working, update)?;
                applied = true;
            }
            attempts += 1;
            let expected = working.version()? - 1;

            match self.try_replace(store, &key_string, expected, &working) {
                Ok(Replace::Committed) => {
                    trace!(key = %key_string, attempts, "update committed");
                    reconcile_from_newer(cached.as_ref(), &working)?;
                    return Ok(());
                }
                Ok(Replace::Mismatch(None)) => {
                    return Err(Halt::Failed(Error::NotFound(format!(
                        "{key_string}@{} (deleted during update)",
                        store.collection_name()
                    ))));
                }
                Ok(Replace::Mismatch(Some(current))) => {
                    debug!(
                        key = %key_string,
                        attempt = attempts,
                        expected,
                        "version mismatch; rebuilding working copy"
                    );
                    working = from_document(&current)?;
                    applied = false;
                    self.pause(store, attempts);
                }
                Err(Error::WriteConflict) => {
                    // Retryable like a mismatch, but the working copy is
                    // still valid: no re-read, no re-apply.
                    trace!(key = %key_string, attempt = attempts, "low-level write conflict");
                    self.pause(store, attempts);
                }
                Err(other) => return Err(Halt::Failed(other)),
            }
        }
    }

    /// Apply the update function inside a writable window, enforce the
    /// key/version contract, then advance the version.
    fn apply<X, F>(&self, working: &X, update: &F) -> std::result::Result<(), Halt>
    where
        X: Record,
        F: Fn(&X) -> std::result::Result<(), RejectedUpdate>,
    {
        let base_key = working.key()?;
        let base_version = working.version()?;
        {
            let _window = WritableWindow::open(working.meta().state());
            update(working).map_err(Halt::Rejected)?;
        }
        if working.key()? != base_key {
            return Err(Halt::Failed(Error::ContractViolation(
                "update function must not change the record key".to_string(),
            )));
        }
        if working.version()? != base_version {
            return Err(Halt::Failed(Error::ContractViolation(
                "update function must not modify the version".to_string(),
            )));
        }
        let _window = WritableWindow::open(working.meta().state());
        working.meta().version_cell().set(base_version + 1)?;
        Ok(())
    }

    /// One transactional compare-and-swap attempt. On a miss the current
    /// durable value is read within the same transaction before aborting.
    fn try_replace<X: Record>(
        &self,
        store: &DatabaseStore<X>,
        id: &str,
        expected: u64,
        working: &X,
    ) -> Result<Replace> {
        let doc = to_document(working)?;
        let backend = store.backend();
        let mut txn = backend.begin(store.collection_name())?;
        if txn.replace_if_match(id, expected, doc)? {
            txn.commit()?;
            Ok(Replace::Committed)
        } else {
            let current = txn.read(id)?;
            // txn drops here without commit: abort
            Ok(Replace::Mismatch(current))
        }
    }

    fn pause<X: Record>(&self, store: &DatabaseStore<X>, attempt: u32) {
        if attempt < self.max_attempts {
            let delay = self.backoff.delay(attempt, store.backend().average_ping());
            thread::sleep(delay);
        }
    }
}

/// Insert a brand-new record durably.
///
/// The record must be at version 0 and carry a key; a durable row with the
/// same key fails the insert visibly rather than being overwritten.
pub fn persist_new<X: Record>(store: &DatabaseStore<X>, record: &X) -> Result<()> {
    if record.version()? != 0 {
        return Err(Error::ContractViolation(
            "a new record must start at version 0".to_string(),
        ));
    }
    store.save_new(record)
}
