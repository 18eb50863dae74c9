//! Engine and collection configuration
//!
//! Plain serde structs with TOML loading. Every knob has a default, so an
//! empty config file (or none at all) yields the stock behavior.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tierdb_concurrency::{RetryBackoff, UpdateEngine};
use tierdb_core::Result;

/// Process-wide engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempt ceiling for one optimistic update
    pub max_update_attempts: u32,
    /// Floor for a single retry delay, in milliseconds
    pub backoff_min_ms: u64,
    /// Ceiling for a single retry delay, in milliseconds
    pub backoff_max_ms: u64,
    /// Per-wave deadline for dependency-ordered start/shutdown, in
    /// milliseconds; absent means unbounded
    pub scheduler_timeout_ms: Option<u64>,
    /// Defaults applied to every collection
    pub collection: CollectionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_update_attempts: tierdb_concurrency::DEFAULT_MAX_ATTEMPTS,
            backoff_min_ms: 50,
            backoff_max_ms: 2000,
            scheduler_timeout_ms: None,
            collection: CollectionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document
    ///
    /// # Errors
    ///
    /// `Serialization` on malformed TOML or unknown value types.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| tierdb_core::Error::Serialization(e.to_string()))
    }

    /// Load from a TOML file
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, `Serialization` if it does not
    /// parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// The backoff schedule these settings describe
    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff::with_bounds(
            Duration::from_millis(self.backoff_min_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    /// The update engine these settings describe
    pub fn update_engine(&self) -> UpdateEngine {
        UpdateEngine::new(self.max_update_attempts, self.backoff())
    }

    /// The scheduler deadline, if configured
    pub fn scheduler_timeout(&self) -> Option<Duration> {
        self.scheduler_timeout_ms.map(Duration::from_millis)
    }
}

/// Per-collection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Insert database reads into the local cache
    pub cache_on_read: bool,
    /// Propagate transport failures from read-style operations instead of
    /// degrading to empty/false
    pub propagate_read_errors: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        CollectionConfig {
            cache_on_read: true,
            propagate_read_errors: false,
        }
    }
}
