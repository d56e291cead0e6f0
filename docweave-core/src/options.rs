//! Store configuration and per-operation options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DocumentStoreError, DocumentStoreResult};

/// Page size used when a query sets no limit.
pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// Store-wide settings.
///
/// Deserializes from camelCase keys; missing keys take their defaults.
///
/// ```ignore
/// let config = StoreConfig::new("shop")
///     .default_page_size(25)
///     .cache_ttl(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// Database name, reported to hooks and used in cache keys.
    pub database: String,
    pub default_page_size: u64,
    /// Lifetime of cached results, in seconds.
    pub cache_ttl_secs: u64,
    /// Minimum time between passive sweeps of expired cache entries, in seconds.
    pub cache_sweep_interval_secs: u64,
    /// Maximum number of entries per cache category.
    pub cache_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: "default".into(),
            default_page_size: DEFAULT_PAGE_SIZE,
            cache_ttl_secs: 60,
            cache_sweep_interval_secs: 30,
            cache_capacity: 10_000,
        }
    }
}

impl StoreConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self { database: database.into(), ..Default::default() }
    }

    pub fn default_page_size(mut self, page_size: u64) -> Self {
        self.default_page_size = page_size;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = ttl.as_secs();
        self
    }

    pub fn cache_sweep_interval(mut self, interval: Duration) -> Self {
        self.cache_sweep_interval_secs = interval.as_secs();
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    /// Checks the configuration once, when the store is built.
    pub fn validate(&self) -> DocumentStoreResult<()> {
        if self.database.trim().is_empty() {
            return Err(DocumentStoreError::Initialization("database name must not be empty".into()));
        }
        if self.default_page_size == 0 {
            return Err(DocumentStoreError::Initialization("default page size must be greater than zero".into()));
        }
        if self.cache_capacity == 0 {
            return Err(DocumentStoreError::Initialization("cache capacity must be greater than zero".into()));
        }

        Ok(())
    }
}

/// Options for a single collection operation.
///
/// Every flag defaults to off except `exact_count`.
///
/// ```ignore
/// let cached = OperationOptions { use_cache: true, ..Default::default() };
/// let results = store.collection("orders").with_options(cached).find(query).await?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperationOptions {
    /// Skip the before/after hooks.
    pub suppress_hooks: bool,
    /// Acquire the collection without authorization and act without an identity.
    pub suppress_auth: bool,
    /// Read from the primary.
    pub consistent_read: bool,
    /// Serve and store read results through the result cache.
    pub use_cache: bool,
    /// Count totals exactly instead of using the collection estimate.
    pub exact_count: bool,
    /// Restrict reads to items owned by the acting identity.
    pub only_owned: bool,
    /// Release the acquired collection as soon as the result is consumed.
    pub eager_cleanup: bool,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            suppress_hooks: false,
            suppress_auth: false,
            consistent_read: false,
            use_cache: false,
            exact_count: true,
            only_owned: false,
            eager_cleanup: false,
        }
    }
}
