//! TTL result caches and the process-wide cache registry.
//!
//! A [`ResultCache`] maps string keys to BSON snapshots. Entries expire once
//! their TTL has elapsed; expired entries are dropped lazily on read and by a
//! passive sweep that runs during writes, at most once per sweep interval.
//! There is no background task.
//!
//! A [`CacheRegistry`] holds one cache per [`CacheCategory`] and backs the
//! `flush_cache` entry point of the store. Registries are shared through an
//! `Arc`, so several stores can use the same caches.

use std::{
    collections::HashMap,
    fmt::{self, Display},
    str::FromStr,
    time::{Duration, Instant},
};

use bson::Bson;
use mea::rwlock::RwLock;
use tracing::debug;

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    options::StoreConfig,
};

/// Identifies one cached read result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub database: String,
    pub collection: String,
    pub page: i64,
    /// The serialized compiled request.
    pub query: String,
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.database, self.collection, self.page, self.query)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bson,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    last_sweep: Instant,
}

/// A keyed TTL store.
pub struct ResultCache {
    state: RwLock<CacheState>,
    ttl: Duration,
    sweep_interval: Duration,
    capacity: usize,
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("ttl", &self.ttl)
            .field("sweep_interval", &self.sweep_interval)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl ResultCache {
    pub fn new(ttl: Duration, sweep_interval: Duration, capacity: usize) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            ttl,
            sweep_interval,
            capacity,
        }
    }

    /// The TTL applied by [`ResultCache::set`].
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the live value for `key`.
    pub async fn get(&self, key: &str) -> Option<Bson> {
        let now = Instant::now();
        {
            let state = self.state.read().await;
            match state.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut state = self.state.write().await;
        if state.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            state.entries.remove(key);
        }

        None
    }

    /// Stores `value` under `key` with the default TTL.
    pub async fn set(&self, key: &str, value: Bson) -> DocumentStoreResult<()> {
        self.set_with_ttl(key, value, self.ttl).await
    }

    /// Stores `value` under `key`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Fails when the cache is full of live entries. Callers treat cache writes
    /// as best-effort.
    pub async fn set_with_ttl(&self, key: &str, value: Bson, ttl: Duration) -> DocumentStoreResult<()> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let full = state.entries.len() >= self.capacity && !state.entries.contains_key(key);
        if full || now.duration_since(state.last_sweep) >= self.sweep_interval {
            let before = state.entries.len();
            state.entries.retain(|_, entry| !entry.is_expired(now));
            state.last_sweep = now;
            debug!(evicted = before - state.entries.len(), "swept expired cache entries");
        }

        if state.entries.len() >= self.capacity && !state.entries.contains_key(key) {
            return Err(DocumentStoreError::Backend(format!(
                "result cache is full ({} entries)",
                self.capacity
            )));
        }

        state.entries.insert(key.to_string(), CacheEntry { value, expires_at: now + ttl });

        Ok(())
    }

    /// Drops expired entries and returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        state.last_sweep = now;

        before - state.entries.len()
    }

    /// Removes every entry.
    pub async fn flush(&self) {
        self.state.write().await.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// The caches managed by a [`CacheRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    /// Identity and permission lookups.
    Permissions,
    /// Find and distinct results.
    Query,
    /// Aggregation results.
    Aggregate,
    ConnectionSecrets,
    HelperSecrets,
    /// Registries of connected database clients.
    ConnectionClients,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 6] = [
        CacheCategory::Permissions,
        CacheCategory::Query,
        CacheCategory::Aggregate,
        CacheCategory::ConnectionSecrets,
        CacheCategory::HelperSecrets,
        CacheCategory::ConnectionClients,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CacheCategory::Permissions => "permissions",
            CacheCategory::Query => "query",
            CacheCategory::Aggregate => "aggregate",
            CacheCategory::ConnectionSecrets => "connectionSecrets",
            CacheCategory::HelperSecrets => "helperSecrets",
            CacheCategory::ConnectionClients => "connectionClients",
        }
    }

    /// Parses a category name. `secrets` names both secret categories.
    pub fn parse(name: &str) -> DocumentStoreResult<Vec<CacheCategory>> {
        if name == "secrets" {
            return Ok(vec![CacheCategory::ConnectionSecrets, CacheCategory::HelperSecrets]);
        }

        name.parse().map(|category| vec![category])
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl FromStr for CacheCategory {
    type Err = DocumentStoreError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        CacheCategory::ALL
            .into_iter()
            .find(|category| category.name() == name)
            .ok_or_else(|| DocumentStoreError::ValidationFailed(format!("unknown cache category {name}")))
    }
}

impl Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One [`ResultCache`] per [`CacheCategory`].
#[derive(Debug)]
pub struct CacheRegistry {
    caches: [ResultCache; 6],
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new(&StoreConfig::default())
    }
}

impl CacheRegistry {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            caches: CacheCategory::ALL
                .map(|_| ResultCache::new(config.ttl(), config.sweep_interval(), config.cache_capacity)),
        }
    }

    pub fn cache(&self, category: CacheCategory) -> &ResultCache {
        &self.caches[category.index()]
    }

    /// Flushes the named categories, or every category when `names` is empty.
    ///
    /// All names are parsed before anything is flushed.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::ValidationFailed`] for an unknown name.
    pub async fn flush(&self, names: &[&str]) -> DocumentStoreResult<()> {
        if names.is_empty() {
            self.flush_all().await;
            return Ok(());
        }

        let mut categories = Vec::new();
        for name in names {
            categories.extend(CacheCategory::parse(name)?);
        }

        for category in categories {
            debug!(%category, "flushing cache");
            self.cache(category).flush().await;
        }

        Ok(())
    }

    pub async fn flush_all(&self) {
        for category in CacheCategory::ALL {
            self.cache(category).flush().await;
        }
        debug!("flushed all caches");
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn cache(ttl: Duration, capacity: usize) -> ResultCache {
        ResultCache::new(ttl, Duration::from_secs(3600), capacity)
    }

    #[tokio::test]
    async fn test_get_after_set() {
        let cache = cache(Duration::from_secs(60), 10);
        cache.set("a", Bson::Int32(1)).await.unwrap();

        assert_eq!(cache.get("a").await, Some(Bson::Int32(1)));
        assert_eq!(cache.get("b").await, None);
    }

    #[tokio::test]
    async fn test_entries_expire_lazily() {
        let cache = cache(Duration::from_millis(20), 10);
        cache.set("a", Bson::Int32(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.get("a").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_full_cache_rejects_new_keys_until_entries_expire() {
        let cache = cache(Duration::from_millis(20), 1);
        cache.set("a", Bson::Int32(1)).await.unwrap();

        assert!(cache.set("b", Bson::Int32(2)).await.is_err());
        cache.set("a", Bson::Int32(3)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.set("b", Bson::Int32(2)).await.unwrap();
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let cache = cache(Duration::from_secs(60), 10);
        cache.set_with_ttl("short", Bson::Null, Duration::from_millis(10)).await.unwrap();
        cache.set("long", Bson::Null).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.evict_expired().await, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[test]
    fn test_category_names() {
        assert_eq!(CacheCategory::parse("query").unwrap(), vec![CacheCategory::Query]);
        assert_eq!(
            CacheCategory::parse("secrets").unwrap(),
            vec![CacheCategory::ConnectionSecrets, CacheCategory::HelperSecrets]
        );
        assert!(CacheCategory::parse("sessions").is_err());
    }

    #[tokio::test]
    async fn test_flush_named_categories() {
        let registry = CacheRegistry::default();
        for category in CacheCategory::ALL {
            registry.cache(category).set("k", Bson::Null).await.unwrap();
        }

        registry.flush(&["query", "secrets"]).await.unwrap();

        assert!(registry.cache(CacheCategory::Query).is_empty().await);
        assert!(registry.cache(CacheCategory::ConnectionSecrets).is_empty().await);
        assert!(registry.cache(CacheCategory::HelperSecrets).is_empty().await);
        assert!(!registry.cache(CacheCategory::Aggregate).is_empty().await);

        registry.flush(&[]).await.unwrap();
        assert!(registry.cache(CacheCategory::Aggregate).is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_category_flushes_nothing() {
        let registry = CacheRegistry::default();
        registry.cache(CacheCategory::Query).set("k", Bson::Null).await.unwrap();

        assert!(registry.flush(&["query", "nope"]).await.is_err());
        assert!(!registry.cache(CacheCategory::Query).is_empty().await);
    }
}
