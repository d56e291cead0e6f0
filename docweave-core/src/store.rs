//! Main document store interface.
//!
//! A [`DocumentStore`] binds a backend to its configuration, hook registry,
//! cache registry and identity provider, and hands out [`Collection`]s.
//!
//! # Example
//!
//! ```ignore
//! use docweave::prelude::*;
//!
//! let store = DocumentStore::builder(InMemoryStore::new())
//!     .config(StoreConfig::new("shop"))
//!     .hooks(hooks)
//!     .build()?;
//!
//! let orders = store.collection("orders");
//! ```

use std::sync::Arc;

use crate::{
    backend::StoreBackend,
    cache::CacheRegistry,
    collection::Collection,
    error::DocumentStoreResult,
    hook::HookRegistry,
    identity::{Anonymous, IdentityProvider},
    options::StoreConfig,
};

/// A document store bound to a specific backend implementation.
#[derive(Debug)]
pub struct DocumentStore<B: StoreBackend> {
    backend: B,
    config: StoreConfig,
    hooks: HookRegistry,
    caches: Arc<CacheRegistry>,
    identity: Arc<dyn IdentityProvider>,
}

impl<B: StoreBackend> DocumentStore<B> {
    /// Creates a store with the default configuration, no hooks and no identity.
    pub fn new(backend: B) -> Self {
        let config = StoreConfig::default();
        Self {
            backend,
            caches: Arc::new(CacheRegistry::new(&config)),
            config,
            hooks: HookRegistry::default(),
            identity: Arc::new(Anonymous),
        }
    }

    pub fn builder(backend: B) -> DocumentStoreBuilder<B> {
        DocumentStoreBuilder::new(backend)
    }

    /// Gets a collection handle with the given name.
    pub fn collection(&self, name: &str) -> Collection<'_, B> {
        Collection::new(name.to_string(), self)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn caches(&self) -> &Arc<CacheRegistry> {
        &self.caches
    }

    pub fn identity_provider(&self) -> &dyn IdentityProvider {
        self.identity.as_ref()
    }

    /// Flushes the named cache categories, or all of them when `categories`
    /// is empty.
    ///
    /// Accepted names: `permissions`, `query`, `aggregate`,
    /// `connectionSecrets`, `helperSecrets`, `connectionClients` and `secrets`
    /// for both secret categories.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::ValidationFailed`](crate::error::DocumentStoreError::ValidationFailed)
    /// for an unknown name. Nothing is flushed in that case.
    pub async fn flush_cache(&self, categories: &[&str]) -> DocumentStoreResult<()> {
        self.caches.flush(categories).await
    }

    /// Creates a new collection with the given name.
    pub async fn create_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.backend.create_collection(name).await
    }

    /// Drops (deletes) a collection with the given name.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection does not exist or deletion fails.
    pub async fn drop_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.backend.drop_collection(name).await
    }

    /// Lists all collections in the store.
    pub async fn list_collections(&self) -> DocumentStoreResult<Vec<String>> {
        self.backend.list_collections().await
    }

    /// Shuts down the store and its backend.
    pub async fn shutdown(self) -> DocumentStoreResult<()> {
        self.caches.flush_all().await;
        self.backend.shutdown().await
    }
}

/// Builder for [`DocumentStore`].
#[derive(Debug)]
pub struct DocumentStoreBuilder<B: StoreBackend> {
    backend: B,
    config: StoreConfig,
    hooks: HookRegistry,
    caches: Option<Arc<CacheRegistry>>,
    identity: Arc<dyn IdentityProvider>,
}

impl<B: StoreBackend> DocumentStoreBuilder<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: StoreConfig::default(),
            hooks: HookRegistry::default(),
            caches: None,
            identity: Arc::new(Anonymous),
        }
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Shares an existing cache registry instead of creating one from the config.
    pub fn cache_registry(mut self, caches: Arc<CacheRegistry>) -> Self {
        self.caches = Some(caches);
        self
    }

    pub fn identity_provider(mut self, provider: impl IdentityProvider + 'static) -> Self {
        self.identity = Arc::new(provider);
        self
    }

    /// Validates the configuration and builds the store.
    pub fn build(self) -> DocumentStoreResult<DocumentStore<B>> {
        self.config.validate()?;

        Ok(DocumentStore {
            caches: self
                .caches
                .unwrap_or_else(|| Arc::new(CacheRegistry::new(&self.config))),
            backend: self.backend,
            config: self.config,
            hooks: self.hooks,
            identity: self.identity,
        })
    }
}
