//! Acting identity resolution.
//!
//! The store never authorizes anything itself. It asks an [`IdentityProvider`]
//! who is acting, records that identity as the owner of new items, restricts
//! owned reads to it, and passes it to hooks.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::error::DocumentStoreResult;

/// The identity an operation is performed as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub roles: Vec<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), roles: Vec::new() }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

/// Resolves the acting identity for an operation.
///
/// Reads resolve with `allow_anonymous` set, so a provider may return a
/// visitor identity for them. Writes never do.
#[async_trait]
pub trait IdentityProvider: Send + Sync + Debug {
    async fn resolve_acting_identity(&self, allow_anonymous: bool) -> DocumentStoreResult<Option<Identity>>;
}

/// Provider for stores used without identities.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

#[async_trait]
impl IdentityProvider for Anonymous {
    async fn resolve_acting_identity(&self, _allow_anonymous: bool) -> DocumentStoreResult<Option<Identity>> {
        Ok(None)
    }
}

/// Provider that always acts as the same identity, e.g. a service account.
#[derive(Debug, Clone)]
pub struct FixedIdentity(pub Identity);

#[async_trait]
impl IdentityProvider for FixedIdentity {
    async fn resolve_acting_identity(&self, _allow_anonymous: bool) -> DocumentStoreResult<Option<Identity>> {
        Ok(Some(self.0.clone()))
    }
}
