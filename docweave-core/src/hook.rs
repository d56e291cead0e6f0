//! Before/after hooks around collection operations.
//!
//! Hooks are registered per collection under a [`HookName`] such as
//! `beforeInsert` or `afterQuery`. A before hook receives the operation's
//! primary argument, an after hook receives its result. Either may return a
//! replacement payload of the same kind, or `None` to leave it unchanged.
//!
//! Failures are handled by phase:
//!
//! - a failing before hook aborts mutating operations with
//!   [`DocumentStoreError::HookFailure`]. Reads log the failure and continue
//!   with the original argument.
//! - a failing after hook is logged and the original result is returned.
//!
//! A hook returning a payload of the wrong kind counts as a failure.
//!
//! ```ignore
//! let hooks = HookRegistry::new().before("orders", Operation::Insert, |payload, _ctx| async move {
//!     let HookPayload::Item(mut item) = payload else { return Ok(None) };
//!     item.insert("status", "pending");
//!     Ok(Some(HookPayload::Item(item)))
//! });
//! ```

use std::{
    collections::HashMap,
    error::Error,
    fmt::{self, Display},
    future::Future,
    mem,
    sync::Arc,
};

use async_trait::async_trait;
use bson::{Bson, Document};
use tracing::{debug, warn};

use crate::{
    backend::Update,
    error::{DocumentStoreError, DocumentStoreResult},
    query::QueryBuilder,
};

/// The operations hooks can intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Query,
    Count,
    Distinct,
    Aggregate,
    Insert,
    Update,
    Replace,
    Push,
    Pull,
    Increment,
    Multiply,
    Remove,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Query => "query",
            Operation::Count => "count",
            Operation::Distinct => "distinct",
            Operation::Aggregate => "aggregate",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Replace => "replace",
            Operation::Push => "push",
            Operation::Pull => "pull",
            Operation::Increment => "increment",
            Operation::Multiply => "multiply",
            Operation::Remove => "remove",
        }
    }

    /// Returns `true` for operations that write.
    pub fn is_mutating(self) -> bool {
        !matches!(
            self,
            Operation::Get | Operation::Query | Operation::Count | Operation::Distinct | Operation::Aggregate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Before,
    After,
}

/// A hook slot, displayed as `before<Op>` or `after<Op>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookName {
    pub phase: HookPhase,
    pub operation: Operation,
}

impl HookName {
    pub fn before(operation: Operation) -> Self {
        Self { phase: HookPhase::Before, operation }
    }

    pub fn after(operation: Operation) -> Self {
        Self { phase: HookPhase::After, operation }
    }
}

impl Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            HookPhase::Before => "before",
            HookPhase::After => "after",
        };
        let name = self.operation.name();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => write!(f, "{phase}{}{}", first.to_ascii_uppercase(), chars.as_str()),
            None => f.write_str(phase),
        }
    }
}

/// Per-call metadata passed to hooks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookContext {
    pub database: String,
    pub collection: String,
    /// The acting identity, if one resolved.
    pub identity: Option<String>,
    pub roles: Vec<String>,
}

/// The argument or result passed through a hook.
#[derive(Debug, Clone)]
pub enum HookPayload {
    /// The query of `query`, `count`, `distinct` and `aggregate` before hooks.
    Query(QueryBuilder),
    /// The identity argument of `get` and `remove`.
    ItemId(Bson),
    /// An item to write, or a written item.
    Item(Document),
    /// The target and modification of `update`, `push`, `pull`, `increment` and `multiply`.
    Patch { id: Bson, update: Update },
    /// Read results.
    Items(Vec<Bson>),
    /// The result of `get` and `remove`.
    MaybeItem(Option<Document>),
    Count(u64),
}

impl HookPayload {
    /// The variant name, for messages.
    pub fn kind(&self) -> &'static str {
        match self {
            HookPayload::Query(_) => "query",
            HookPayload::ItemId(_) => "item id",
            HookPayload::Item(_) => "item",
            HookPayload::Patch { .. } => "patch",
            HookPayload::Items(_) => "items",
            HookPayload::MaybeItem(_) => "optional item",
            HookPayload::Count(_) => "count",
        }
    }

    fn same_kind(&self, other: &HookPayload) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }

    fn mismatch(&self, expected: &str) -> DocumentStoreError {
        DocumentStoreError::ValidationFailed(format!("expected {expected} payload, found {}", self.kind()))
    }

    pub fn into_query(self) -> DocumentStoreResult<QueryBuilder> {
        match self {
            HookPayload::Query(query) => Ok(query),
            other => Err(other.mismatch("query")),
        }
    }

    pub fn into_item_id(self) -> DocumentStoreResult<Bson> {
        match self {
            HookPayload::ItemId(id) => Ok(id),
            other => Err(other.mismatch("item id")),
        }
    }

    pub fn into_item(self) -> DocumentStoreResult<Document> {
        match self {
            HookPayload::Item(item) => Ok(item),
            other => Err(other.mismatch("item")),
        }
    }

    pub fn into_patch(self) -> DocumentStoreResult<(Bson, Update)> {
        match self {
            HookPayload::Patch { id, update } => Ok((id, update)),
            other => Err(other.mismatch("patch")),
        }
    }

    pub fn into_items(self) -> DocumentStoreResult<Vec<Bson>> {
        match self {
            HookPayload::Items(items) => Ok(items),
            other => Err(other.mismatch("items")),
        }
    }

    pub fn into_maybe_item(self) -> DocumentStoreResult<Option<Document>> {
        match self {
            HookPayload::MaybeItem(item) => Ok(item),
            other => Err(other.mismatch("optional item")),
        }
    }

    pub fn into_count(self) -> DocumentStoreResult<u64> {
        match self {
            HookPayload::Count(count) => Ok(count),
            other => Err(other.mismatch("count")),
        }
    }
}

/// Error returned by a hook.
pub type HookError = Box<dyn Error + Send + Sync>;

/// What a hook returns: `Some` replaces the payload, `None` keeps it.
pub type HookResult = Result<Option<HookPayload>, HookError>;

/// A registered hook.
///
/// Implemented for async closures taking the payload and the context.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, payload: HookPayload, context: HookContext) -> HookResult;
}

#[async_trait]
impl<F, Fut> Hook for F
where
    F: Fn(HookPayload, HookContext) -> Fut + Send + Sync,
    Fut: Future<Output = HookResult> + Send + 'static,
{
    async fn call(&self, payload: HookPayload, context: HookContext) -> HookResult {
        (self)(payload, context).await
    }
}

/// Hooks keyed by collection and [`HookName`].
///
/// Built before the store is shared; the store only reads it.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<(String, HookName), Arc<dyn Hook>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.hooks.keys().map(|(collection, name)| format!("{collection}.{name}")))
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `hook`, replacing any hook already registered under the same name.
    pub fn register(mut self, collection: impl Into<String>, name: HookName, hook: impl Hook + 'static) -> Self {
        self.hooks.insert((collection.into(), name), Arc::new(hook));
        self
    }

    pub fn before(self, collection: impl Into<String>, operation: Operation, hook: impl Hook + 'static) -> Self {
        self.register(collection, HookName::before(operation), hook)
    }

    pub fn after(self, collection: impl Into<String>, operation: Operation, hook: impl Hook + 'static) -> Self {
        self.register(collection, HookName::after(operation), hook)
    }

    pub fn contains(&self, collection: &str, name: HookName) -> bool {
        self.hooks.contains_key(&(collection.to_string(), name))
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Invokes the hook registered for `collection` and `name`.
    ///
    /// Returns `Ok(None)` when no hook is registered.
    pub async fn invoke(
        &self,
        collection: &str,
        name: HookName,
        payload: HookPayload,
        context: &HookContext,
    ) -> HookResult {
        match self.hooks.get(&(collection.to_string(), name)) {
            Some(hook) => hook.call(payload, context.clone()).await,
            None => Ok(None),
        }
    }

    async fn run(
        &self,
        name: HookName,
        payload: &HookPayload,
        context: &HookContext,
    ) -> Result<Option<HookPayload>, String> {
        match self.invoke(&context.collection, name, payload.clone(), context).await {
            Ok(Some(replacement)) if replacement.same_kind(payload) => Ok(Some(replacement)),
            Ok(Some(replacement)) => Err(format!(
                "returned a {} payload where a {} payload was expected",
                replacement.kind(),
                payload.kind()
            )),
            Ok(None) => Ok(None),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Runs the before hook of `operation` on its argument.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::HookFailure`] if the hook fails and the
    /// operation is mutating.
    pub async fn run_before(
        &self,
        operation: Operation,
        payload: HookPayload,
        context: &HookContext,
    ) -> DocumentStoreResult<HookPayload> {
        let name = HookName::before(operation);
        if !self.contains(&context.collection, name) {
            return Ok(payload);
        }

        match self.run(name, &payload, context).await {
            Ok(Some(replacement)) => {
                debug!(hook = %name, collection = %context.collection, "hook replaced argument");
                Ok(replacement)
            }
            Ok(None) => Ok(payload),
            Err(message) if operation.is_mutating() => Err(DocumentStoreError::HookFailure {
                hook: name.to_string(),
                collection: context.collection.clone(),
                message,
            }),
            Err(message) => {
                warn!(hook = %name, collection = %context.collection, error = %message, "hook failed, continuing with original argument");
                Ok(payload)
            }
        }
    }

    /// Runs the after hook of `operation` on its result. Never fails.
    pub async fn run_after(&self, operation: Operation, result: HookPayload, context: &HookContext) -> HookPayload {
        let name = HookName::after(operation);
        if !self.contains(&context.collection, name) {
            return result;
        }

        match self.run(name, &result, context).await {
            Ok(Some(replacement)) => {
                debug!(hook = %name, collection = %context.collection, "hook replaced result");
                replacement
            }
            Ok(None) => result,
            Err(message) => {
                warn!(hook = %name, collection = %context.collection, error = %message, "hook failed, returning original result");
                result
            }
        }
    }
}
