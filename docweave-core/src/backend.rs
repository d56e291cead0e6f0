//! Storage backend abstraction for the document store.
//!
//! A [`StoreBackend`] is the connection collaborator: it hands out a
//! [`CollectionHandle`] per operation, wrapped in a [`Lease`] that may carry a
//! cleanup to run once the caller is done with the handle. The store acquires
//! exactly one lease per terminal operation.
//!
//! # Example
//!
//! ```ignore
//! use docweave::backend::{AcquireOptions, CollectionHandle, StoreBackend};
//!
//! let lease = backend.acquire_collection("orders", AcquireOptions::default()).await?;
//! let total = lease.handle().count(&FilterNode::new()).await?;
//! lease.release().await;
//! ```

use std::fmt::{self, Debug};

use async_trait::async_trait;
use bson::{Bson, DateTime, Document, doc};
use futures::future::BoxFuture;

use crate::{
    document::{PROTECTED_FIELDS, UPDATED_FIELD},
    error::{DocumentStoreError, DocumentStoreResult},
    filter::{FilterNode, validate_field},
    query::FindRequest,
    stage::Pipeline,
};

/// Deferred release of an acquired collection.
pub type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// How a collection is acquired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Acquire without applying authorization.
    pub suppress_auth: bool,
    /// Route reads to the primary.
    pub consistent_read: bool,
}

/// An acquired collection handle and its optional cleanup.
///
/// Dropping a lease without calling [`Lease::release`] leaves the cleanup to
/// the backend.
pub struct Lease<H> {
    handle: H,
    cleanup: Option<Cleanup>,
}

impl<H> Lease<H> {
    pub fn new(handle: H) -> Self {
        Self { handle, cleanup: None }
    }

    pub fn with_cleanup(mut self, cleanup: Cleanup) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn has_cleanup(&self) -> bool {
        self.cleanup.is_some()
    }

    /// Runs the cleanup, if any.
    pub async fn release(self) {
        if let Some(cleanup) = self.cleanup {
            cleanup().await;
        }
    }
}

impl<H: Debug> Debug for Lease<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("handle", &self.handle)
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// A partial modification of one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Sets the given fields.
    Set(Document),
    /// Appends values to an array field.
    Push { field: String, values: Vec<Bson> },
    /// Removes every occurrence of the values from an array field.
    Pull { field: String, values: Vec<Bson> },
    /// Adds to a numeric field.
    Increment { field: String, by: Bson },
    /// Multiplies a numeric field.
    Multiply { field: String, by: Bson },
}

impl Update {
    /// Checks field names and operands before the update is sent.
    pub fn validate(&self) -> DocumentStoreResult<()> {
        let field = match self {
            Update::Set(fields) => {
                if fields.is_empty() {
                    return Err(DocumentStoreError::ValidationFailed("update must set at least one field".into()));
                }
                return fields.keys().try_for_each(|field| check_mutable(field));
            }
            Update::Push { field, values } | Update::Pull { field, values } => {
                if values.is_empty() {
                    return Err(DocumentStoreError::ValidationFailed(format!(
                        "update of {field} requires at least one value"
                    )));
                }
                field
            }
            Update::Increment { field, by } | Update::Multiply { field, by } => {
                if !matches!(by, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) {
                    return Err(DocumentStoreError::ValidationFailed(format!(
                        "update of {field} requires a numeric operand"
                    )));
                }
                field
            }
        };

        check_mutable(field)
    }

    /// Renders the update document. Every update also refreshes `_updatedDate`.
    pub fn to_document(&self, updated_at: DateTime) -> Document {
        match self {
            Update::Set(fields) => {
                let mut fields = fields.clone();
                fields.insert(UPDATED_FIELD, updated_at);
                doc! { "$set": fields }
            }
            Update::Push { field, values } => doc! {
                "$push": { field.as_str(): { "$each": values.clone() } },
                "$set": { UPDATED_FIELD: updated_at },
            },
            Update::Pull { field, values } => doc! {
                "$pull": { field.as_str(): { "$in": values.clone() } },
                "$set": { UPDATED_FIELD: updated_at },
            },
            Update::Increment { field, by } => doc! {
                "$inc": { field.as_str(): by.clone() },
                "$set": { UPDATED_FIELD: updated_at },
            },
            Update::Multiply { field, by } => doc! {
                "$mul": { field.as_str(): by.clone() },
                "$set": { UPDATED_FIELD: updated_at },
            },
        }
    }
}

fn check_mutable(field: &str) -> DocumentStoreResult<()> {
    validate_field(field)?;
    if PROTECTED_FIELDS.contains(&field) || field == UPDATED_FIELD {
        return Err(DocumentStoreError::ValidationFailed(format!("{field} cannot be updated")));
    }

    Ok(())
}

/// Operations on one acquired collection.
///
/// Missing collections behave as empty ones for reads.
#[async_trait]
pub trait CollectionHandle: Send + Sync {
    /// Runs a find request.
    async fn find(&self, request: &FindRequest) -> DocumentStoreResult<Vec<Document>>;

    /// Runs an aggregation pipeline.
    async fn aggregate(&self, pipeline: &Pipeline) -> DocumentStoreResult<Vec<Document>>;

    /// Counts the items matching `filter`.
    async fn count(&self, filter: &FilterNode) -> DocumentStoreResult<u64>;

    /// Returns the collection size from metadata, without applying a filter.
    async fn estimated_count(&self) -> DocumentStoreResult<u64>;

    /// Returns the distinct values of `field` among the items matching `filter`.
    async fn distinct(&self, field: &str, filter: &FilterNode) -> DocumentStoreResult<Vec<Bson>>;

    /// Inserts an item.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::DocumentAlreadyExists`] if the `_id` is taken.
    async fn insert_one(&self, document: Document) -> DocumentStoreResult<()>;

    /// Reads one item by identity.
    async fn find_by_id(&self, id: &Bson) -> DocumentStoreResult<Option<Document>>;

    /// Replaces one item and returns the stored replacement, or `None` if
    /// nothing had that identity.
    async fn replace_one(&self, id: &Bson, document: Document) -> DocumentStoreResult<Option<Document>>;

    /// Applies an update and returns the updated item, or `None` if nothing
    /// had that identity.
    async fn update_one(&self, id: &Bson, update: &Update) -> DocumentStoreResult<Option<Document>>;

    /// Deletes one item and returns it, or `None` if nothing had that identity.
    async fn delete_one(&self, id: &Bson) -> DocumentStoreResult<Option<Document>>;
}

/// The connection collaborator.
///
/// Implementations must be thread-safe; a store shares one backend across
/// all concurrent operations.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    type Handle: CollectionHandle;

    /// Acquires a handle on the named collection.
    async fn acquire_collection(
        &self,
        name: &str,
        options: AcquireOptions,
    ) -> DocumentStoreResult<Lease<Self::Handle>>;

    /// Creates an empty collection. Existing collections are left as they are.
    async fn create_collection(&self, name: &str) -> DocumentStoreResult<()>;

    /// Drops a collection and all its items.
    async fn drop_collection(&self, name: &str) -> DocumentStoreResult<()>;

    async fn list_collections(&self) -> DocumentStoreResult<Vec<String>>;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op.
    async fn shutdown(self) -> DocumentStoreResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// Factory for backends that need asynchronous setup.
#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> DocumentStoreResult<Self::Backend>;
}
