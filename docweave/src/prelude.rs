//! Convenient re-exports of commonly used types from docweave.
//!
//! ```ignore
//! use docweave::prelude::*;
//! ```
//!
//! This brings in the store and collection types, the query, filter and join
//! builders, hooks, options, errors and the in-memory backend.

pub use bson::{Bson, Document, doc};

pub use docweave_core::{
    backend::{StoreBackend, StoreBackendBuilder},
    collection::Collection,
    error::{DocumentStoreError, DocumentStoreResult},
    filter::Filter,
    hook::{HookContext, HookError, HookPayload, HookRegistry, HookResult, Operation},
    identity::{Anonymous, FixedIdentity, Identity, IdentityProvider},
    join::Join,
    options::{OperationOptions, StoreConfig},
    page::{PageCursor, PaginatedResult},
    query::QueryBuilder,
    stage::{SortDirection, SortSpec, Stage},
    store::{DocumentStore, DocumentStoreBuilder},
};
pub use docweave_memory::InMemoryStore;
