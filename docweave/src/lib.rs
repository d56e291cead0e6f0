//! A fluent query, aggregation and pagination layer over JSON document databases.
//!
//! This crate is the entry point of docweave. It re-exports the core modules
//! and the available backends.
//!
//! # Features
//!
//! - **Fluent filters** - Comparison, membership, text and existence predicates combined with and/or/nor
//! - **Queries and pipelines** - Sorting, projection, joins, grouping with accumulators, `$out` and `$merge`
//! - **Pagination** - Paginated results that fetch their neighbouring pages
//! - **Hooks** - Per-collection before/after interception of every operation
//! - **Result caching** - TTL caches per category, flushed by name
//! - **Multiple backends** - In-memory and MongoDB (behind the `mongodb` feature)
//!
//! # Quick Start
//!
//! ```ignore
//! use docweave::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> DocumentStoreResult<()> {
//!     let store = DocumentStore::builder(InMemoryStore::builder().build().await?)
//!         .config(StoreConfig::new("shop"))
//!         .build()?;
//!     let orders = store.collection("orders");
//!
//!     orders.insert(doc! { "category": "books", "amount": 12 }).await?;
//!     orders.insert(doc! { "category": "games", "amount": 40 }).await?;
//!
//!     let page = orders
//!         .find(QueryBuilder::new().ge("amount", 10).descending("amount").limit(20))
//!         .await?;
//!     println!("{} of {} orders", page.len(), page.total_count());
//!
//!     let totals = orders
//!         .find(QueryBuilder::new().group_by(["category"]).sum("amount").count())
//!         .await?;
//!     println!("{:?}", totals.items());
//!
//!     store.shutdown().await
//! }
//! ```
//!
//! # Hooks
//!
//! ```ignore
//! use docweave::prelude::*;
//!
//! let hooks = HookRegistry::new().before("orders", Operation::Insert, |payload: HookPayload, _ctx: HookContext| async move {
//!     let mut item = payload.into_item()?;
//!     item.insert("status", "pending");
//!     Ok::<_, HookError>(Some(HookPayload::Item(item)))
//! });
//!
//! let store = DocumentStore::builder(InMemoryStore::new()).hooks(hooks).build()?;
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-process storage for development and testing
//! - `mongodb` - MongoDB storage (requires the `mongodb` feature)

pub mod prelude;

pub use docweave_core::{
    backend, cache, collection, document, error, filter, hook, identity, join, options, page, query, stage, store,
};

pub use bson;

/// In-memory storage backend.
pub mod memory {
    pub use docweave_memory::{InMemoryCollection, InMemoryStore, InMemoryStoreBuilder};
}

/// MongoDB storage backend.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docweave_mongodb::{MongoCollectionHandle, MongoDbStore, MongoDbStoreBuilder};
}

#[cfg(test)]
mod tests;
