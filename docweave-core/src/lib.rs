//! A fluent query, aggregation and pagination layer over JSON document databases.
//!
//! This crate is the core of the docweave project and provides:
//!
//! - **Predicates** ([`filter`]) - A fluent builder compiling to document filters
//! - **Joins** ([`join`]) - Lookups into other collections with limits, counts and unwinding
//! - **Pipeline stages** ([`stage`]) - Typed stages and the assembler that orders them
//! - **Queries** ([`query`]) - The query builder and its compiled requests
//! - **Pagination** ([`page`]) - Page cursors and paginated results
//! - **Hooks** ([`hook`]) - Per-collection interception of operations
//! - **Result caching** ([`cache`]) - TTL caches per category
//! - **Collections and the store** ([`collection`], [`store`]) - The entry points
//! - **Backends** ([`backend`]) and **identities** ([`identity`]) - The collaborators a store drives
//! - **Error handling** ([`error`]) - Error and result types
//!
//! # Example
//!
//! ```ignore
//! use docweave_core::{query::QueryBuilder, store::DocumentStore};
//!
//! let store = DocumentStore::new(backend);
//! let totals = store
//!     .collection("orders")
//!     .find(QueryBuilder::new().group_by(["category"]).sum("amount").count())
//!     .await?;
//! ```

pub mod backend;
pub mod cache;
pub mod collection;
pub mod document;
pub mod error;
pub mod filter;
pub mod hook;
pub mod identity;
pub mod join;
pub mod options;
pub mod page;
pub mod query;
pub mod stage;
pub mod store;
