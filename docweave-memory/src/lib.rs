//! In-memory document storage backend for docweave.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreBackend` trait.
//! It evaluates filters, sorts and aggregation pipelines in process and is ideal
//! for development and testing.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware RwLock
//! - **Filter evaluation** - Comparison, membership, text and existence operators on dotted paths
//! - **Pipelines** - Grouping with accumulators, lookups, unwinding, projection, `$out` and `$merge`
//!
//! # Quick Start
//!
//! ```ignore
//! use docweave::{prelude::*, memory::InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = InMemoryStore::builder().build().await?;
//!     let store = DocumentStore::new(backend);
//!
//!     store.collection("orders").insert(doc! { "category": "books", "amount": 12 }).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod evaluator;
mod pipeline;
pub mod store;

pub use store::{InMemoryCollection, InMemoryStore, InMemoryStoreBuilder};
