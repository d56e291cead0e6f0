//! MongoDB backend for docweave.
//!
//! Filters are validated and rendered through the shared predicate parser,
//! pipelines are sent to the server unchanged, and item updates use the
//! `findOneAnd*` family so the changed item comes back in one round trip.
//!
//! Enable it through the `mongodb` feature of the facade crate:
//!
//! ```toml
//! [dependencies]
//! docweave = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use docweave::{backend::StoreBackendBuilder, mongodb::MongoDbStore, store::DocumentStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MongoDbStore::builder("mongodb://localhost:27017", "shop")
//!         .build()
//!         .await?;
//!     let store = DocumentStore::new(backend);
//!
//!     Ok(())
//! }
//! ```

mod query;
pub mod store;

pub use store::{MongoCollectionHandle, MongoDbStore, MongoDbStoreBuilder};
