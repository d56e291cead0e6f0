//! In-memory storage implementation for document stores.
//!
//! This module provides a simple in-memory backend that keeps each collection
//! as a list of BSON documents in insertion order, behind an async-safe
//! read-write lock.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bson::{Bson, DateTime, Document};
use mea::rwlock::RwLock;
use tracing::trace;

use docweave_core::{
    backend::{AcquireOptions, CollectionHandle, Lease, StoreBackend, StoreBackendBuilder, Update},
    document::{ID_FIELD, UPDATED_FIELD, id_label},
    error::{DocumentStoreError, DocumentStoreResult},
    filter::FilterNode,
    query::FindRequest,
    stage::{Pipeline, Stage},
};

use crate::{
    evaluator::{Comparable, DocumentEvaluator, get_path, lookup_path, set_path, sort_documents},
    pipeline::run,
};

pub(crate) type StoreMap = HashMap<String, Vec<Document>>;

/// Thread-safe in-memory document storage backend.
///
/// This struct implements the [`StoreBackend`] trait with collections held
/// entirely in memory. Filters, sorts and aggregation pipelines are evaluated
/// in process with MongoDB semantics for the operators the query layer emits.
///
/// # Thread Safety
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, allowing
/// it to be safely shared across async tasks. Multiple clones of the same instance
/// share the same underlying data.
///
/// # Performance
///
/// Every read scans the whole collection (no indexing). For larger datasets,
/// consider using a persistent backend like MongoDB.
///
/// # Example
///
/// ```ignore
/// use docweave_memory::InMemoryStore;
/// use docweave::prelude::*;
///
/// let store = DocumentStore::new(InMemoryStore::new());
/// store.collection("users").insert(doc! { "name": "Alice" }).await?;
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    /// Collection name to documents, in insertion order.
    collections: Arc<RwLock<StoreMap>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder for constructing an `InMemoryStore`.
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    type Handle = InMemoryCollection;

    async fn acquire_collection(
        &self,
        name: &str,
        options: AcquireOptions,
    ) -> DocumentStoreResult<Lease<Self::Handle>> {
        trace!(collection = name, ?options, "acquiring in-memory collection");

        Ok(Lease::new(InMemoryCollection {
            name: name.to_string(),
            collections: self.collections.clone(),
        }))
    }

    async fn create_collection(&self, name: &str) -> DocumentStoreResult<()> {
        self.collections
            .write()
            .await
            .entry(name.to_string())
            .or_default();

        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> DocumentStoreResult<()> {
        let mut collections = self.collections.write().await;

        if collections.remove(name).is_none() {
            return Err(DocumentStoreError::CollectionNotFound(name.to_string()));
        }

        Ok(())
    }

    async fn list_collections(&self) -> DocumentStoreResult<Vec<String>> {
        let mut names = self
            .collections
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();

        Ok(names)
    }
}

/// A handle on one in-memory collection.
///
/// The handle shares the store map, so lookups can read other collections
/// and `$out`/`$merge` can write them.
#[derive(Clone, Debug)]
pub struct InMemoryCollection {
    name: String,
    collections: Arc<RwLock<StoreMap>>,
}

impl InMemoryCollection {
    fn position(documents: &[Document], id: &Bson) -> Option<usize> {
        let id = Comparable::from(id);
        documents
            .iter()
            .position(|document| document.get(ID_FIELD).is_some_and(|other| Comparable::from(other) == id))
    }
}

#[async_trait]
impl CollectionHandle for InMemoryCollection {
    async fn find(&self, request: &FindRequest) -> DocumentStoreResult<Vec<Document>> {
        let collections = self.collections.read().await;
        let Some(documents) = collections.get(&self.name) else {
            return Ok(Vec::new());
        };

        let mut matched = DocumentEvaluator::filter_documents(documents, &request.filter)?;
        sort_documents(&mut matched, &request.sort);

        Ok(matched
            .into_iter()
            .skip(usize::try_from(request.skip).unwrap_or(usize::MAX))
            .take(usize::try_from(request.limit).unwrap_or(usize::MAX))
            .collect())
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> DocumentStoreResult<Vec<Document>> {
        let writes = pipeline
            .stages()
            .iter()
            .any(|stage| matches!(stage, Stage::Out(_) | Stage::Merge(_)));

        if !writes {
            let collections = self.collections.read().await;
            let input = collections.get(&self.name).cloned().unwrap_or_default();
            return Ok(run(pipeline.stages(), input, &collections)?.rows);
        }

        let mut collections = self.collections.write().await;
        let input = collections.get(&self.name).cloned().unwrap_or_default();
        let output = run(pipeline.stages(), input, &collections)?;
        if let Some(sink) = output.sink {
            sink.apply(output.rows, &mut collections);
        }

        Ok(Vec::new())
    }

    async fn count(&self, filter: &FilterNode) -> DocumentStoreResult<u64> {
        let collections = self.collections.read().await;
        let Some(documents) = collections.get(&self.name) else {
            return Ok(0);
        };

        let predicate = filter.predicate()?;
        let mut count = 0;
        for document in documents {
            if DocumentEvaluator::new(document).evaluate(&predicate)? {
                count += 1;
            }
        }

        Ok(count)
    }

    async fn estimated_count(&self) -> DocumentStoreResult<u64> {
        Ok(self
            .collections
            .read()
            .await
            .get(&self.name)
            .map_or(0, |documents| documents.len() as u64))
    }

    async fn distinct(&self, field: &str, filter: &FilterNode) -> DocumentStoreResult<Vec<Bson>> {
        let collections = self.collections.read().await;
        let Some(documents) = collections.get(&self.name) else {
            return Ok(Vec::new());
        };

        let mut values: Vec<Bson> = Vec::new();
        for document in DocumentEvaluator::filter_documents(documents, filter)? {
            for value in lookup_path(&document, field) {
                let flattened = match value {
                    Bson::Array(items) => items.iter().collect::<Vec<_>>(),
                    single => vec![single],
                };
                for value in flattened {
                    let candidate = Comparable::from(value);
                    if !values.iter().any(|seen| Comparable::from(seen) == candidate) {
                        values.push(value.clone());
                    }
                }
            }
        }

        Ok(values)
    }

    async fn insert_one(&self, document: Document) -> DocumentStoreResult<()> {
        let mut collections = self.collections.write().await;
        let documents = collections.entry(self.name.clone()).or_default();

        if let Some(id) = document.get(ID_FIELD) {
            if Self::position(documents, id).is_some() {
                return Err(DocumentStoreError::DocumentAlreadyExists(id_label(id), self.name.clone()));
            }
        }

        documents.push(document);
        Ok(())
    }

    async fn find_by_id(&self, id: &Bson) -> DocumentStoreResult<Option<Document>> {
        let collections = self.collections.read().await;

        Ok(collections
            .get(&self.name)
            .and_then(|documents| Self::position(documents, id).map(|position| documents[position].clone())))
    }

    async fn replace_one(&self, id: &Bson, document: Document) -> DocumentStoreResult<Option<Document>> {
        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(&self.name) else {
            return Ok(None);
        };

        Ok(Self::position(documents, id).map(|position| {
            documents[position] = document.clone();
            document
        }))
    }

    async fn update_one(&self, id: &Bson, update: &Update) -> DocumentStoreResult<Option<Document>> {
        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(&self.name) else {
            return Ok(None);
        };
        let Some(position) = Self::position(documents, id) else {
            return Ok(None);
        };

        let mut updated = documents[position].clone();
        apply_update(&mut updated, update, DateTime::now())?;
        documents[position] = updated.clone();

        Ok(Some(updated))
    }

    async fn delete_one(&self, id: &Bson) -> DocumentStoreResult<Option<Document>> {
        let mut collections = self.collections.write().await;
        let Some(documents) = collections.get_mut(&self.name) else {
            return Ok(None);
        };

        Ok(Self::position(documents, id).map(|position| documents.remove(position)))
    }
}

/// Applies an update to a document, refreshing `_updatedDate`.
fn apply_update(document: &mut Document, update: &Update, now: DateTime) -> DocumentStoreResult<()> {
    match update {
        Update::Set(fields) => {
            for (field, value) in fields {
                set_path(document, field, value.clone());
            }
        }
        Update::Push { field, values } => {
            let mut items = match get_path(document, field) {
                Some(Bson::Array(items)) => items.clone(),
                None | Some(Bson::Null) => Vec::new(),
                Some(_) => return Err(not_an_array(field)),
            };
            items.extend(values.iter().cloned());
            set_path(document, field, Bson::Array(items));
        }
        Update::Pull { field, values } => match get_path(document, field) {
            Some(Bson::Array(items)) => {
                let kept = items
                    .iter()
                    .filter(|item| {
                        let item = Comparable::from(*item);
                        !values.iter().any(|value| Comparable::from(value) == item)
                    })
                    .cloned()
                    .collect::<Vec<_>>();
                set_path(document, field, Bson::Array(kept));
            }
            None => {}
            Some(_) => return Err(not_an_array(field)),
        },
        Update::Increment { field, by } => {
            let value = match get_path(document, field) {
                None => by.clone(),
                Some(current) => arithmetic(field, current, by, i64::checked_add, |a, b| a + b)?,
            };
            set_path(document, field, value);
        }
        Update::Multiply { field, by } => {
            let value = match get_path(document, field) {
                None => arithmetic(field, &Bson::Int32(0), by, i64::checked_mul, |a, b| a * b)?,
                Some(current) => arithmetic(field, current, by, i64::checked_mul, |a, b| a * b)?,
            };
            set_path(document, field, value);
        }
    }

    document.insert(UPDATED_FIELD, now);
    Ok(())
}

fn not_an_array(field: &str) -> DocumentStoreError {
    DocumentStoreError::InvalidDocument(format!("{field} is not an array"))
}

fn arithmetic(
    field: &str,
    current: &Bson,
    operand: &Bson,
    integer: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> DocumentStoreResult<Bson> {
    let overflow = || DocumentStoreError::InvalidDocument(format!("{field} overflowed"));

    Ok(match (current, operand) {
        (Bson::Int32(a), Bson::Int32(b)) => {
            let result = integer(*a as i64, *b as i64).ok_or_else(overflow)?;
            i32::try_from(result).map(Bson::Int32).unwrap_or(Bson::Int64(result))
        }
        (Bson::Int32(a), Bson::Int64(b)) => Bson::Int64(integer(*a as i64, *b).ok_or_else(overflow)?),
        (Bson::Int64(a), Bson::Int32(b)) => Bson::Int64(integer(*a, *b as i64).ok_or_else(overflow)?),
        (Bson::Int64(a), Bson::Int64(b)) => Bson::Int64(integer(*a, *b).ok_or_else(overflow)?),
        (Bson::Double(a), Bson::Double(b)) => Bson::Double(float(*a, *b)),
        (Bson::Double(a), Bson::Int32(b)) => Bson::Double(float(*a, *b as f64)),
        (Bson::Double(a), Bson::Int64(b)) => Bson::Double(float(*a, *b as f64)),
        (Bson::Int32(a), Bson::Double(b)) => Bson::Double(float(*a as f64, *b)),
        (Bson::Int64(a), Bson::Double(b)) => Bson::Double(float(*a as f64, *b)),
        _ => {
            return Err(DocumentStoreError::InvalidDocument(format!(
                "{field} is not numeric"
            )));
        }
    })
}

/// Builder for constructing [`InMemoryStore`] instances.
///
/// ```ignore
/// use docweave_memory::InMemoryStore;
/// use docweave::backend::StoreBackendBuilder;
///
/// let store = InMemoryStore::builder().build().await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStoreBuilder {
    seed: StoreMap,
}

impl InMemoryStoreBuilder {
    /// Adds documents to a collection before the store is built. Documents are
    /// stored as given, without sanitizing or stamping.
    pub fn with_documents(mut self, collection: impl Into<String>, documents: impl IntoIterator<Item = Document>) -> Self {
        self.seed.entry(collection.into()).or_default().extend(documents);
        self
    }
}

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    async fn build(self) -> DocumentStoreResult<Self::Backend> {
        Ok(InMemoryStore {
            collections: Arc::new(RwLock::new(self.seed)),
        })
    }
}
