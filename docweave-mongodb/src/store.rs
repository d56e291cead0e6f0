use async_trait::async_trait;
use bson::{Bson, DateTime, Document, doc};
use futures::TryStreamExt;
use mongodb::{
    Client, Collection as MongoCollection,
    error::{Error as MongoError, ErrorKind, WriteError, WriteFailure},
    options::{ClientOptions, CollectionOptions, ReadPreference, ReturnDocument, SelectionCriteria},
};
use tracing::debug;

use docweave_core::{
    backend::{AcquireOptions, CollectionHandle, Lease, StoreBackend, StoreBackendBuilder, Update},
    document::{ID_FIELD, id_label},
    error::{DocumentStoreError, DocumentStoreResult},
    filter::FilterNode,
    query::FindRequest,
    stage::Pipeline,
};

use crate::query::MongoFilterTranslator;

const DUPLICATE_KEY: i32 = 11000;

fn backend_error(err: MongoError) -> DocumentStoreError {
    DocumentStoreError::Backend(err.to_string())
}

fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(WriteError { code: DUPLICATE_KEY, .. }))
    )
}

/// Rejects collection names MongoDB reserves or cannot address.
fn check_collection_name(name: &str) -> DocumentStoreResult<()> {
    if name.is_empty() || name.contains('$') || name.contains('\0') || name.starts_with("system.") {
        return Err(DocumentStoreError::ValidationFailed(format!(
            "collection name {name:?} is not allowed"
        )));
    }

    Ok(())
}

#[derive(Debug)]
pub struct MongoDbStore {
    client: Client,
    database: String,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    fn get_collection(&self, name: &str, consistent_read: bool) -> MongoCollection<Document> {
        let database = self.client.database(&self.database);

        if consistent_read {
            let options = CollectionOptions::builder()
                .selection_criteria(SelectionCriteria::ReadPreference(ReadPreference::Primary))
                .build();
            database.collection_with_options(name, options)
        } else {
            database.collection(name)
        }
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    type Handle = MongoCollectionHandle;

    async fn acquire_collection(
        &self,
        name: &str,
        options: AcquireOptions,
    ) -> DocumentStoreResult<Lease<Self::Handle>> {
        check_collection_name(name)?;
        debug!(collection = name, consistent_read = options.consistent_read, "acquiring collection");

        Ok(Lease::new(MongoCollectionHandle {
            collection: self.get_collection(name, options.consistent_read),
        }))
    }

    async fn create_collection(&self, name: &str) -> DocumentStoreResult<()> {
        check_collection_name(name)?;
        self.client
            .database(&self.database)
            .create_collection(name)
            .await
            .map_err(backend_error)?;

        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> DocumentStoreResult<()> {
        check_collection_name(name)?;
        self.get_collection(name, false)
            .drop()
            .await
            .map_err(backend_error)?;

        Ok(())
    }

    async fn list_collections(&self) -> DocumentStoreResult<Vec<String>> {
        self.client
            .database(&self.database)
            .list_collection_names()
            .await
            .map_err(backend_error)
    }

    async fn shutdown(self) -> DocumentStoreResult<()> {
        self.client.shutdown().await;

        Ok(())
    }
}

/// A handle on one MongoDB collection.
#[derive(Debug, Clone)]
pub struct MongoCollectionHandle {
    collection: MongoCollection<Document>,
}

#[async_trait]
impl CollectionHandle for MongoCollectionHandle {
    async fn find(&self, request: &FindRequest) -> DocumentStoreResult<Vec<Document>> {
        let mut find = self
            .collection
            .find(MongoFilterTranslator::translate(&request.filter)?)
            .skip(request.skip)
            .limit(i64::try_from(request.limit).unwrap_or(i64::MAX));
        if !request.sort.is_empty() {
            find = find.sort(request.sort.to_document());
        }

        find.await
            .map_err(backend_error)?
            .try_collect()
            .await
            .map_err(backend_error)
    }

    async fn aggregate(&self, pipeline: &Pipeline) -> DocumentStoreResult<Vec<Document>> {
        self.collection
            .aggregate(pipeline.to_documents())
            .await
            .map_err(backend_error)?
            .try_collect()
            .await
            .map_err(backend_error)
    }

    async fn count(&self, filter: &FilterNode) -> DocumentStoreResult<u64> {
        self.collection
            .count_documents(MongoFilterTranslator::translate(filter)?)
            .await
            .map_err(backend_error)
    }

    async fn estimated_count(&self) -> DocumentStoreResult<u64> {
        self.collection
            .estimated_document_count()
            .await
            .map_err(backend_error)
    }

    async fn distinct(&self, field: &str, filter: &FilterNode) -> DocumentStoreResult<Vec<Bson>> {
        self.collection
            .distinct(field, MongoFilterTranslator::translate(filter)?)
            .await
            .map_err(backend_error)
    }

    async fn insert_one(&self, document: Document) -> DocumentStoreResult<()> {
        let id = document.get(ID_FIELD).map(id_label).unwrap_or_default();

        match self.collection.insert_one(document).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(DocumentStoreError::DocumentAlreadyExists(
                id,
                self.collection.name().to_string(),
            )),
            Err(err) => Err(backend_error(err)),
        }
    }

    async fn find_by_id(&self, id: &Bson) -> DocumentStoreResult<Option<Document>> {
        self.collection
            .find_one(doc! { ID_FIELD: id.clone() })
            .await
            .map_err(backend_error)
    }

    async fn replace_one(&self, id: &Bson, document: Document) -> DocumentStoreResult<Option<Document>> {
        self.collection
            .find_one_and_replace(doc! { ID_FIELD: id.clone() }, document)
            .return_document(ReturnDocument::After)
            .await
            .map_err(backend_error)
    }

    async fn update_one(&self, id: &Bson, update: &Update) -> DocumentStoreResult<Option<Document>> {
        self.collection
            .find_one_and_update(doc! { ID_FIELD: id.clone() }, update.to_document(DateTime::now()))
            .return_document(ReturnDocument::After)
            .await
            .map_err(backend_error)
    }

    async fn delete_one(&self, id: &Bson) -> DocumentStoreResult<Option<Document>> {
        self.collection
            .find_one_and_delete(doc! { ID_FIELD: id.clone() })
            .await
            .map_err(backend_error)
    }
}

pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> DocumentStoreResult<Self::Backend> {
        Ok(MongoDbStore::new(
            Client::with_options(
                ClientOptions::parse(&self.dsn)
                    .await
                    .map_err(|e| DocumentStoreError::Initialization(e.to_string()))?,
            )
            .map_err(|e| DocumentStoreError::Initialization(e.to_string()))?,
            self.database,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_names() {
        assert!(check_collection_name("orders").is_ok());
        assert!(check_collection_name("").is_err());
        assert!(check_collection_name("system.users").is_err());
        assert!(check_collection_name("a$b").is_err());
    }
}
