//! Error types and result types for document store operations.
//!
//! This module provides error handling for every layer of the crate: builder
//! validation, pipeline assembly, hook interception and backend execution.
//! Use [`DocumentStoreResult<T>`] as the return type for fallible operations.

use std::sync::Arc;

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors that can occur when interacting with a document store.
///
/// Validation and assembly errors ([`ValidationFailed`](Self::ValidationFailed),
/// [`AlreadyGrouped`](Self::AlreadyGrouped), [`TooManyGroupStages`](Self::TooManyGroupStages))
/// are raised before any backend is touched. Execution errors carry the operation
/// and collection they happened in, with the backend error attached as the source.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocumentStoreError {
    /// A builder received a malformed or missing argument.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
    /// The group-by-fields operation was called more than once on the same builder.
    #[error("Query is already grouped")]
    AlreadyGrouped,
    /// An assembled pipeline contained more than one `$group` stage.
    #[error("Pipeline contains {0} $group stages, at most one is allowed")]
    TooManyGroupStages(usize),
    /// A before/after hook rejected the operation.
    #[error("Hook {hook} failed in collection {collection}: {message}")]
    HookFailure {
        /// The hook name, e.g. `beforeInsert`.
        hook: String,
        /// The collection the hook is registered for.
        collection: String,
        /// The failure reported by the hook.
        message: String,
    },
    /// The underlying database call failed.
    #[error("{operation} on collection {collection} failed: {source}")]
    Execution {
        /// The operation name, e.g. `insert`.
        operation: String,
        /// The collection the operation targeted.
        collection: String,
        /// The originating backend error.
        #[source]
        source: Arc<DocumentStoreError>,
    },
    /// Serialization/deserialization error when converting between document formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error during store initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// A document with the given ID already exists in the collection.
    /// The first argument is the document ID, the second is the collection name.
    #[error("Document {0} already exists in collection {1}")]
    DocumentAlreadyExists(String, String),
    /// A mutating operation targeted a document that does not exist.
    /// The first argument is the document ID, the second is the collection name.
    #[error("Document not found {0} in collection {1}")]
    DocumentNotFound(String, String),
    /// The requested collection does not exist in the store.
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    /// The document violates structural constraints.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// An error occurred in the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl DocumentStoreError {
    /// Wraps this error with the operation and collection it occurred in.
    ///
    /// Errors raised before execution (validation, assembly, hooks) and errors
    /// that are already wrapped are returned unchanged.
    pub fn in_operation(self, operation: &str, collection: &str) -> Self {
        match self {
            DocumentStoreError::ValidationFailed(_)
            | DocumentStoreError::AlreadyGrouped
            | DocumentStoreError::TooManyGroupStages(_)
            | DocumentStoreError::HookFailure { .. }
            | DocumentStoreError::Execution { .. } => self,
            other => DocumentStoreError::Execution {
                operation: operation.to_string(),
                collection: collection.to_string(),
                source: Arc::new(other),
            },
        }
    }
}

/// A specialized `Result` type for document store operations.
///
/// This type alias is used throughout the crate to indicate operations that may fail
/// with a [`DocumentStoreError`].
pub type DocumentStoreResult<T> = Result<T, DocumentStoreError>;

impl From<BsonError> for DocumentStoreError {
    fn from(err: BsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for DocumentStoreError {
    fn from(err: SerdeJsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_backend_errors_are_wrapped_with_context() {
        let err = DocumentStoreError::Backend("connection reset".into()).in_operation("insert", "orders");

        assert!(matches!(
            &err,
            DocumentStoreError::Execution { operation, collection, .. }
                if operation == "insert" && collection == "orders"
        ));
        assert_eq!(
            err.source().map(|source| source.to_string()),
            Some("Backend error: connection reset".to_string())
        );
    }

    #[test]
    fn test_validation_errors_are_not_wrapped() {
        let err = DocumentStoreError::AlreadyGrouped.in_operation("aggregate", "orders");
        assert_eq!(err, DocumentStoreError::AlreadyGrouped);
    }
}
