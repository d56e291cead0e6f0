//! Collection-level operations.
//!
//! A [`Collection`] is a named view of one collection in a [`DocumentStore`],
//! carrying the [`OperationOptions`] its calls run with. Every terminal
//! operation resolves the acting identity, runs the before hook, acquires the
//! collection once, runs the after hook and returns.
//!
//! # Example
//!
//! ```ignore
//! use docweave::prelude::*;
//!
//! let orders = store.collection("orders");
//! let order = orders.insert(doc! { "category": "books", "amount": 12 }).await?;
//!
//! let books = orders
//!     .find(QueryBuilder::new().eq("category", "books").descending("amount").limit(20))
//!     .await?;
//! for order in books.items_as::<Order>()? {
//!     println!("{order:?}");
//! }
//! ```

use std::fmt;

use bson::{Bson, DateTime, Document};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    backend::{AcquireOptions, CollectionHandle, Lease, StoreBackend, Update},
    document::{
        ID_FIELD, OWNER_FIELD, as_count, from_bson, id_label, sanitize, sanitize_value, stamp_new,
        stamp_replacement, to_document,
    },
    error::{DocumentStoreError, DocumentStoreResult},
    filter::validate_field,
    hook::{HookContext, HookPayload, Operation},
    options::OperationOptions,
    page::{PageCursor, PaginatedResult, ResultMode, count_rows},
    query::QueryBuilder,
    store::DocumentStore,
};

/// A collection within a [`DocumentStore`].
pub struct Collection<'a, B: StoreBackend> {
    name: String,
    store: &'a DocumentStore<B>,
    options: OperationOptions,
}

impl<B: StoreBackend> Clone for Collection<'_, B> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: self.store,
            options: self.options,
        }
    }
}

impl<B: StoreBackend> fmt::Debug for Collection<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("database", &self.store.config().database)
            .field("options", &self.options)
            .finish()
    }
}

impl<'a, B: StoreBackend> Collection<'a, B> {
    pub(crate) fn new(name: String, store: &'a DocumentStore<B>) -> Self {
        Self { name, store, options: OperationOptions::default() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> OperationOptions {
        self.options
    }

    /// Returns this collection with the given options for subsequent calls.
    pub fn with_options(mut self, options: OperationOptions) -> Self {
        self.options = options;
        self
    }

    pub(crate) fn store(&self) -> &'a DocumentStore<B> {
        self.store
    }

    /// Builds the hook context, resolving the acting identity unless
    /// authorization is suppressed.
    pub(crate) async fn context(&self, allow_anonymous: bool) -> DocumentStoreResult<HookContext> {
        let mut context = HookContext {
            database: self.store.config().database.clone(),
            collection: self.name.clone(),
            ..Default::default()
        };

        if !self.options.suppress_auth {
            let identity = self
                .store
                .identity_provider()
                .resolve_acting_identity(allow_anonymous)
                .await?;
            if let Some(identity) = identity {
                context.identity = Some(identity.id);
                context.roles = identity.roles;
            }
        }

        Ok(context)
    }

    /// The owner reads are restricted to, if any.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::ValidationFailed`] when owned reads are
    /// requested without an acting identity.
    pub(crate) fn owner<'c>(&self, context: &'c HookContext) -> DocumentStoreResult<Option<&'c str>> {
        if !self.options.only_owned {
            return Ok(None);
        }

        match context.identity.as_deref() {
            Some(owner) => Ok(Some(owner)),
            None => Err(DocumentStoreError::ValidationFailed(
                "owned reads require an acting identity".into(),
            )),
        }
    }

    pub(crate) async fn before(
        &self,
        operation: Operation,
        payload: HookPayload,
        context: &HookContext,
    ) -> DocumentStoreResult<HookPayload> {
        if self.options.suppress_hooks {
            return Ok(payload);
        }

        self.store.hooks().run_before(operation, payload, context).await
    }

    pub(crate) async fn after(&self, operation: Operation, result: HookPayload, context: &HookContext) -> HookPayload {
        if self.options.suppress_hooks {
            return result;
        }

        self.store.hooks().run_after(operation, result, context).await
    }

    pub(crate) async fn acquire(&self, operation: Operation) -> DocumentStoreResult<Lease<B::Handle>> {
        let options = AcquireOptions {
            suppress_auth: self.options.suppress_auth,
            consistent_read: self.options.consistent_read,
        };

        self.store
            .backend()
            .acquire_collection(&self.name, options)
            .await
            .map_err(|err| err.in_operation(operation.name(), &self.name))
    }

    /// Runs the lease cleanup when eager cleanup was requested.
    pub(crate) async fn release(&self, lease: Lease<B::Handle>) {
        if self.options.eager_cleanup {
            lease.release().await;
        }
    }

    async fn finish<T>(
        &self,
        operation: Operation,
        lease: Lease<B::Handle>,
        result: DocumentStoreResult<T>,
    ) -> DocumentStoreResult<T> {
        self.release(lease).await;
        result.map_err(|err| err.in_operation(operation.name(), &self.name))
    }

    async fn read(
        &self,
        operation: Operation,
        query: QueryBuilder,
        mode: ResultMode,
    ) -> DocumentStoreResult<PaginatedResult<'a, B>> {
        let context = self.context(true).await?;
        let query = self
            .before(operation, HookPayload::Query(query), &context)
            .await?
            .into_query()?;
        let spec = query.build()?;

        PageCursor::new(self.clone(), spec, mode).resolve_in(context).await
    }

    /// Runs a query and returns its first page.
    ///
    /// Plain queries run as find requests. Queries with joins, grouping or
    /// extra stages run as aggregation pipelines.
    pub async fn find(&self, query: QueryBuilder) -> DocumentStoreResult<PaginatedResult<'a, B>> {
        self.read(Operation::Query, query, ResultMode::Find).await
    }

    /// Runs a query as an aggregation pipeline and returns its first page.
    pub async fn run(&self, query: QueryBuilder) -> DocumentStoreResult<PaginatedResult<'a, B>> {
        self.read(Operation::Aggregate, query, ResultMode::Run).await
    }

    /// Returns the first page of distinct values of `field` among the items
    /// matching the query.
    pub async fn distinct(&self, query: QueryBuilder, field: &str) -> DocumentStoreResult<PaginatedResult<'a, B>> {
        validate_field(field)?;
        self.read(Operation::Distinct, query, ResultMode::Distinct(field.to_string()))
            .await
    }

    /// Builds a cursor on the first page of a query without resolving it.
    ///
    /// The before hook does not run for cursors. The after hook runs each time
    /// the cursor resolves.
    pub fn cursor(&self, query: QueryBuilder) -> DocumentStoreResult<PageCursor<'a, B>> {
        Ok(PageCursor::new(self.clone(), query.build()?, ResultMode::Find))
    }

    /// Counts the rows a query yields.
    pub async fn count(&self, query: QueryBuilder) -> DocumentStoreResult<u64> {
        let context = self.context(true).await?;
        let query = self
            .before(Operation::Count, HookPayload::Query(query), &context)
            .await?
            .into_query()?;
        let spec = query.build()?;
        let request = spec.count_request(self.owner(&context)?)?;

        let lease = self.acquire(Operation::Count).await?;
        let result = count_rows(lease.handle(), request, self.options.exact_count).await;
        let count = self.finish(Operation::Count, lease, result).await?;

        self.after(Operation::Count, HookPayload::Count(count), &context)
            .await
            .into_count()
    }

    /// Counts the distinct values of `field` among the items matching the query.
    pub async fn count_distinct(&self, query: QueryBuilder, field: &str) -> DocumentStoreResult<u64> {
        let context = self.context(true).await?;
        let query = self
            .before(Operation::Count, HookPayload::Query(query), &context)
            .await?
            .into_query()?;
        let spec = query.build()?;
        let pipeline = spec.distinct_count_pipeline(field, self.owner(&context)?)?;

        let lease = self.acquire(Operation::Count).await?;
        let result = lease.handle().aggregate(&pipeline).await.map(|rows| {
            rows.first()
                .and_then(|row| row.get("count"))
                .and_then(as_count)
                .unwrap_or(0)
        });
        let count = self.finish(Operation::Count, lease, result).await?;

        self.after(Operation::Count, HookPayload::Count(count), &context)
            .await
            .into_count()
    }

    /// Reads one item by identity. A missing item is `Ok(None)`.
    pub async fn get(&self, id: impl Into<Bson>) -> DocumentStoreResult<Option<Document>> {
        let context = self.context(true).await?;
        let id = self
            .before(Operation::Get, HookPayload::ItemId(id.into()), &context)
            .await?
            .into_item_id()?;
        let owner = self.owner(&context)?;

        let lease = self.acquire(Operation::Get).await?;
        let result = lease.handle().find_by_id(&id).await;
        let item = self
            .finish(Operation::Get, lease, result)
            .await?
            .filter(|item| owner.is_none_or(|owner| item.get_str(OWNER_FIELD).is_ok_and(|o| o == owner)));

        self.after(Operation::Get, HookPayload::MaybeItem(item), &context)
            .await
            .into_maybe_item()
    }

    /// Reads one item by identity and deserializes it.
    pub async fn get_as<T: DeserializeOwned>(&self, id: impl Into<Bson>) -> DocumentStoreResult<Option<T>> {
        self.get(id)
            .await?
            .map(|item| from_bson(Bson::Document(item)))
            .transpose()
    }

    async fn before_insert(&self, item: Document, context: &HookContext) -> DocumentStoreResult<Document> {
        let item = self
            .before(Operation::Insert, HookPayload::Item(item), context)
            .await?
            .into_item()?;

        Ok(stamp_new(sanitize(&item)?, context.identity.as_deref(), DateTime::now()))
    }

    async fn before_replace(
        &self,
        id: Bson,
        mut item: Document,
        context: &HookContext,
    ) -> DocumentStoreResult<(Bson, Document)> {
        item.insert(ID_FIELD, id);
        let item = self
            .before(Operation::Replace, HookPayload::Item(item), context)
            .await?
            .into_item()?;
        let id = item
            .get(ID_FIELD)
            .cloned()
            .ok_or_else(|| DocumentStoreError::InvalidDocument("replacement has no _id".into()))?;

        Ok((id, sanitize(&item)?))
    }

    /// Inserts an item and returns it as stored.
    ///
    /// The item gets a generated `_id` if it has none, both timestamps and
    /// the acting identity as `_owner`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::InvalidDocument`] for keys that start
    /// with `$` or contain NUL, and
    /// [`DocumentStoreError::DocumentAlreadyExists`] if the `_id` is taken.
    pub async fn insert(&self, item: Document) -> DocumentStoreResult<Document> {
        let context = self.context(false).await?;
        let item = self.before_insert(item, &context).await?;

        let lease = self.acquire(Operation::Insert).await?;
        let result = lease.handle().insert_one(item.clone()).await;
        self.finish(Operation::Insert, lease, result).await?;

        self.after(Operation::Insert, HookPayload::Item(item), &context)
            .await
            .into_item()
    }

    /// Serializes and inserts an item.
    pub async fn insert_as<T: Serialize>(&self, item: &T) -> DocumentStoreResult<Document> {
        self.insert(to_document(item)?).await
    }

    /// Replaces the item with identity `id`, keeping its `_id`, creation time
    /// and owner.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::DocumentNotFound`] if no item has that identity.
    pub async fn replace(&self, id: impl Into<Bson>, item: Document) -> DocumentStoreResult<Document> {
        let context = self.context(false).await?;
        let (id, item) = self.before_replace(id.into(), item, &context).await?;

        let lease = self.acquire(Operation::Replace).await?;
        let result = async {
            match lease.handle().find_by_id(&id).await? {
                Some(existing) => {
                    let replacement = stamp_replacement(item, &existing, DateTime::now());
                    lease.handle().replace_one(&id, replacement).await
                }
                None => Ok(None),
            }
        }
        .await;
        let replaced = self
            .finish(Operation::Replace, lease, result)
            .await?
            .ok_or_else(|| DocumentStoreError::DocumentNotFound(id_label(&id), self.name.clone()))?;

        self.after(Operation::Replace, HookPayload::Item(replaced), &context)
            .await
            .into_item()
    }

    /// Replaces the item if its `_id` is stored, otherwise inserts it.
    ///
    /// The existence check and the write share one acquired collection. The
    /// insert or replace hooks run depending on which write happens.
    pub async fn save(&self, item: Document) -> DocumentStoreResult<Document> {
        let context = self.context(false).await?;

        let lease = self.acquire(Operation::Replace).await?;
        let result = self.save_on(lease.handle(), item, &context).await;
        let (operation, saved) = self.finish(Operation::Replace, lease, result).await?;

        self.after(operation, HookPayload::Item(saved), &context)
            .await
            .into_item()
    }

    async fn save_on(
        &self,
        handle: &B::Handle,
        item: Document,
        context: &HookContext,
    ) -> DocumentStoreResult<(Operation, Document)> {
        let existing = match item.get(ID_FIELD) {
            Some(id) => handle.find_by_id(id).await?,
            None => None,
        };

        match (item.get(ID_FIELD).cloned(), existing) {
            (Some(id), Some(existing)) => {
                let (id, item) = self.before_replace(id, item, context).await?;
                let replacement = stamp_replacement(item, &existing, DateTime::now());
                let replaced = handle
                    .replace_one(&id, replacement)
                    .await?
                    .ok_or_else(|| DocumentStoreError::DocumentNotFound(id_label(&id), self.name.clone()))?;
                Ok((Operation::Replace, replaced))
            }
            _ => {
                let item = self.before_insert(item, context).await?;
                handle
                    .insert_one(item.clone())
                    .await
                    .map_err(|err| err.in_operation(Operation::Insert.name(), &self.name))?;
                Ok((Operation::Insert, item))
            }
        }
    }

    async fn patch(&self, operation: Operation, id: Bson, update: Update) -> DocumentStoreResult<Document> {
        let context = self.context(false).await?;
        let (id, update) = self
            .before(operation, HookPayload::Patch { id, update }, &context)
            .await?
            .into_patch()?;
        update.validate()?;
        let update = match update {
            Update::Set(fields) => Update::Set(sanitize(&fields)?),
            Update::Push { field, values } => Update::Push {
                field,
                values: values.iter().map(sanitize_value).collect::<DocumentStoreResult<_>>()?,
            },
            other => other,
        };

        let lease = self.acquire(operation).await?;
        let result = lease.handle().update_one(&id, &update).await;
        let updated = self
            .finish(operation, lease, result)
            .await?
            .ok_or_else(|| DocumentStoreError::DocumentNotFound(id_label(&id), self.name.clone()))?;

        self.after(operation, HookPayload::Item(updated), &context)
            .await
            .into_item()
    }

    /// Sets the given fields on one item and returns the updated item.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::ValidationFailed`] when a field is managed
    /// by the store, and [`DocumentStoreError::DocumentNotFound`] if no item
    /// has that identity.
    pub async fn update(&self, id: impl Into<Bson>, fields: Document) -> DocumentStoreResult<Document> {
        self.patch(Operation::Update, id.into(), Update::Set(fields)).await
    }

    /// Appends values to an array field.
    pub async fn push<I, V>(&self, id: impl Into<Bson>, field: &str, values: I) -> DocumentStoreResult<Document>
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        let update = Update::Push {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        };
        self.patch(Operation::Push, id.into(), update).await
    }

    /// Removes every occurrence of the values from an array field.
    pub async fn pull<I, V>(&self, id: impl Into<Bson>, field: &str, values: I) -> DocumentStoreResult<Document>
    where
        I: IntoIterator<Item = V>,
        V: Into<Bson>,
    {
        let update = Update::Pull {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        };
        self.patch(Operation::Pull, id.into(), update).await
    }

    /// Adds `by` to a numeric field. A missing field counts as zero.
    pub async fn increment(&self, id: impl Into<Bson>, field: &str, by: impl Into<Bson>) -> DocumentStoreResult<Document> {
        let update = Update::Increment { field: field.to_string(), by: by.into() };
        self.patch(Operation::Increment, id.into(), update).await
    }

    /// Multiplies a numeric field by `by`. A missing field becomes zero.
    pub async fn multiply(&self, id: impl Into<Bson>, field: &str, by: impl Into<Bson>) -> DocumentStoreResult<Document> {
        let update = Update::Multiply { field: field.to_string(), by: by.into() };
        self.patch(Operation::Multiply, id.into(), update).await
    }

    /// Deletes one item and returns it, or `None` if nothing had that identity.
    pub async fn remove(&self, id: impl Into<Bson>) -> DocumentStoreResult<Option<Document>> {
        let context = self.context(false).await?;
        let id = self
            .before(Operation::Remove, HookPayload::ItemId(id.into()), &context)
            .await?
            .into_item_id()?;

        let lease = self.acquire(Operation::Remove).await?;
        let result = lease.handle().delete_one(&id).await;
        let removed = self.finish(Operation::Remove, lease, result).await?;

        self.after(Operation::Remove, HookPayload::MaybeItem(removed), &context)
            .await
            .into_maybe_item()
    }
}
