//! Paginated execution of compiled queries.
//!
//! A [`PageCursor`] is a query that has not run yet. Resolving it executes the
//! compiled request, determines the total number of rows and produces a
//! [`PaginatedResult`]. [`PaginatedResult::next`] and [`PaginatedResult::prev`]
//! resolve a new cursor over the same compiled query at the adjacent page and
//! return a new result, so several positions can be held at once.
//!
//! The offset of a page is the explicit skip plus the pages before it:
//! `skip + (page - 1) * page_size`.

use std::sync::Arc;

use bson::{Bson, Document, doc};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{
    backend::{CollectionHandle, StoreBackend},
    cache::{CacheCategory, CacheKey},
    collection::Collection,
    document::{as_count, from_bson, to_json},
    error::DocumentStoreResult,
    filter::FilterNode,
    hook::{HookContext, HookPayload, Operation},
    query::{CompiledRequest, CountRequest, QuerySpec, TOTAL_FIELD},
};

/// Position of one page within a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageState {
    page: i64,
    page_size: u64,
    skip: u64,
}

impl PageState {
    /// Creates a page position. Pages are 1-based; `skip` is the explicit
    /// skip supplied with the query.
    pub fn new(page: i64, page_size: u64, skip: u64) -> Self {
        Self { page, page_size: page_size.max(1), skip }
    }

    pub fn page(&self) -> i64 {
        self.page
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn skip(&self) -> u64 {
        self.skip
    }

    /// Number of rows before this page, never negative.
    pub fn offset(&self) -> u64 {
        let offset = self.skip as i128 + (self.page as i128 - 1) * self.page_size as i128;
        offset.clamp(0, u64::MAX as i128) as u64
    }

    /// Returns `true` if rows remain after this page.
    pub fn has_next(&self, total_count: u64) -> bool {
        self.offset().saturating_add(self.page_size) < total_count
    }

    /// Returns `true` if a full page precedes this one.
    pub fn has_prev(&self) -> bool {
        self.offset() >= self.page_size
    }

    pub fn total_pages(&self, total_count: u64) -> u64 {
        total_count.div_ceil(self.page_size)
    }

    pub fn next(&self) -> Self {
        Self { page: self.page + 1, ..*self }
    }

    /// The previous page. Without a full page before this one, the position
    /// stays put.
    pub fn prev(&self) -> Self {
        if !self.has_prev() {
            return *self;
        }

        Self { page: self.page - 1, ..*self }
    }
}

/// How a cursor reads its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResultMode {
    /// A find request, or a pipeline when the query needs one.
    Find,
    /// Always a pipeline.
    Run,
    /// The distinct values of a field.
    Distinct(String),
}

impl ResultMode {
    fn operation(&self) -> Operation {
        match self {
            ResultMode::Find => Operation::Query,
            ResultMode::Run => Operation::Aggregate,
            ResultMode::Distinct(_) => Operation::Distinct,
        }
    }
}

enum PageRequest {
    Compiled(CompiledRequest),
    Distinct { field: String, filter: FilterNode },
}

/// A query at a page position that has not been executed yet.
#[derive(Debug)]
pub struct PageCursor<'a, B: StoreBackend> {
    collection: Collection<'a, B>,
    spec: Arc<QuerySpec>,
    mode: ResultMode,
    page: PageState,
}

impl<B: StoreBackend> Clone for PageCursor<'_, B> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            spec: self.spec.clone(),
            mode: self.mode.clone(),
            page: self.page,
        }
    }
}

impl<'a, B: StoreBackend> PageCursor<'a, B> {
    pub(crate) fn new(collection: Collection<'a, B>, spec: QuerySpec, mode: ResultMode) -> Self {
        let page_size = spec.page_size(collection.store().config().default_page_size);
        let page = PageState::new(1, page_size, spec.skip());
        Self { collection, spec: Arc::new(spec), mode, page }
    }

    pub fn page(&self) -> &PageState {
        &self.page
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// The same query at another page position.
    pub fn at(&self, page: PageState) -> Self {
        Self { page, ..self.clone() }
    }

    /// Executes the query for this page.
    pub async fn resolve(self) -> DocumentStoreResult<PaginatedResult<'a, B>> {
        let context = self.collection.context(true).await?;
        self.resolve_in(context).await
    }

    pub(crate) async fn resolve_in(self, context: HookContext) -> DocumentStoreResult<PaginatedResult<'a, B>> {
        let operation = self.mode.operation();
        let (items, total_count, from_cache) = self
            .fetch(&context)
            .await
            .map_err(|err| err.in_operation(operation.name(), self.collection.name()))?;

        let items = self
            .collection
            .after(operation, HookPayload::Items(items), &context)
            .await
            .into_items()?;

        Ok(PaginatedResult { items, total_count, from_cache, cursor: self })
    }

    fn request(&self, owner: Option<&str>) -> DocumentStoreResult<(PageRequest, Document)> {
        Ok(match &self.mode {
            ResultMode::Distinct(field) => {
                let filter = self.spec.distinct_filter(owner);
                let key = doc! {
                    "distinct": field.as_str(),
                    "filter": filter.as_document().clone(),
                    "skip": self.page.offset() as i64,
                    "limit": self.page.page_size() as i64,
                };
                (PageRequest::Distinct { field: field.clone(), filter }, key)
            }
            mode => {
                let compiled = self.spec.compile(&self.page, owner, *mode == ResultMode::Run)?;
                let key = compiled.to_document();
                (PageRequest::Compiled(compiled), key)
            }
        })
    }

    async fn fetch(&self, context: &HookContext) -> DocumentStoreResult<(Vec<Bson>, u64, bool)> {
        let owner = self.collection.owner(context)?;
        let (request, key) = self.request(owner)?;
        let options = self.collection.options();

        let category = match &request {
            PageRequest::Compiled(CompiledRequest::Aggregate(_)) => CacheCategory::Aggregate,
            _ => CacheCategory::Query,
        };
        let key = CacheKey {
            database: context.database.clone(),
            collection: context.collection.clone(),
            page: self.page.page(),
            query: to_json(Bson::Document(key)).to_string(),
        }
        .to_string();
        let cache = self.collection.store().caches().cache(category);

        if options.use_cache {
            if let Some((items, total_count)) = cache.get(&key).await.and_then(decode_snapshot) {
                debug!(collection = %context.collection, page = self.page.page(), "result cache hit");
                return Ok((items, total_count, true));
            }
            debug!(collection = %context.collection, page = self.page.page(), "result cache miss");
        }

        let lease = self.collection.acquire(self.mode.operation()).await?;
        let result = self.execute(lease.handle(), &request, owner).await;
        self.collection.release(lease).await;
        let (items, total_count) = result?;

        if options.use_cache {
            if let Err(err) = cache.set(&key, encode_snapshot(&items, total_count)).await {
                warn!(collection = %context.collection, error = %err, "failed to cache result");
            }
        }

        Ok((items, total_count, false))
    }

    async fn execute(
        &self,
        handle: &B::Handle,
        request: &PageRequest,
        owner: Option<&str>,
    ) -> DocumentStoreResult<(Vec<Bson>, u64)> {
        let documents = match request {
            PageRequest::Compiled(CompiledRequest::Find(find)) => handle.find(find).await?,
            PageRequest::Compiled(CompiledRequest::Aggregate(pipeline)) => handle.aggregate(pipeline).await?,
            PageRequest::Distinct { field, filter } => {
                let values = handle.distinct(field, filter).await?;
                let total_count = values.len() as u64;
                let page = values
                    .into_iter()
                    .skip(usize::try_from(self.page.offset()).unwrap_or(usize::MAX))
                    .take(usize::try_from(self.page.page_size()).unwrap_or(usize::MAX))
                    .collect();
                return Ok((page, total_count));
            }
        };

        let exact = self.collection.options().exact_count;
        let total_count = count_rows(handle, self.spec.count_request(owner)?, exact).await?;
        Ok((documents.into_iter().map(Bson::Document).collect(), total_count))
    }
}

/// Reads the total number of rows of a [`CountRequest`].
///
/// Plain document counts fall back to the collection estimate unless `exact`
/// is set. Pipeline counts read `total` from their single row; no row means
/// nothing matched.
pub(crate) async fn count_rows<H: CollectionHandle>(
    handle: &H,
    request: CountRequest,
    exact: bool,
) -> DocumentStoreResult<u64> {
    match request {
        CountRequest::Documents(_) if !exact => handle.estimated_count().await,
        CountRequest::Documents(filter) => handle.count(&filter).await,
        CountRequest::Pipeline(pipeline) => Ok(handle
            .aggregate(&pipeline)
            .await?
            .first()
            .and_then(|row| row.get(TOTAL_FIELD))
            .and_then(as_count)
            .unwrap_or(0)),
    }
}

fn encode_snapshot(items: &[Bson], total_count: u64) -> Bson {
    Bson::Document(doc! {
        "items": items.to_vec(),
        "totalCount": total_count as i64,
    })
}

fn decode_snapshot(snapshot: Bson) -> Option<(Vec<Bson>, u64)> {
    let Bson::Document(mut snapshot) = snapshot else {
        return None;
    };
    let total_count = snapshot.get("totalCount").and_then(as_count)?;
    match snapshot.remove("items") {
        Some(Bson::Array(items)) => Some((items, total_count)),
        _ => None,
    }
}

/// One resolved page of results.
///
/// Reading a resolved result never touches the database. Moving to another
/// page resolves a new result and leaves this one untouched.
#[derive(Debug)]
pub struct PaginatedResult<'a, B: StoreBackend> {
    items: Vec<Bson>,
    total_count: u64,
    from_cache: bool,
    cursor: PageCursor<'a, B>,
}

impl<'a, B: StoreBackend> PaginatedResult<'a, B> {
    pub fn items(&self) -> &[Bson] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Bson> {
        self.items
    }

    /// Deserializes the items of this page.
    pub fn items_as<T: DeserializeOwned>(&self) -> DocumentStoreResult<Vec<T>> {
        self.items.iter().cloned().map(from_bson).collect()
    }

    /// Number of items on this page.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total number of rows across all pages, exact or estimated.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn total_pages(&self) -> u64 {
        self.cursor.page.total_pages(self.total_count)
    }

    /// The 1-based page number.
    pub fn page(&self) -> i64 {
        self.cursor.page.page()
    }

    pub fn page_size(&self) -> u64 {
        self.cursor.page.page_size()
    }

    pub fn has_next(&self) -> bool {
        self.cursor.page.has_next(self.total_count)
    }

    pub fn has_prev(&self) -> bool {
        self.cursor.page.has_prev()
    }

    /// Returns `true` if this page was served from the result cache.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Resolves the following page.
    pub async fn next(&self) -> DocumentStoreResult<PaginatedResult<'a, B>> {
        self.cursor.at(self.cursor.page.next()).resolve().await
    }

    /// Resolves the preceding page.
    pub async fn prev(&self) -> DocumentStoreResult<PaginatedResult<'a, B>> {
        self.cursor.at(self.cursor.page.prev()).resolve().await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_has_next_boundaries() {
        assert!(PageState::new(1, 50, 0).has_next(120));
        assert!(PageState::new(2, 50, 0).has_next(120));
        assert!(!PageState::new(3, 50, 0).has_next(120));
        assert!(!PageState::new(1, 50, 0).has_next(50));
        assert!(!PageState::new(1, 50, 0).has_next(0));
    }

    #[test]
    fn test_has_prev() {
        assert!(!PageState::new(1, 10, 0).has_prev());
        assert!(PageState::new(2, 10, 0).has_prev());
        assert!(!PageState::new(1, 10, 5).has_prev());
        assert!(PageState::new(1, 10, 15).has_prev());
    }

    #[test]
    fn test_offset_adds_skip_to_page_offset() {
        assert_eq!(PageState::new(1, 10, 0).offset(), 0);
        assert_eq!(PageState::new(3, 10, 0).offset(), 20);
        assert_eq!(PageState::new(2, 10, 5).offset(), 15);
        assert_eq!(PageState::new(1, 10, 15).prev().offset(), 5);
        assert_eq!(PageState::new(1, 10, 0).prev().offset(), 0);
    }

    #[test]
    fn test_prev_of_first_page_stays_on_first_page() {
        let first = PageState::new(1, 10, 0);
        assert_eq!(first.prev(), first);
        assert_eq!(PageState::new(3, 10, 0).prev().page(), 2);
    }

    #[test]
    fn test_total_pages() {
        assert_eq!(PageState::new(1, 50, 0).total_pages(120), 3);
        assert_eq!(PageState::new(1, 50, 0).total_pages(100), 2);
        assert_eq!(PageState::new(1, 50, 0).total_pages(0), 0);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let items = vec![Bson::Document(doc! { "a": 1 }), Bson::Document(doc! { "a": 2 })];
        assert_eq!(decode_snapshot(encode_snapshot(&items, 7)), Some((items, 7)));
        assert_eq!(decode_snapshot(Bson::Null), None);
    }
}
