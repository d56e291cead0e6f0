//! Query construction and compilation.
//!
//! A [`QueryBuilder`] collects filter, sort, shape and aggregation calls. Its
//! terminal form, [`QuerySpec`], is immutable and compiles into either a plain
//! [`FindRequest`] or an aggregation [`Pipeline`] for a given [`PageState`].
//!
//! A find request is used only when there are no joins, no projection beyond
//! `_id`, no grouping and no raw stages. Everything else goes through the
//! pipeline, assembled in the fixed [`Slot`] order.
//!
//! # Example
//!
//! ```ignore
//! use docweave::prelude::*;
//!
//! let query = QueryBuilder::new()
//!     .eq("status", "active")
//!     .ascending("createdAt")
//!     .include(Join::new("author", "members"))
//!     .limit(20);
//! ```

use bson::{Bson, Document, doc};
use tracing::debug;

use crate::{
    document::OWNER_FIELD,
    error::{DocumentStoreError, DocumentStoreResult},
    filter::{Filter, FilterNode, validate_field},
    join::Join,
    page::PageState,
    stage::{
        Accumulator, AssemblyMode, GroupKey, GroupSpec, Pipeline, Projection, Slot, SortDirection,
        SortSpec, Stage, StageAssembler,
    },
};

/// Output field of the counting stage appended to count pipelines.
pub const TOTAL_FIELD: &str = "total";

/// Fluent builder for read and aggregation requests.
///
/// Like [`Filter`], every method consumes and returns the builder and the
/// first invalid argument is recorded rather than panicking. [`QueryBuilder::build`]
/// reports it before anything is executed.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    filter: Filter,
    sort: SortSpec,
    fields: Vec<String>,
    joins: Vec<Join>,
    skip: u64,
    limit: Option<u64>,
    assembler: StageAssembler,
    out: Option<String>,
    merge: Option<String>,
    error: Option<DocumentStoreError>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn fail(mut self, err: DocumentStoreError) -> Self {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self
    }

    fn with_filter(mut self, apply: impl FnOnce(Filter) -> Filter) -> Self {
        self.filter = apply(std::mem::take(&mut self.filter));
        self
    }

    /// Adds every predicate of `filter` to this query.
    pub fn filter(self, filter: impl Into<Filter>) -> Self {
        self.with_filter(|current| current.and(filter))
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with_filter(|filter| filter.eq(field, value))
    }

    pub fn ne(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with_filter(|filter| filter.ne(field, value))
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with_filter(|filter| filter.gt(field, value))
    }

    pub fn ge(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with_filter(|filter| filter.ge(field, value))
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with_filter(|filter| filter.lt(field, value))
    }

    pub fn le(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.with_filter(|filter| filter.le(field, value))
    }

    pub fn between(self, field: impl Into<String>, start: impl Into<Bson>, end: impl Into<Bson>) -> Self {
        self.with_filter(|filter| filter.between(field, start, end))
    }

    pub fn contains(self, field: impl Into<String>, text: impl Into<String>) -> Self {
        self.with_filter(|filter| filter.contains(field, text))
    }

    pub fn starts_with(self, field: impl Into<String>, text: impl Into<String>) -> Self {
        self.with_filter(|filter| filter.starts_with(field, text))
    }

    pub fn ends_with(self, field: impl Into<String>, text: impl Into<String>) -> Self {
        self.with_filter(|filter| filter.ends_with(field, text))
    }

    pub fn has_all(self, field: impl Into<String>, values: impl Into<Bson>) -> Self {
        self.with_filter(|filter| filter.has_all(field, values))
    }

    pub fn has_some(self, field: impl Into<String>, values: impl Into<Bson>) -> Self {
        self.with_filter(|filter| filter.has_some(field, values))
    }

    pub fn is_empty(self, field: impl Into<String>) -> Self {
        self.with_filter(|filter| filter.is_empty(field))
    }

    pub fn is_not_empty(self, field: impl Into<String>) -> Self {
        self.with_filter(|filter| filter.is_not_empty(field))
    }

    pub fn and(self, other: impl Into<Filter>) -> Self {
        self.with_filter(|filter| filter.and(other))
    }

    pub fn or(self, other: impl Into<Filter>) -> Self {
        self.with_filter(|filter| filter.or(other))
    }

    pub fn not(self, other: impl Into<Filter>) -> Self {
        self.with_filter(|filter| filter.not(other))
    }

    /// Sorts results by `field` in ascending order.
    ///
    /// After grouping, the sort applies to the grouped rows.
    pub fn ascending(self, field: impl Into<String>) -> Self {
        self.order_by(field.into(), SortDirection::Ascending)
    }

    /// Sorts results by `field` in descending order.
    ///
    /// After grouping, the sort applies to the grouped rows.
    pub fn descending(self, field: impl Into<String>) -> Self {
        self.order_by(field.into(), SortDirection::Descending)
    }

    fn order_by(mut self, field: String, direction: SortDirection) -> Self {
        if let Err(err) = validate_field(&field) {
            return self.fail(err);
        }

        if self.assembler.is_grouped() {
            self.assembler.sort_grouped(field, direction);
        } else {
            self.sort.push(field, direction);
        }
        self
    }

    /// Restricts returned documents to the given fields.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            let field = field.into();
            if let Err(err) = validate_field(&field) {
                return self.fail(err);
            }
            if !self.fields.contains(&field) {
                self.fields.push(field);
            }
        }
        self
    }

    /// Attaches the documents referenced by a field.
    pub fn include(mut self, join: Join) -> Self {
        if let Err(err) = join.validate() {
            return self.fail(err);
        }
        self.joins.push(join);
        self
    }

    /// Sets the page size.
    pub fn limit(mut self, limit: u64) -> Self {
        if limit == 0 {
            return self.fail(DocumentStoreError::ValidationFailed("limit must be greater than zero".into()));
        }
        self.limit = Some(limit);
        self
    }

    /// Skips `skip` documents before the first page.
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    /// Groups documents by the given fields.
    ///
    /// Fails with [`DocumentStoreError::AlreadyGrouped`] when called twice.
    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = fields.into_iter().map(Into::into).collect();
        match self.assembler.group_by(fields) {
            Ok(()) => self,
            Err(err) => self.fail(err),
        }
    }

    fn calculate(mut self, name: String, accumulator: Accumulator, field: &str) -> Self {
        let result = validate_field(field).and_then(|_| self.assembler.calculate(name, accumulator));
        match result {
            Ok(()) => self,
            Err(err) => self.fail(err),
        }
    }

    /// Averages `field` into `<field>Avg`.
    pub fn avg(self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.avg_as(field.clone(), format!("{field}Avg"))
    }

    /// Averages `field` into `output`.
    pub fn avg_as(self, field: impl Into<String>, output: impl Into<String>) -> Self {
        let field = field.into();
        self.calculate(output.into(), Accumulator::Avg(field.clone()), &field)
    }

    /// Takes the minimum of `field` into `<field>Min`.
    pub fn min(self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.min_as(field.clone(), format!("{field}Min"))
    }

    pub fn min_as(self, field: impl Into<String>, output: impl Into<String>) -> Self {
        let field = field.into();
        self.calculate(output.into(), Accumulator::Min(field.clone()), &field)
    }

    /// Takes the maximum of `field` into `<field>Max`.
    pub fn max(self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.max_as(field.clone(), format!("{field}Max"))
    }

    pub fn max_as(self, field: impl Into<String>, output: impl Into<String>) -> Self {
        let field = field.into();
        self.calculate(output.into(), Accumulator::Max(field.clone()), &field)
    }

    /// Sums `field` into `<field>Sum`.
    pub fn sum(self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.sum_as(field.clone(), format!("{field}Sum"))
    }

    pub fn sum_as(self, field: impl Into<String>, output: impl Into<String>) -> Self {
        let field = field.into();
        self.calculate(output.into(), Accumulator::Sum(field.clone()), &field)
    }

    /// Counts the documents of each group into `count`.
    pub fn count(mut self) -> Self {
        self.assembler.count();
        self
    }

    /// Filters grouped rows.
    pub fn having(mut self, filter: impl Into<Filter>) -> Self {
        match filter.into().build() {
            Ok(node) => {
                self.assembler.having(node);
                self
            }
            Err(err) => self.fail(err),
        }
    }

    /// Writes the pipeline output to `collection`, replacing its contents.
    pub fn out(mut self, collection: impl Into<String>) -> Self {
        self.out = Some(collection.into());
        self
    }

    /// Merges the pipeline output into `collection` by `_id`.
    pub fn merge_into(mut self, collection: impl Into<String>) -> Self {
        self.merge = Some(collection.into());
        self
    }

    /// Adds a raw stage at its default position in the pipeline.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.assembler.push(stage.default_slot(), stage);
        self
    }

    /// Validates the builder and freezes it into a [`QuerySpec`].
    ///
    /// # Errors
    ///
    /// Returns the first error recorded by a builder call, or an assembly error
    /// such as [`DocumentStoreError::TooManyGroupStages`].
    pub fn build(self) -> DocumentStoreResult<QuerySpec> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.out.is_some() && self.merge.is_some() {
            return Err(DocumentStoreError::ValidationFailed(
                "a pipeline can end with either $out or $merge, not both".into(),
            ));
        }

        let spec = QuerySpec {
            filter: self.filter.build()?,
            sort: self.sort,
            fields: self.fields,
            joins: self.joins,
            skip: self.skip,
            limit: self.limit,
            assembler: self.assembler,
            out: self.out,
            merge: self.merge,
        };

        // Assembly errors surface here, before any request is issued.
        spec.compile(&PageState::new(1, spec.page_size(1), spec.skip), None, false)?;

        Ok(spec)
    }
}

impl From<Filter> for QueryBuilder {
    fn from(filter: Filter) -> Self {
        QueryBuilder { filter, ..Default::default() }
    }
}

/// A read request without aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct FindRequest {
    pub filter: FilterNode,
    pub sort: SortSpec,
    pub skip: u64,
    pub limit: u64,
}

/// The request a [`QuerySpec`] compiles to for one page.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledRequest {
    Find(FindRequest),
    Aggregate(Pipeline),
}

impl CompiledRequest {
    /// Renders the request as a document, used as the serialized cache key.
    pub fn to_document(&self) -> Document {
        match self {
            CompiledRequest::Find(request) => doc! {
                "find": {
                    "filter": request.filter.as_document().clone(),
                    "sort": request.sort.to_document(),
                    "skip": request.skip as i64,
                    "limit": request.limit as i64,
                },
            },
            CompiledRequest::Aggregate(pipeline) => doc! {
                "aggregate": pipeline.to_documents(),
            },
        }
    }
}

/// How the total number of rows of a query is determined.
#[derive(Debug, Clone, PartialEq)]
pub enum CountRequest {
    /// Count the documents matching a filter.
    Documents(FilterNode),
    /// Run a pipeline ending in a `$count` into [`TOTAL_FIELD`].
    Pipeline(Pipeline),
}

/// A validated, immutable query.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    filter: FilterNode,
    sort: SortSpec,
    fields: Vec<String>,
    joins: Vec<Join>,
    skip: u64,
    limit: Option<u64>,
    assembler: StageAssembler,
    out: Option<String>,
    merge: Option<String>,
}

impl QuerySpec {
    pub fn filter(&self) -> &FilterNode {
        &self.filter
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    /// The explicit skip supplied to the builder.
    pub fn skip(&self) -> u64 {
        self.skip
    }

    /// The configured page size, or `default` when none was set.
    pub fn page_size(&self, default: u64) -> u64 {
        self.limit.unwrap_or(default).max(1)
    }

    pub fn is_grouped(&self) -> bool {
        self.assembler.is_grouped()
    }

    fn has_projection(&self) -> bool {
        self.fields.iter().any(|field| field != "_id")
    }

    /// Returns `true` if this query needs the aggregation pipeline.
    pub fn requires_pipeline(&self) -> bool {
        !self.joins.is_empty()
            || self.has_projection()
            || self.assembler.is_grouped()
            || self.assembler.has_extra_stages()
            || self.out.is_some()
            || self.merge.is_some()
    }

    fn owned_filter(&self, owner: Option<&str>) -> FilterNode {
        match owner {
            Some(owner) => FilterNode::from_document(doc! { OWNER_FIELD: owner }).and(self.filter.clone()),
            None => self.filter.clone(),
        }
    }

    fn selection_stages(&self, owner: Option<&str>) -> Vec<(Slot, Stage)> {
        let mut stages = Vec::new();
        if let Some(owner) = owner {
            stages.push((
                Slot::Ownership,
                Stage::Match(FilterNode::from_document(doc! { OWNER_FIELD: owner })),
            ));
        }
        if !self.filter.is_empty() {
            stages.push((Slot::Match, Stage::Match(self.filter.clone())));
        }
        stages
    }

    fn join_stages(&self, stages: &mut Vec<(Slot, Stage)>) {
        let lengths = self
            .joins
            .iter()
            .filter_map(|join| join.count_field().map(|output| (output.to_string(), join.clone())))
            .collect::<Vec<_>>();
        if !lengths.is_empty() {
            stages.push((Slot::ReferenceLength, Stage::ReferenceLength(lengths)));
        }

        for join in &self.joins {
            stages.push((Slot::Lookup, Stage::Lookup(join.clone())));
        }
        for join in self.joins.iter().filter(|join| join.is_unwound()) {
            stages.push((Slot::Unwind, Stage::Unwind(join.output().to_string())));
        }
    }

    fn projection(&self) -> Projection {
        let mut fields = self.fields.clone();
        for join in &self.joins {
            if !fields.iter().any(|field| field == join.field()) {
                fields.push(join.field().to_string());
            }
        }
        Projection::Include(fields)
    }

    /// Compiles the request for one page.
    ///
    /// `owner` restricts results to documents owned by that identity.
    /// `force_pipeline` compiles an aggregation even when a find would do.
    /// Compiling the same spec with the same arguments always yields an equal
    /// request.
    pub fn compile(
        &self,
        page: &PageState,
        owner: Option<&str>,
        force_pipeline: bool,
    ) -> DocumentStoreResult<CompiledRequest> {
        if !force_pipeline && !self.requires_pipeline() {
            debug!(offset = page.offset(), limit = page.page_size(), "compiled find request");

            return Ok(CompiledRequest::Find(FindRequest {
                filter: self.owned_filter(owner),
                sort: self.sort.clone(),
                skip: page.offset(),
                limit: page.page_size(),
            }));
        }

        let mut stages = self.selection_stages(owner);

        if !self.sort.is_empty() {
            stages.push((Slot::Sort, Stage::Sort(self.sort.clone())));
        }
        if self.has_projection() {
            stages.push((Slot::Project, Stage::Project(self.projection())));
        }
        self.join_stages(&mut stages);

        if page.offset() > 0 {
            stages.push((Slot::Skip, Stage::Skip(page.offset())));
        }
        stages.push((Slot::Limit, Stage::Limit(page.page_size())));

        if let Some(collection) = &self.out {
            stages.push((Slot::Out, Stage::Out(collection.clone())));
        }
        if let Some(collection) = &self.merge {
            stages.push((Slot::Merge, Stage::Merge(collection.clone())));
        }

        let pipeline = self.assembler.assemble(stages, AssemblyMode::Results)?;
        debug!(stages = pipeline.stages().len(), "compiled aggregation pipeline");

        Ok(CompiledRequest::Aggregate(pipeline))
    }

    /// Compiles the request that yields the total number of rows.
    ///
    /// Sorting, paging and projection are left out since they cannot change
    /// the total.
    pub fn count_request(&self, owner: Option<&str>) -> DocumentStoreResult<CountRequest> {
        let unwinds = self.joins.iter().any(Join::is_unwound);

        if !self.assembler.is_grouped() && !self.assembler.has_extra_stages() && !unwinds {
            return Ok(CountRequest::Documents(self.owned_filter(owner)));
        }

        let mut stages = self.selection_stages(owner);
        for join in self.joins.iter().filter(|join| join.is_unwound()) {
            stages.push((Slot::Lookup, Stage::Lookup(join.clone())));
            stages.push((Slot::Unwind, Stage::Unwind(join.output().to_string())));
        }

        let mut pipeline = self.assembler.assemble(stages, AssemblyMode::Counting)?;
        pipeline.push(Stage::Count(TOTAL_FIELD.to_string()));

        Ok(CountRequest::Pipeline(pipeline))
    }

    /// Builds the pipeline counting the distinct values of `field`: group by the
    /// field, then count the groups into `count`.
    pub fn distinct_count_pipeline(&self, field: &str, owner: Option<&str>) -> DocumentStoreResult<Pipeline> {
        validate_field(field)?;

        let mut pipeline = Pipeline::new(
            self.selection_stages(owner)
                .into_iter()
                .map(|(_, stage)| stage)
                .collect(),
        );
        pipeline.push(Stage::Group(GroupSpec::new(GroupKey::Value(field.to_string()))));
        pipeline.push(Stage::Group(
            GroupSpec::new(GroupKey::All).with("count", Accumulator::Count),
        ));

        Ok(pipeline)
    }

    /// The filter for native distinct reads.
    pub fn distinct_filter(&self, owner: Option<&str>) -> FilterNode {
        self.owned_filter(owner)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn first_page(spec: &QuerySpec) -> PageState {
        PageState::new(1, spec.page_size(50), spec.skip())
    }

    fn pipeline(spec: &QuerySpec) -> Vec<Document> {
        match spec.compile(&first_page(spec), None, false).unwrap() {
            CompiledRequest::Aggregate(pipeline) => pipeline.to_documents(),
            other => panic!("expected a pipeline, got {other:?}"),
        }
    }

    #[test]
    fn test_simple_query_compiles_to_find() {
        let spec = QueryBuilder::new()
            .eq("status", "active")
            .ascending("createdAt")
            .limit(2)
            .build()
            .unwrap();

        assert_eq!(
            spec.compile(&first_page(&spec), None, false).unwrap(),
            CompiledRequest::Find(FindRequest {
                filter: FilterNode::from_document(doc! { "status": { "$eq": "active" } }),
                sort: SortSpec::new().with("createdAt", SortDirection::Ascending),
                skip: 0,
                limit: 2,
            })
        );
    }

    #[test]
    fn test_identity_projection_keeps_find() {
        let spec = QueryBuilder::new().fields(["_id"]).build().unwrap();
        assert!(!spec.requires_pipeline());
    }

    #[test]
    fn test_join_compiles_to_ordered_pipeline() {
        let spec = QueryBuilder::new()
            .include(Join::new("author", "members").count_as("authorCount"))
            .fields(["title"])
            .descending("publishedAt")
            .eq("status", "published")
            .skip(10)
            .limit(5)
            .build()
            .unwrap();

        let operators = pipeline(&spec)
            .iter()
            .filter_map(|stage| stage.keys().next().cloned())
            .collect::<Vec<_>>();

        assert_eq!(
            operators,
            vec!["$match", "$sort", "$project", "$addFields", "$lookup", "$skip", "$limit"]
        );
        assert_eq!(pipeline(&spec)[2], doc! { "$project": { "title": 1, "author": 1 } });
        assert_eq!(
            pipeline(&spec)[3],
            doc! { "$addFields": { "authorCount": { "$cond": [{ "$isArray": "$author" }, { "$size": "$author" }, 0] } } }
        );
    }

    #[test]
    fn test_grouped_query_pipeline() {
        let spec = QueryBuilder::new()
            .group_by(["category"])
            .sum("amount")
            .count()
            .build()
            .unwrap();

        assert_eq!(
            pipeline(&spec),
            vec![
                doc! { "$group": {
                    "_id": { "category": "$category" },
                    "amountSum": { "$sum": "$amount" },
                    "count": { "$sum": 1 },
                } },
                doc! { "$limit": 50_i64 },
            ]
        );
    }

    #[test]
    fn test_sort_after_grouping_targets_grouped_rows() {
        let spec = QueryBuilder::new()
            .ascending("createdAt")
            .group_by(["category"])
            .count()
            .descending("count")
            .build()
            .unwrap();

        assert_eq!(
            pipeline(&spec),
            vec![
                doc! { "$sort": { "createdAt": 1 } },
                doc! { "$group": { "_id": { "category": "$category" }, "count": { "$sum": 1 } } },
                doc! { "$sort": { "count": -1 } },
                doc! { "$limit": 50_i64 },
            ]
        );
    }

    #[test]
    fn test_group_by_twice_fails_at_build() {
        let result = QueryBuilder::new().group_by(["a"]).group_by(["b"]).build();
        assert!(matches!(result, Err(DocumentStoreError::AlreadyGrouped)));
    }

    #[test]
    fn test_extra_group_stage_fails_at_build() {
        let result = QueryBuilder::new()
            .group_by(["a"])
            .stage(Stage::Group(GroupSpec::new(GroupKey::All)))
            .build();

        assert!(matches!(result, Err(DocumentStoreError::TooManyGroupStages(2))));
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        assert!(matches!(
            QueryBuilder::new().limit(0).build(),
            Err(DocumentStoreError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_owner_restriction() {
        let spec = QueryBuilder::new().eq("a", 1).build().unwrap();

        let CompiledRequest::Find(request) = spec.compile(&first_page(&spec), Some("u1"), false).unwrap() else {
            panic!("expected a find request");
        };
        assert_eq!(
            request.filter.into_document(),
            doc! { "$and": [{ "_owner": "u1" }, { "a": { "$eq": 1 } }] }
        );

        let CompiledRequest::Aggregate(pipeline) = spec.compile(&first_page(&spec), Some("u1"), true).unwrap() else {
            panic!("expected a pipeline");
        };
        assert_eq!(pipeline.to_documents()[0], doc! { "$match": { "_owner": "u1" } });
    }

    #[test]
    fn test_count_request() {
        let plain = QueryBuilder::new().eq("a", 1).ascending("b").limit(3).build().unwrap();
        assert_eq!(
            plain.count_request(None).unwrap(),
            CountRequest::Documents(FilterNode::from_document(doc! { "a": { "$eq": 1 } }))
        );

        let grouped = QueryBuilder::new().group_by(["c"]).ascending("c").limit(3).build().unwrap();
        let CountRequest::Pipeline(pipeline) = grouped.count_request(None).unwrap() else {
            panic!("expected a count pipeline");
        };
        assert_eq!(
            pipeline.to_documents(),
            vec![
                doc! { "$group": { "_id": { "c": "$c" } } },
                doc! { "$count": "total" },
            ]
        );
    }

    #[test]
    fn test_distinct_count_pipeline() {
        let spec = QueryBuilder::new().eq("a", 1).build().unwrap();

        assert_eq!(
            spec.distinct_count_pipeline("tag", None).unwrap().to_documents(),
            vec![
                doc! { "$match": { "a": { "$eq": 1 } } },
                doc! { "$group": { "_id": "$tag" } },
                doc! { "$group": { "_id": Bson::Null, "count": { "$sum": 1 } } },
            ]
        );
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let spec = QueryBuilder::new()
            .eq("status", "active")
            .include(Join::new("tags", "tags").unwind())
            .group_by(["status"])
            .avg("score")
            .having(Filter::new().gt("scoreAvg", 3))
            .ascending("title")
            .build()
            .unwrap();

        let page = PageState::new(2, 10, 0);
        assert_eq!(
            spec.compile(&page, None, false).unwrap().to_document(),
            spec.compile(&page, None, false).unwrap().to_document()
        );
    }
}
