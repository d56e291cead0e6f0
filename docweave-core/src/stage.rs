//! Aggregation pipeline stages and their assembly.
//!
//! [`Stage`] is a typed aggregation step that renders to MongoDB syntax.
//! [`StageAssembler`] owns the single [`GroupSpec`] of a query together with the
//! deferred `count`, the `having` filter and any sorts requested after grouping,
//! and merges them with the stages produced by the query compiler.
//!
//! Stages are ordered by the fixed [`Slot`] priority table, never by the order
//! in which builder methods were called.

use bson::{Bson, Document, doc};
use tracing::debug;

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    filter::{FilterNode, validate_field},
    join::Join,
};

/// Output field of the accumulator that preserves the first document of each group.
pub const FIRST_DOCUMENT_FIELD: &str = "_first";

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    Ascending,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Descending,
}

impl SortDirection {
    /// The MongoDB sort value, `1` or `-1`.
    pub fn value(self) -> i32 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

/// An ordered list of sort keys.
///
/// Sorting by a field that is already present replaces its direction in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortSpec(Vec<(String, SortDirection)>);

impl SortSpec {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Adds or replaces the direction for `field`.
    pub fn with(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.push(field.into(), direction);
        self
    }

    pub(crate) fn push(&mut self, field: String, direction: SortDirection) {
        match self.0.iter_mut().find(|(existing, _)| *existing == field) {
            Some(entry) => entry.1 = direction,
            None => self.0.push((field, direction)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> &[(String, SortDirection)] {
        &self.0
    }

    pub fn to_document(&self) -> Document {
        self.0
            .iter()
            .map(|(field, direction)| (field.clone(), Bson::Int32(direction.value())))
            .collect()
    }
}

/// The `_id` expression of a `$group` stage.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupKey {
    /// One group for the whole input (`_id: null`).
    All,
    /// A compound key `{field: "$field", ...}`.
    Fields(Vec<String>),
    /// A scalar key `"$field"`.
    Value(String),
}

impl GroupKey {
    fn to_bson(&self) -> Bson {
        match self {
            GroupKey::All => Bson::Null,
            GroupKey::Fields(fields) => Bson::Document(
                fields
                    .iter()
                    .map(|field| (field.clone(), Bson::String(format!("${field}"))))
                    .collect(),
            ),
            GroupKey::Value(field) => Bson::String(format!("${field}")),
        }
    }
}

/// A group accumulator expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Avg(String),
    Min(String),
    Max(String),
    Sum(String),
    /// `{$sum: 1}`
    Count,
    /// `{$first: "$$ROOT"}`
    FirstDocument,
}

impl Accumulator {
    fn to_document(&self) -> Document {
        match self {
            Accumulator::Avg(field) => doc! { "$avg": format!("${field}") },
            Accumulator::Min(field) => doc! { "$min": format!("${field}") },
            Accumulator::Max(field) => doc! { "$max": format!("${field}") },
            Accumulator::Sum(field) => doc! { "$sum": format!("${field}") },
            Accumulator::Count => doc! { "$sum": 1 },
            Accumulator::FirstDocument => doc! { "$first": "$$ROOT" },
        }
    }
}

/// The single logical grouping descriptor of a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    key: GroupKey,
    accumulators: Vec<(String, Accumulator)>,
}

impl GroupSpec {
    pub fn new(key: GroupKey) -> Self {
        Self { key, accumulators: Vec::new() }
    }

    /// Inserts an accumulator, replacing any existing one with the same output name.
    pub fn upsert(&mut self, name: impl Into<String>, accumulator: Accumulator) {
        let name = name.into();
        match self.accumulators.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = accumulator,
            None => self.accumulators.push((name, accumulator)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, accumulator: Accumulator) -> Self {
        self.upsert(name, accumulator);
        self
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn accumulators(&self) -> &[(String, Accumulator)] {
        &self.accumulators
    }

    fn has_output(&self, name: &str) -> bool {
        self.accumulators.iter().any(|(existing, _)| existing == name)
    }

    pub fn to_document(&self) -> Document {
        let mut document = doc! { "_id": self.key.to_bson() };
        for (name, accumulator) in &self.accumulators {
            document.insert(name.clone(), accumulator.to_document());
        }
        document
    }
}

/// A `$project` specification.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Keep only these fields (plus `_id`).
    Include(Vec<String>),
    /// Drop these fields.
    Exclude(Vec<String>),
}

impl Projection {
    pub fn to_document(&self) -> Document {
        match self {
            Projection::Include(fields) => fields
                .iter()
                .map(|field| (field.clone(), Bson::Int32(1)))
                .collect(),
            Projection::Exclude(fields) => fields
                .iter()
                .map(|field| (field.clone(), Bson::Int32(0)))
                .collect(),
        }
    }
}

/// One aggregation pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(FilterNode),
    Sort(SortSpec),
    Group(GroupSpec),
    Project(Projection),
    /// `$addFields` of join reference counts: `(output, join)`.
    ReferenceLength(Vec<(String, Join)>),
    Lookup(Join),
    /// `$unwind` of the given path, keeping documents with no joined items.
    Unwind(String),
    Skip(u64),
    Limit(u64),
    /// `$count` into the given field.
    Count(String),
    Out(String),
    Merge(String),
}

impl Stage {
    /// The operator key this stage renders under.
    pub fn operator(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Sort(_) => "$sort",
            Stage::Group(_) => "$group",
            Stage::Project(_) => "$project",
            Stage::ReferenceLength(_) => "$addFields",
            Stage::Lookup(_) => "$lookup",
            Stage::Unwind(_) => "$unwind",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
            Stage::Count(_) => "$count",
            Stage::Out(_) => "$out",
            Stage::Merge(_) => "$merge",
        }
    }

    /// The slot a stage occupies when it is added without an explicit one.
    pub fn default_slot(&self) -> Slot {
        match self {
            Stage::Match(_) => Slot::Match,
            Stage::Sort(_) => Slot::Sort,
            Stage::Group(_) => Slot::Group,
            Stage::Project(_) => Slot::Project,
            Stage::ReferenceLength(_) => Slot::ReferenceLength,
            Stage::Lookup(_) => Slot::Lookup,
            Stage::Unwind(_) => Slot::Unwind,
            Stage::Skip(_) => Slot::Skip,
            Stage::Limit(_) => Slot::Limit,
            Stage::Count(_) => Slot::Count,
            Stage::Out(_) => Slot::Out,
            Stage::Merge(_) => Slot::Merge,
        }
    }

    pub fn to_document(&self) -> Document {
        let body = match self {
            Stage::Match(filter) => Bson::Document(filter.as_document().clone()),
            Stage::Sort(sort) => Bson::Document(sort.to_document()),
            Stage::Group(group) => Bson::Document(group.to_document()),
            Stage::Project(projection) => Bson::Document(projection.to_document()),
            Stage::ReferenceLength(fields) => Bson::Document(
                fields
                    .iter()
                    .map(|(output, join)| (output.clone(), join.to_length_expression()))
                    .collect(),
            ),
            Stage::Lookup(join) => Bson::Document(join.to_lookup()),
            Stage::Unwind(path) => Bson::Document(doc! {
                "path": format!("${path}"),
                "preserveNullAndEmptyArrays": true,
            }),
            Stage::Skip(skip) => Bson::Int64(*skip as i64),
            Stage::Limit(limit) => Bson::Int64(*limit as i64),
            Stage::Count(field) => Bson::String(field.clone()),
            Stage::Out(collection) => Bson::String(collection.clone()),
            Stage::Merge(collection) => Bson::Document(doc! {
                "into": collection.as_str(),
                "on": "_id",
                "whenMatched": "replace",
                "whenNotMatched": "insert",
            }),
        };

        doc! { self.operator(): body }
    }
}

/// Fixed priority table that orders pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    /// Restricts input to documents owned by the acting identity.
    Ownership,
    Match,
    Sort,
    Group,
    /// The `having` filter applied to grouped documents.
    Having,
    /// Sorts requested after grouping.
    GroupSort,
    /// Removes the first-document accumulator once sorting is done.
    GroupCleanup,
    Project,
    ReferenceLength,
    Lookup,
    Unwind,
    Skip,
    Limit,
    Count,
    Out,
    Merge,
}

impl Slot {
    /// Returns `true` for slots whose stages change which rows a pipeline yields.
    pub fn affects_rows(self) -> bool {
        matches!(
            self,
            Slot::Ownership | Slot::Match | Slot::Group | Slot::Having | Slot::Lookup | Slot::Unwind
        )
    }
}

/// A compiled aggregation pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn group_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|stage| matches!(stage, Stage::Group(_)))
            .count()
    }

    /// Renders the pipeline as MongoDB stage documents.
    pub fn to_documents(&self) -> Vec<Document> {
        self.stages.iter().map(Stage::to_document).collect()
    }
}

/// Which stages [`StageAssembler::assemble`] emits around the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AssemblyMode {
    /// Every stage, for fetching result pages.
    Results,
    /// Only the stages that decide which rows exist, for counting them.
    Counting,
}

/// Owns the grouping state of a query and produces the ordered pipeline.
#[derive(Debug, Clone, Default)]
pub struct StageAssembler {
    group: Option<GroupSpec>,
    grouped_by_fields: bool,
    count: bool,
    having: Option<FilterNode>,
    group_sort: SortSpec,
    extra: Vec<(Slot, Stage)>,
}

impl StageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once any grouping or calculation has been requested.
    pub fn is_grouped(&self) -> bool {
        self.group.is_some() || self.count
    }

    /// Returns `true` if raw stages were added.
    pub fn has_extra_stages(&self) -> bool {
        !self.extra.is_empty()
    }

    /// Groups by the given fields.
    ///
    /// Accumulators created by earlier calculation calls are preserved.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::AlreadyGrouped`] if fields were already grouped by,
    /// [`DocumentStoreError::ValidationFailed`] for empty or invalid field names.
    pub fn group_by(&mut self, fields: Vec<String>) -> DocumentStoreResult<()> {
        if self.grouped_by_fields {
            return Err(DocumentStoreError::AlreadyGrouped);
        }
        if fields.is_empty() {
            return Err(DocumentStoreError::ValidationFailed("group_by requires at least one field".into()));
        }
        fields.iter().try_for_each(|field| validate_field(field))?;

        let key = GroupKey::Fields(fields);
        match &mut self.group {
            Some(group) => group.key = key,
            None => self.group = Some(GroupSpec::new(key)),
        }
        self.grouped_by_fields = true;

        Ok(())
    }

    /// Upserts a calculation into the group, creating a whole-collection
    /// group if none exists yet.
    pub fn calculate(&mut self, name: String, accumulator: Accumulator) -> DocumentStoreResult<()> {
        validate_field(&name)?;
        self.group
            .get_or_insert_with(|| GroupSpec::new(GroupKey::All))
            .upsert(name, accumulator);

        Ok(())
    }

    /// Requests a `count` accumulator, attached when the pipeline is assembled.
    pub fn count(&mut self) {
        self.count = true;
    }

    /// Filters grouped documents. Ignored when nothing is grouped.
    pub fn having(&mut self, filter: FilterNode) {
        self.having = Some(match self.having.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
    }

    /// Sorts grouped documents by `field`.
    pub fn sort_grouped(&mut self, field: String, direction: SortDirection) {
        self.group_sort.push(field, direction);
    }

    /// Adds a raw stage in the given slot.
    pub fn push(&mut self, slot: Slot, stage: Stage) {
        self.extra.push((slot, stage));
    }

    /// Returns the group that will be emitted, including the deferred count.
    pub fn effective_group(&self) -> Option<GroupSpec> {
        let mut group = self.group.clone();
        if self.count {
            group
                .get_or_insert_with(|| GroupSpec::new(GroupKey::All))
                .upsert("count", Accumulator::Count);
        }
        group
    }

    /// Maps a field requested for sorting after grouping onto the grouped document.
    fn retarget(group: &GroupSpec, field: &str) -> (String, bool) {
        if let GroupKey::Fields(fields) = &group.key {
            if fields.iter().any(|key| key == field) {
                return (format!("_id.{field}"), false);
            }
        }
        if field == "_id" || group.has_output(field) {
            return (field.to_string(), false);
        }

        (format!("{FIRST_DOCUMENT_FIELD}.{field}"), true)
    }

    /// Merges the compiler's stages with the grouping stages and orders them.
    ///
    /// # Errors
    ///
    /// [`DocumentStoreError::TooManyGroupStages`] if the result holds more than one `$group`.
    pub(crate) fn assemble(&self, base: Vec<(Slot, Stage)>, mode: AssemblyMode) -> DocumentStoreResult<Pipeline> {
        let mut staged = base;

        staged.extend(
            self.extra
                .iter()
                .filter(|(slot, _)| mode == AssemblyMode::Results || slot.affects_rows())
                .cloned(),
        );

        match self.effective_group() {
            Some(mut group) => {
                let mut sort = SortSpec::new();
                let mut keeps_first = false;

                if mode == AssemblyMode::Results {
                    for (field, direction) in self.group_sort.keys() {
                        let (target, needs_first) = Self::retarget(&group, field);
                        keeps_first |= needs_first;
                        sort.push(target, *direction);
                    }
                }
                if keeps_first {
                    group.upsert(FIRST_DOCUMENT_FIELD, Accumulator::FirstDocument);
                }

                staged.push((Slot::Group, Stage::Group(group)));
                if let Some(having) = &self.having {
                    staged.push((Slot::Having, Stage::Match(having.clone())));
                }
                if !sort.is_empty() {
                    staged.push((Slot::GroupSort, Stage::Sort(sort)));
                }
                if keeps_first {
                    staged.push((
                        Slot::GroupCleanup,
                        Stage::Project(Projection::Exclude(vec![FIRST_DOCUMENT_FIELD.to_string()])),
                    ));
                }
            }
            None if self.having.is_some() => {
                debug!("having filter ignored, query is not grouped");
            }
            None => {}
        }

        staged.sort_by_key(|(slot, _)| *slot);

        let pipeline = Pipeline::new(staged.into_iter().map(|(_, stage)| stage).collect());
        let groups = pipeline.group_count();

        if groups > 1 {
            return Err(DocumentStoreError::TooManyGroupStages(groups));
        }

        debug!(
            stages = ?pipeline.stages().iter().map(Stage::operator).collect::<Vec<_>>(),
            "assembled pipeline"
        );

        Ok(pipeline)
    }
}
