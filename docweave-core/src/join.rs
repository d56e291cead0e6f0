//! Cross-collection lookups attached to query results.

use bson::{Bson, Document, doc};

use crate::{
    error::{DocumentStoreError, DocumentStoreResult},
    filter::validate_field,
    stage::{SortDirection, SortSpec},
};

/// Default number of joined items attached to each result document.
pub const DEFAULT_MAX_JOIN_ITEMS: u64 = 50;

/// Describes a `$lookup` that replaces a reference field with the documents it
/// points to.
///
/// The source field may hold a single reference or an array of references.
/// Joined documents are sorted by the join's sort specification (creation time
/// ascending unless configured) and limited to `max_items`.
///
/// ```ignore
/// let join = Join::new("authors", "members")
///     .max_items(10)
///     .count_as("authorsCount");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    field: String,
    collection: String,
    foreign_field: String,
    alias: String,
    max_items: u64,
    sort: SortSpec,
    count_field: Option<String>,
    unwind: bool,
}

impl Join {
    /// Joins the references stored in `field` against the identity field of
    /// `collection`, writing the result back into `field`.
    pub fn new(field: impl Into<String>, collection: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            alias: field.clone(),
            field,
            collection: collection.into(),
            foreign_field: "_id".into(),
            max_items: DEFAULT_MAX_JOIN_ITEMS,
            sort: SortSpec::new().with("_createdDate", SortDirection::Ascending),
            count_field: None,
            unwind: false,
        }
    }

    /// Matches references against `field` in the target collection instead of `_id`.
    pub fn foreign_field(mut self, field: impl Into<String>) -> Self {
        self.foreign_field = field.into();
        self
    }

    /// Writes the joined documents to `alias` instead of the source field.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Limits the number of joined documents per result.
    pub fn max_items(mut self, max_items: u64) -> Self {
        self.max_items = max_items;
        self
    }

    /// Replaces the order in which joined documents are attached.
    pub fn sort_by(mut self, sort: SortSpec) -> Self {
        self.sort = sort;
        self
    }

    /// Adds a derived field holding the number of references in the source
    /// field, computed before the lookup runs.
    pub fn count_as(mut self, field: impl Into<String>) -> Self {
        self.count_field = Some(field.into());
        self
    }

    /// Unwinds the joined array so each result holds a single joined document.
    pub fn unwind(mut self) -> Self {
        self.unwind = true;
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn foreign(&self) -> &str {
        &self.foreign_field
    }

    pub fn output(&self) -> &str {
        &self.alias
    }

    pub fn limit(&self) -> u64 {
        self.max_items
    }

    pub fn sort(&self) -> &SortSpec {
        &self.sort
    }

    pub fn count_field(&self) -> Option<&str> {
        self.count_field.as_deref()
    }

    pub fn is_unwound(&self) -> bool {
        self.unwind
    }

    pub(crate) fn validate(&self) -> DocumentStoreResult<()> {
        validate_field(&self.field)?;
        validate_field(&self.foreign_field)?;
        validate_field(&self.alias)?;
        if let Some(count_field) = &self.count_field {
            validate_field(count_field)?;
        }
        if self.collection.trim().is_empty() {
            return Err(DocumentStoreError::ValidationFailed(
                "join target collection must not be empty".into(),
            ));
        }
        if self.max_items == 0 {
            return Err(DocumentStoreError::ValidationFailed(format!(
                "join on {} must allow at least one item",
                self.field
            )));
        }

        Ok(())
    }

    /// Renders the `$lookup` stage body.
    pub(crate) fn to_lookup(&self) -> Document {
        let mut pipeline = vec![Bson::Document(doc! {
            "$match": {
                "$expr": {
                    "$in": [
                        format!("${}", self.foreign_field),
                        { "$cond": [{ "$isArray": "$$refs" }, "$$refs", ["$$refs"]] },
                    ],
                },
            },
        })];

        if !self.sort.is_empty() {
            pipeline.push(Bson::Document(doc! { "$sort": self.sort.to_document() }));
        }
        pipeline.push(Bson::Document(doc! { "$limit": self.max_items as i64 }));

        doc! {
            "from": self.collection.as_str(),
            "let": { "refs": format!("${}", self.field) },
            "pipeline": pipeline,
            "as": self.alias.as_str(),
        }
    }

    /// Renders the reference-length expression for [`Join::count_as`].
    pub(crate) fn to_length_expression(&self) -> Bson {
        let path = format!("${}", self.field);
        Bson::Document(doc! {
            "$cond": [{ "$isArray": path.as_str() }, { "$size": path.as_str() }, 0],
        })
    }
}
