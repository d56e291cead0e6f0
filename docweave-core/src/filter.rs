//! Filter predicate construction for document queries.
//!
//! A [`Filter`] accumulates comparison calls into a [`FilterNode`], a document in
//! MongoDB query syntax. Operators applied to the same field merge into a single
//! operator document instead of overwriting each other, and the combinators
//! (`and`, `or`, `not`) wrap the accumulated node as one child of `$and`, `$or`
//! or `$nor`.
//!
//! ```ignore
//! use docweave::filter::Filter;
//!
//! let filter = Filter::new()
//!     .eq("status", "active")
//!     .between("age", 18, 65)
//!     .or(Filter::new().eq("role", "admin"));
//! ```
//!
//! Backends that evaluate filters themselves walk a node through
//! [`FilterNode::predicate`] and the [`FilterVisitor`] trait.

use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
};

use bson::{Bson, Document, doc};

use crate::error::{DocumentStoreError, DocumentStoreResult};

/// A composable predicate tree in MongoDB query syntax.
///
/// The top level of a node is an implicit conjunction of its entries. Entries
/// are either `field: {operator: value, ...}` or a combinator
/// (`$and`, `$or`, `$nor`) holding an array of child nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterNode(Document);

impl FilterNode {
    /// Creates an empty node that matches every document.
    pub fn new() -> Self {
        Self(Document::new())
    }

    /// Wraps an existing query document without validation.
    pub fn from_document(document: Document) -> Self {
        Self(document)
    }

    /// Returns `true` if the node has no predicates.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the underlying query document.
    pub fn as_document(&self) -> &Document {
        &self.0
    }

    /// Consumes the node and returns the underlying query document.
    pub fn into_document(self) -> Document {
        self.0
    }

    /// Merges `operator: value` into the operator document of `field`.
    pub(crate) fn merge_operator(&mut self, field: &str, operator: &str, value: Bson) {
        match self.0.get_mut(field) {
            Some(Bson::Document(operators)) => {
                operators.insert(operator, value);
            }
            _ => {
                self.0.insert(field, doc! { operator: value });
            }
        }
    }

    /// Combines two nodes as `$and`. Repeated conjunctions append siblings.
    pub fn and(self, other: FilterNode) -> FilterNode {
        self.combine("$and", other)
    }

    /// Combines two nodes as `$or`. Repeated disjunctions append siblings.
    pub fn or(self, other: FilterNode) -> FilterNode {
        self.combine("$or", other)
    }

    /// Excludes documents matching `other` through a `$nor` entry merged into
    /// this node. Repeated negations append siblings to the same `$nor`.
    pub fn not(mut self, other: FilterNode) -> FilterNode {
        if other.is_empty() {
            return self;
        }

        match self.0.get_mut("$nor") {
            Some(Bson::Array(children)) => children.push(Bson::Document(other.0)),
            _ => {
                self.0.insert("$nor", vec![Bson::Document(other.0)]);
            }
        }

        self
    }

    fn combine(mut self, combinator: &str, other: FilterNode) -> FilterNode {
        if other.is_empty() {
            return self;
        }
        if self.is_empty() {
            return other;
        }

        if self.0.len() == 1 {
            if let Some(Bson::Array(children)) = self.0.get_mut(combinator) {
                children.push(Bson::Document(other.0));
                return self;
            }
        }

        FilterNode(doc! {
            combinator: [Bson::Document(self.0), Bson::Document(other.0)],
        })
    }

    /// Parses this node into a [`Predicate`] tree for evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError::ValidationFailed`] if the node contains an
    /// operator that is not part of the supported set.
    pub fn predicate(&self) -> DocumentStoreResult<Predicate<'_>> {
        parse_node(&self.0)
    }
}

impl From<Document> for FilterNode {
    fn from(document: Document) -> Self {
        FilterNode(document)
    }
}

/// Comparison operators understood by [`FilterVisitor`] implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    /// `$eq`
    Eq,
    /// `$ne`
    Ne,
    /// `$gt`
    Gt,
    /// `$gte`
    Gte,
    /// `$lt`
    Lt,
    /// `$lte`
    Lte,
    /// `$in`: the field (or one of its array elements) equals one of the values.
    In,
    /// `$all`: the array field contains every value.
    All,
    /// `$exists`
    Exists,
}

impl FieldOp {
    fn from_operator(operator: &str) -> Option<Self> {
        Some(match operator {
            "$eq" => FieldOp::Eq,
            "$ne" => FieldOp::Ne,
            "$gt" => FieldOp::Gt,
            "$gte" => FieldOp::Gte,
            "$lt" => FieldOp::Lt,
            "$lte" => FieldOp::Lte,
            "$in" => FieldOp::In,
            "$all" => FieldOp::All,
            "$exists" => FieldOp::Exists,
            _ => return None,
        })
    }
}

/// A parsed, borrowed view of a [`FilterNode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate<'a> {
    /// All children must match.
    And(Vec<Predicate<'a>>),
    /// At least one child must match.
    Or(Vec<Predicate<'a>>),
    /// No child may match.
    Nor(Vec<Predicate<'a>>),
    /// A single field comparison.
    Field {
        /// The (possibly dotted) field path.
        field: &'a str,
        /// The comparison operator.
        op: FieldOp,
        /// The operand.
        value: &'a Bson,
    },
    /// A regular expression match on a string field.
    Regex {
        /// The (possibly dotted) field path.
        field: &'a str,
        /// The pattern source.
        pattern: &'a str,
        /// Regex flags, e.g. `i`.
        options: &'a str,
    },
}

fn parse_node(document: &Document) -> DocumentStoreResult<Predicate<'_>> {
    let mut clauses = Vec::with_capacity(document.len());

    for (key, value) in document {
        match key.as_str() {
            "$and" => clauses.push(Predicate::And(parse_children(key, value)?)),
            "$or" => clauses.push(Predicate::Or(parse_children(key, value)?)),
            "$nor" => clauses.push(Predicate::Nor(parse_children(key, value)?)),
            other if other.starts_with('$') => {
                return Err(DocumentStoreError::ValidationFailed(format!(
                    "unsupported filter combinator {other}"
                )));
            }
            field => clauses.extend(parse_field(field, value)?),
        }
    }

    Ok(match clauses.len() {
        1 => clauses.remove(0),
        _ => Predicate::And(clauses),
    })
}

fn parse_children<'a>(combinator: &str, value: &'a Bson) -> DocumentStoreResult<Vec<Predicate<'a>>> {
    match value {
        Bson::Array(children) => children
            .iter()
            .map(|child| match child {
                Bson::Document(node) => parse_node(node),
                _ => Err(DocumentStoreError::ValidationFailed(format!(
                    "{combinator} children must be documents"
                ))),
            })
            .collect(),
        _ => Err(DocumentStoreError::ValidationFailed(format!(
            "{combinator} requires an array"
        ))),
    }
}

fn parse_field<'a>(field: &'a str, value: &'a Bson) -> DocumentStoreResult<Vec<Predicate<'a>>> {
    let operators = match value {
        Bson::Document(operators) if operators.keys().all(|key| key.starts_with('$')) && !operators.is_empty() => operators,
        // A plain value is an implicit equality.
        _ => return Ok(vec![Predicate::Field { field, op: FieldOp::Eq, value }]),
    };

    let mut predicates = Vec::with_capacity(operators.len());

    for (operator, operand) in operators {
        match operator.as_str() {
            "$regex" => {
                let pattern = operand.as_str().ok_or_else(|| {
                    DocumentStoreError::ValidationFailed(format!("$regex on {field} requires a string"))
                })?;
                let options = operators.get_str("$options").unwrap_or("");
                predicates.push(Predicate::Regex { field, pattern, options });
            }
            "$options" => {}
            other => match FieldOp::from_operator(other) {
                Some(op) => predicates.push(Predicate::Field { field, op, value: operand }),
                None => {
                    return Err(DocumentStoreError::ValidationFailed(format!(
                        "unsupported filter operator {other} on {field}"
                    )));
                }
            },
        }
    }

    Ok(predicates)
}

/// Visitor over a parsed [`Predicate`] tree.
///
/// Backends implement this trait to evaluate or translate filters.
pub trait FilterVisitor {
    type Output;
    type Error: Into<DocumentStoreError>;

    fn visit_and(&mut self, predicates: &[Predicate<'_>]) -> Result<Self::Output, Self::Error>;
    fn visit_or(&mut self, predicates: &[Predicate<'_>]) -> Result<Self::Output, Self::Error>;
    fn visit_nor(&mut self, predicates: &[Predicate<'_>]) -> Result<Self::Output, Self::Error>;
    fn visit_field(
        &mut self,
        field: &str,
        op: FieldOp,
        value: &Bson,
    ) -> Result<Self::Output, Self::Error>;
    fn visit_regex(
        &mut self,
        field: &str,
        pattern: &str,
        options: &str,
    ) -> Result<Self::Output, Self::Error>;

    fn visit_predicate(&mut self, predicate: &Predicate<'_>) -> Result<Self::Output, Self::Error> {
        match predicate {
            Predicate::And(predicates) => self.visit_and(predicates),
            Predicate::Or(predicates) => self.visit_or(predicates),
            Predicate::Nor(predicates) => self.visit_nor(predicates),
            Predicate::Field { field, op, value } => self.visit_field(field, *op, value),
            Predicate::Regex { field, pattern, options } => self.visit_regex(field, pattern, options),
        }
    }
}

/// Checks that a field name can safely be used as a query key.
pub(crate) fn validate_field(field: &str) -> DocumentStoreResult<()> {
    if field.trim().is_empty() {
        return Err(DocumentStoreError::ValidationFailed("field name must not be empty".into()));
    }
    if field.starts_with('$') || field.contains('\0') {
        return Err(DocumentStoreError::ValidationFailed(format!(
            "field name {field:?} is not allowed"
        )));
    }

    Ok(())
}

fn validate_value(field: &str, value: &Bson) -> DocumentStoreResult<()> {
    match value {
        Bson::Undefined => Err(DocumentStoreError::ValidationFailed(format!(
            "missing value for {field}"
        ))),
        _ => Ok(()),
    }
}

fn call_hash(method: &str, arguments: &[&Bson]) -> u64 {
    let mut hasher = DefaultHasher::new();
    method.hash(&mut hasher);
    for argument in arguments {
        format!("{argument:?}").hash(&mut hasher);
    }
    hasher.finish()
}

fn into_set(value: Bson) -> Vec<Bson> {
    match value {
        Bson::Array(values) => values,
        single => vec![single],
    }
}

/// Fluent builder for [`FilterNode`]s.
///
/// Every method consumes and returns the builder. Invalid arguments do not
/// panic: the first error is recorded, later calls become no-ops, and the error
/// is reported by [`Filter::build`] (or by the terminal call of the query using
/// this filter).
///
/// Applying the same operator to the same field with the same arguments twice
/// is idempotent. The applied-operator table records, per written
/// `(operator key, field)`, the hash of the call that last wrote it. A call is
/// skipped only when every key it writes was last written by the same call.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    node: FilterNode,
    applied: HashMap<(&'static str, String), u64>,
    error: Option<DocumentStoreError>,
}

impl Filter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    fn apply<F>(
        mut self,
        method: &'static str,
        writes: &[&'static str],
        field: String,
        arguments: &[&Bson],
        mutate: F,
    ) -> Self
    where
        F: FnOnce(&mut FilterNode, &str),
    {
        if self.error.is_some() {
            return self;
        }

        let validation = validate_field(&field).and_then(|_| {
            arguments
                .iter()
                .try_for_each(|argument| validate_value(&field, argument))
        });
        if let Err(err) = validation {
            self.error = Some(err);
            return self;
        }

        let signature = call_hash(method, arguments);
        let repeated = writes
            .iter()
            .all(|key| self.applied.get(&(*key, field.clone())) == Some(&signature));
        if repeated {
            return self;
        }

        mutate(&mut self.node, &field);
        for key in writes {
            self.applied.insert((*key, field.clone()), signature);
        }
        self
    }

    fn compare(self, operator: &'static str, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        let value = value.into();
        self.apply(operator, &[operator], field.into(), &[&value], |node, field| {
            node.merge_operator(field, operator, value.clone())
        })
    }

    fn regex(self, operator: &'static str, field: impl Into<String>, text: impl Into<String>, anchor: (&str, &str)) -> Self {
        let text: String = text.into();
        let pattern = format!("{}{}{}", anchor.0, regex_lite::escape(&text), anchor.1);
        let text = Bson::String(text);

        self.apply(operator, &["$regex", "$options"], field.into(), &[&text], |node, field| {
            node.merge_operator(field, "$regex", Bson::String(pattern));
            node.merge_operator(field, "$options", Bson::String("i".into()));
        })
    }

    /// Matches documents where `field` equals `value`.
    pub fn eq(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.compare("$eq", field, value)
    }

    /// Matches documents where `field` does not equal `value`.
    pub fn ne(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.compare("$ne", field, value)
    }

    /// Matches documents where `field` is greater than `value`.
    pub fn gt(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.compare("$gt", field, value)
    }

    /// Matches documents where `field` is greater than or equal to `value`.
    pub fn ge(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.compare("$gte", field, value)
    }

    /// Matches documents where `field` is less than `value`.
    pub fn lt(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.compare("$lt", field, value)
    }

    /// Matches documents where `field` is less than or equal to `value`.
    pub fn le(self, field: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.compare("$lte", field, value)
    }

    /// Matches documents where `start <= field <= end`.
    pub fn between(self, field: impl Into<String>, start: impl Into<Bson>, end: impl Into<Bson>) -> Self {
        let (start, end) = (start.into(), end.into());
        self.apply("between", &["$gte", "$lte"], field.into(), &[&start, &end], |node, field| {
            node.merge_operator(field, "$gte", start.clone());
            node.merge_operator(field, "$lte", end.clone());
        })
    }

    /// Matches string fields containing `text`, ignoring case.
    pub fn contains(self, field: impl Into<String>, text: impl Into<String>) -> Self {
        self.regex("contains", field, text, ("", ""))
    }

    /// Matches string fields starting with `text`, ignoring case.
    pub fn starts_with(self, field: impl Into<String>, text: impl Into<String>) -> Self {
        self.regex("startsWith", field, text, ("^", ""))
    }

    /// Matches string fields ending with `text`, ignoring case.
    pub fn ends_with(self, field: impl Into<String>, text: impl Into<String>) -> Self {
        self.regex("endsWith", field, text, ("", "$"))
    }

    /// Matches array fields containing every value. A scalar is treated as a
    /// one-element set.
    pub fn has_all(self, field: impl Into<String>, values: impl Into<Bson>) -> Self {
        self.membership("$all", field, values)
    }

    /// Matches fields equal to (or arrays containing) any of the values. A
    /// scalar is treated as a one-element set.
    pub fn has_some(self, field: impl Into<String>, values: impl Into<Bson>) -> Self {
        self.membership("$in", field, values)
    }

    fn membership(mut self, operator: &'static str, field: impl Into<String>, values: impl Into<Bson>) -> Self {
        let field = field.into();
        let values = into_set(values.into());

        if values.is_empty() && self.error.is_none() {
            self.error = Some(DocumentStoreError::ValidationFailed(format!(
                "{operator} on {field} requires at least one value"
            )));
            return self;
        }

        let values = Bson::Array(values);
        self.apply(operator, &[operator], field, &[&values], |node, field| {
            node.merge_operator(field, operator, values.clone())
        })
    }

    /// Matches documents where `field` does not exist.
    pub fn is_empty(self, field: impl Into<String>) -> Self {
        self.compare("$exists", field, false)
    }

    /// Matches documents where `field` exists.
    pub fn is_not_empty(self, field: impl Into<String>) -> Self {
        self.compare("$exists", field, true)
    }

    /// Requires both this filter and `other` to match.
    pub fn and(self, other: impl Into<Filter>) -> Self {
        self.combine(other.into(), FilterNode::and)
    }

    /// Requires this filter or `other` to match.
    pub fn or(self, other: impl Into<Filter>) -> Self {
        self.combine(other.into(), FilterNode::or)
    }

    /// Requires this filter to match and `other` not to match.
    pub fn not(self, other: impl Into<Filter>) -> Self {
        self.combine(other.into(), FilterNode::not)
    }

    fn combine(mut self, other: Filter, combinator: fn(FilterNode, FilterNode) -> FilterNode) -> Self {
        if self.error.is_some() {
            return self;
        }
        if let Some(err) = other.error {
            self.error = Some(err);
            return self;
        }

        self.node = combinator(self.node, other.node);
        // The tree changed shape, so earlier applications no longer describe it.
        self.applied.clear();
        self
    }

    /// Returns the first recorded validation error, if any.
    pub fn error(&self) -> Option<&DocumentStoreError> {
        self.error.as_ref()
    }

    /// Returns the accumulated node without checking for errors.
    pub fn node(&self) -> &FilterNode {
        &self.node
    }

    /// Returns the accumulated node.
    ///
    /// # Errors
    ///
    /// Returns the first validation error recorded by any builder call.
    pub fn build(self) -> DocumentStoreResult<FilterNode> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.node),
        }
    }
}

impl From<FilterNode> for Filter {
    fn from(node: FilterNode) -> Self {
        Filter { node, ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_operators_on_same_field_merge() {
        let node = Filter::new()
            .gt("age", 18)
            .lt("age", 65)
            .build()
            .unwrap();

        assert_eq!(node.into_document(), doc! { "age": { "$gt": 18, "$lt": 65 } });
    }

    #[test]
    fn test_between_compiles_to_inclusive_range() {
        let node = Filter::new().between("price", 10, 20).build().unwrap();
        assert_eq!(node.into_document(), doc! { "price": { "$gte": 10, "$lte": 20 } });
    }

    #[test]
    fn test_text_operators_compile_to_case_insensitive_regex() {
        let node = Filter::new()
            .contains("title", "rust")
            .starts_with("slug", "a.b")
            .ends_with("email", "@example.com")
            .build()
            .unwrap();

        assert_eq!(
            node.into_document(),
            doc! {
                "title": { "$regex": "rust", "$options": "i" },
                "slug": { "$regex": "^a\\.b", "$options": "i" },
                "email": { "$regex": "@example\\.com$", "$options": "i" },
            }
        );
    }

    #[test]
    fn test_membership_coerces_scalars() {
        let node = Filter::new()
            .has_all("tags", "rust")
            .has_some("status", vec!["draft", "published"])
            .build()
            .unwrap();

        assert_eq!(
            node.into_document(),
            doc! {
                "tags": { "$all": ["rust"] },
                "status": { "$in": ["draft", "published"] },
            }
        );
    }

    #[test]
    fn test_emptiness_compiles_to_exists() {
        let node = Filter::new()
            .is_empty("deletedAt")
            .is_not_empty("email")
            .build()
            .unwrap();

        assert_eq!(
            node.into_document(),
            doc! { "deletedAt": { "$exists": false }, "email": { "$exists": true } }
        );
    }

    #[test]
    fn test_repeated_call_is_idempotent() {
        let once = Filter::new().eq("status", "active").build().unwrap();
        let twice = Filter::new()
            .eq("status", "active")
            .eq("status", "active")
            .build()
            .unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_memoization_does_not_mask_different_arguments() {
        let node = Filter::new()
            .eq("status", "active")
            .eq("status", "archived")
            .eq("status", "active")
            .build()
            .unwrap();

        assert_eq!(node.into_document(), doc! { "status": { "$eq": "active" } });
    }

    #[test]
    fn test_repeated_text_match_reapplies_after_overwrite() {
        let node = Filter::new()
            .contains("title", "a")
            .starts_with("title", "b")
            .contains("title", "a")
            .build()
            .unwrap();

        assert_eq!(node.into_document(), doc! { "title": { "$regex": "a", "$options": "i" } });
    }

    #[test]
    fn test_repeated_range_reapplies_after_bound_changes() {
        let node = Filter::new()
            .between("p", 1, 5)
            .ge("p", 3)
            .between("p", 1, 5)
            .build()
            .unwrap();

        assert_eq!(node.into_document(), doc! { "p": { "$gte": 1, "$lte": 5 } });
    }

    #[test]
    fn test_or_accumulates_siblings() {
        let node = Filter::new()
            .eq("a", 1)
            .or(Filter::new().eq("b", 2))
            .or(Filter::new().eq("c", 3))
            .build()
            .unwrap();

        assert_eq!(
            node.into_document(),
            doc! { "$or": [
                { "a": { "$eq": 1 } },
                { "b": { "$eq": 2 } },
                { "c": { "$eq": 3 } },
            ] }
        );
    }

    #[test]
    fn test_not_merges_nor_entry() {
        let node = Filter::new()
            .eq("a", 1)
            .not(Filter::new().eq("b", 2))
            .not(Filter::new().eq("c", 3))
            .build()
            .unwrap();

        assert_eq!(
            node.into_document(),
            doc! {
                "a": { "$eq": 1 },
                "$nor": [{ "b": { "$eq": 2 } }, { "c": { "$eq": 3 } }],
            }
        );
    }

    #[test]
    fn test_and_with_empty_filter_is_identity() {
        let node = Filter::new().and(Filter::new().eq("a", 1)).build().unwrap();
        assert_eq!(node.into_document(), doc! { "a": { "$eq": 1 } });
    }

    #[test]
    fn test_invalid_field_is_reported_without_mutation() {
        let filter = Filter::new().eq("a", 1).eq("", 2).eq("b", 3);

        assert_eq!(filter.node().as_document(), &doc! { "a": { "$eq": 1 } });
        assert!(matches!(filter.build(), Err(DocumentStoreError::ValidationFailed(_))));
    }

    #[test]
    fn test_operator_field_names_are_rejected() {
        let result = Filter::new().eq("$where", "1 == 1").build();
        assert!(matches!(result, Err(DocumentStoreError::ValidationFailed(_))));
    }

    #[test]
    fn test_missing_value_is_rejected() {
        let result = Filter::new().eq("a", Bson::Undefined).build();
        assert!(matches!(result, Err(DocumentStoreError::ValidationFailed(_))));
    }

    #[test]
    fn test_empty_membership_set_is_rejected() {
        let result = Filter::new().has_some("tags", Vec::<String>::new()).build();
        assert!(matches!(result, Err(DocumentStoreError::ValidationFailed(_))));
    }

    #[test]
    fn test_errors_propagate_through_combinators() {
        let result = Filter::new().eq("a", 1).or(Filter::new().eq("", 1)).build();
        assert!(matches!(result, Err(DocumentStoreError::ValidationFailed(_))));
    }

    #[test]
    fn test_predicate_parsing() {
        let node = Filter::new()
            .ge("age", 18)
            .contains("name", "al")
            .or(Filter::new().eq("vip", true))
            .build()
            .unwrap();

        let predicate = node.predicate().unwrap();
        let Predicate::Or(children) = predicate else {
            panic!("expected $or at the root");
        };

        assert_eq!(children.len(), 2);
        assert!(matches!(
            &children[0],
            Predicate::And(clauses) if clauses.len() == 2
        ));
        assert!(matches!(
            &children[1],
            Predicate::Field { field: "vip", op: FieldOp::Eq, .. }
        ));
    }

    #[test]
    fn test_predicate_rejects_unknown_operators() {
        let node = FilterNode::from_document(doc! { "a": { "$where": "x" } });
        assert!(matches!(node.predicate(), Err(DocumentStoreError::ValidationFailed(_))));
    }
}
