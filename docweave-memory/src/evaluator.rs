//! Filter evaluation and ordering for in-memory documents.
//!
//! Filters are parsed once into a [`Predicate`] tree and walked per document by
//! [`DocumentEvaluator`]. Field paths may be dotted; arrays met along a path fan
//! out to their elements, and a comparison matches when any reached value (or
//! any element of a reached array) satisfies it.

use std::{cmp::Ordering, collections::HashMap};

use bson::{Bson, DateTime, Document};
use regex_lite::RegexBuilder;

use docweave_core::{
    error::{DocumentStoreError, DocumentStoreResult},
    filter::{FieldOp, FilterNode, FilterVisitor, Predicate},
    stage::SortSpec,
};

/// Type-erased, comparable representation of BSON values.
///
/// Numbers of every width compare as `f64`. Values of different kinds never
/// compare in filters; sorting ranks the kinds instead.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    Null,
    Bool(bool),
    Number(f64),
    DateTime(DateTime),
    String(&'a str),
    Array(Vec<Comparable<'a>>),
    Map(HashMap<&'a str, Comparable<'a>>),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Number(*value as f64),
            Bson::Int64(value) => Comparable::Number(*value as f64),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::Array(values) => Comparable::Array(values.iter().map(Comparable::from).collect()),
            Bson::Document(document) => Comparable::Map(
                document
                    .iter()
                    .map(|(key, value)| (key.as_str(), Comparable::from(value)))
                    .collect(),
            ),
            // Other types are not comparable
            _ => Comparable::Null,
        }
    }
}

impl PartialEq for Comparable<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Comparable<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl Comparable<'_> {
    fn rank(&self) -> u8 {
        match self {
            Comparable::Null => 0,
            Comparable::Number(_) => 1,
            Comparable::String(_) => 2,
            Comparable::Map(_) => 3,
            Comparable::Array(_) => 4,
            Comparable::Bool(_) => 5,
            Comparable::DateTime(_) => 6,
        }
    }

    /// Total order for sorting: kinds by rank, then values within a kind.
    pub(crate) fn sort_cmp(&self, other: &Self) -> Ordering {
        self.rank()
            .cmp(&other.rank())
            .then_with(|| self.partial_cmp(other).unwrap_or(Ordering::Equal))
    }
}

/// Returns the value at a dotted path, descending through documents only.
pub(crate) fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(document) => document.get(segment)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Sets the value at a dotted path, creating intermediate documents.
pub(crate) fn set_path(document: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            document.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(document.get(head), Some(Bson::Document(_))) {
                document.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = document.get_mut(head) {
                set_path(child, rest, value);
            }
        }
    }
}

/// Removes the value at a dotted path.
pub(crate) fn remove_path(document: &mut Document, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => document.remove(path),
        Some((head, rest)) => match document.get_mut(head) {
            Some(Bson::Document(child)) => remove_path(child, rest),
            _ => None,
        },
    }
}

/// Collects every value reachable at a dotted path, fanning out over arrays.
pub(crate) fn lookup_path<'a>(document: &'a Document, path: &str) -> Vec<&'a Bson> {
    let segments = path.split('.').collect::<Vec<_>>();
    let mut found = Vec::new();

    if let Some(value) = document.get(segments[0]) {
        collect(value, &segments[1..], &mut found);
    }

    found
}

fn collect<'a>(value: &'a Bson, segments: &[&str], found: &mut Vec<&'a Bson>) {
    let Some((head, rest)) = segments.split_first() else {
        found.push(value);
        return;
    };

    match value {
        Bson::Document(document) => {
            if let Some(next) = document.get(*head) {
                collect(next, rest, found);
            }
        }
        Bson::Array(items) => {
            if let Some(item) = head.parse::<usize>().ok().and_then(|index| items.get(index)) {
                collect(item, rest, found);
            }
            for item in items.iter().filter(|item| matches!(item, Bson::Document(_))) {
                collect(item, segments, found);
            }
        }
        _ => {}
    }
}

/// The reached values plus the elements of reached arrays.
fn expand<'a>(candidates: &[&'a Bson]) -> Vec<&'a Bson> {
    let mut expanded = Vec::with_capacity(candidates.len());
    for &candidate in candidates {
        expanded.push(candidate);
        if let Bson::Array(items) = candidate {
            expanded.extend(items.iter());
        }
    }

    expanded
}

fn equals(candidates: &[&Bson], operand: &Bson) -> bool {
    if candidates.is_empty() {
        return matches!(operand, Bson::Null);
    }

    let operand = Comparable::from(operand);
    expand(candidates)
        .into_iter()
        .any(|candidate| Comparable::from(candidate) == operand)
}

fn operand_set<'v>(field: &str, op: FieldOp, value: &'v Bson) -> DocumentStoreResult<&'v [Bson]> {
    match value {
        Bson::Array(values) => Ok(values),
        _ => Err(DocumentStoreError::ValidationFailed(format!(
            "{op:?} on {field} requires an array operand"
        ))),
    }
}

/// Evaluates parsed predicates against one document.
pub(crate) struct DocumentEvaluator<'a> {
    document: &'a Document,
}

impl<'a> DocumentEvaluator<'a> {
    pub fn new(document: &'a Document) -> Self {
        Self { document }
    }

    pub fn evaluate(&mut self, predicate: &Predicate<'_>) -> DocumentStoreResult<bool> {
        self.visit_predicate(predicate)
    }

    /// Returns `true` if `document` matches `filter`.
    pub fn matches(document: &Document, filter: &FilterNode) -> DocumentStoreResult<bool> {
        DocumentEvaluator::new(document).evaluate(&filter.predicate()?)
    }

    /// Returns clones of the documents matching `filter`, in input order.
    pub fn filter_documents<'d>(
        documents: impl IntoIterator<Item = &'d Document>,
        filter: &FilterNode,
    ) -> DocumentStoreResult<Vec<Document>> {
        let predicate = filter.predicate()?;
        let mut matched = Vec::new();

        for document in documents {
            if DocumentEvaluator::new(document).evaluate(&predicate)? {
                matched.push(document.clone());
            }
        }

        Ok(matched)
    }
}

impl FilterVisitor for DocumentEvaluator<'_> {
    type Output = bool;
    type Error = DocumentStoreError;

    fn visit_and(&mut self, predicates: &[Predicate<'_>]) -> Result<Self::Output, Self::Error> {
        for predicate in predicates {
            if !self.visit_predicate(predicate)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn visit_or(&mut self, predicates: &[Predicate<'_>]) -> Result<Self::Output, Self::Error> {
        for predicate in predicates {
            if self.visit_predicate(predicate)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn visit_nor(&mut self, predicates: &[Predicate<'_>]) -> Result<Self::Output, Self::Error> {
        Ok(!self.visit_or(predicates)?)
    }

    fn visit_field(&mut self, field: &str, op: FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        let candidates = lookup_path(self.document, field);

        Ok(match op {
            FieldOp::Eq => equals(&candidates, value),
            FieldOp::Ne => !equals(&candidates, value),
            FieldOp::Gt | FieldOp::Gte | FieldOp::Lt | FieldOp::Lte => {
                let operand = Comparable::from(value);
                expand(&candidates).into_iter().any(|candidate| {
                    match Comparable::from(candidate).partial_cmp(&operand) {
                        Some(ordering) => match op {
                            FieldOp::Gt => ordering == Ordering::Greater,
                            FieldOp::Gte => ordering != Ordering::Less,
                            FieldOp::Lt => ordering == Ordering::Less,
                            _ => ordering != Ordering::Greater,
                        },
                        None => false,
                    }
                })
            }
            FieldOp::In => operand_set(field, op, value)?
                .iter()
                .any(|operand| equals(&candidates, operand)),
            FieldOp::All => {
                let operands = operand_set(field, op, value)?;
                !operands.is_empty() && operands.iter().all(|operand| equals(&candidates, operand))
            }
            FieldOp::Exists => {
                let should_exist = !matches!(value, Bson::Boolean(false) | Bson::Null | Bson::Int32(0) | Bson::Int64(0));
                candidates.is_empty() != should_exist
            }
        })
    }

    fn visit_regex(&mut self, field: &str, pattern: &str, options: &str) -> Result<Self::Output, Self::Error> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(options.contains('i'))
            .build()
            .map_err(|err| DocumentStoreError::ValidationFailed(format!("invalid pattern for {field}: {err}")))?;
        let candidates = lookup_path(self.document, field);

        Ok(expand(&candidates)
            .into_iter()
            .any(|candidate| matches!(candidate, Bson::String(text) if regex.is_match(text))))
    }
}

/// Sorts documents in place by the keys of `sort`. The sort is stable.
pub(crate) fn sort_documents(documents: &mut [Document], sort: &SortSpec) {
    if sort.is_empty() {
        return;
    }

    documents.sort_by(|left, right| {
        for (field, direction) in sort.keys() {
            let left = get_path(left, field).map(Comparable::from).unwrap_or(Comparable::Null);
            let right = get_path(right, field).map(Comparable::from).unwrap_or(Comparable::Null);
            let ordering = left.sort_cmp(&right);
            if ordering != Ordering::Equal {
                return if direction.value() < 0 { ordering.reverse() } else { ordering };
            }
        }

        Ordering::Equal
    })
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use docweave_core::{filter::Filter, stage::SortDirection};
    use pretty_assertions::assert_eq;

    use super::*;

    fn matches(document: &Document, filter: Filter) -> bool {
        DocumentEvaluator::matches(document, &filter.build().unwrap()).unwrap()
    }

    #[test]
    fn test_comparisons() {
        let order = doc! { "amount": 12, "category": "books", "tags": ["new", "sale"] };

        assert!(matches(&order, Filter::new().eq("category", "books")));
        assert!(matches(&order, Filter::new().gt("amount", 10.5)));
        assert!(!matches(&order, Filter::new().lt("amount", 12)));
        assert!(matches(&order, Filter::new().between("amount", 12, 20)));
        assert!(!matches(&order, Filter::new().gt("category", 1)));
        assert!(matches(&order, Filter::new().ne("category", "toys")));
    }

    #[test]
    fn test_array_membership() {
        let order = doc! { "tags": ["new", "sale"] };

        assert!(matches(&order, Filter::new().eq("tags", "sale")));
        assert!(matches(&order, Filter::new().has_some("tags", vec!["old", "new"])));
        assert!(matches(&order, Filter::new().has_all("tags", vec!["new", "sale"])));
        assert!(!matches(&order, Filter::new().has_all("tags", vec!["new", "old"])));
    }

    #[test]
    fn test_text_matching_ignores_case() {
        let member = doc! { "name": "Ada Lovelace" };

        assert!(matches(&member, Filter::new().contains("name", "LOVE")));
        assert!(matches(&member, Filter::new().starts_with("name", "ada")));
        assert!(matches(&member, Filter::new().ends_with("name", "lace")));
        assert!(!matches(&member, Filter::new().starts_with("name", "lace")));
        assert!(!matches(&member, Filter::new().contains("name", "a.a")));
    }

    #[test]
    fn test_combinators_and_existence() {
        let order = doc! { "status": "open", "customer": { "tier": "gold" } };

        assert!(matches(&order, Filter::new().eq("customer.tier", "gold")));
        assert!(matches(&order, Filter::new().is_empty("shippedAt")));
        assert!(!matches(&order, Filter::new().is_not_empty("shippedAt")));
        assert!(matches(
            &order,
            Filter::new().eq("status", "closed").or(Filter::new().eq("customer.tier", "gold"))
        ));
        assert!(!matches(&order, Filter::new().eq("status", "open").not(Filter::new().eq("customer.tier", "gold"))));
    }

    #[test]
    fn test_sort_documents_is_stable_and_ranks_missing_first() {
        let mut documents = vec![
            doc! { "n": 2, "label": "a" },
            doc! { "label": "b" },
            doc! { "n": 1, "label": "c" },
            doc! { "n": 2, "label": "d" },
        ];
        sort_documents(&mut documents, &SortSpec::new().with("n", SortDirection::Ascending));

        let labels = documents
            .iter()
            .map(|document| document.get_str("label").unwrap())
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["b", "c", "a", "d"]);
    }

    #[test]
    fn test_paths() {
        let mut document = doc! { "a": { "b": 1 }, "items": [{ "sku": "x" }, { "sku": "y" }] };

        assert_eq!(get_path(&document, "a.b"), Some(&Bson::Int32(1)));
        assert_eq!(lookup_path(&document, "items.sku").len(), 2);

        set_path(&mut document, "a.c", Bson::Int32(2));
        assert_eq!(remove_path(&mut document, "a.b"), Some(Bson::Int32(1)));
        assert_eq!(document.get_document("a").unwrap(), &doc! { "c": 2 });
    }
}
