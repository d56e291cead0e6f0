//! Execution of aggregation pipelines over in-memory collections.
//!
//! Stages run in order over owned rows. Lookups read other collections from
//! the same store map. `$out` and `$merge` do not write anything here: they are
//! returned as a [`Sink`] for the caller to apply under a write lock.

use std::cmp::Ordering;

use bson::{Bson, Document, doc};
use tracing::trace;

use docweave_core::{
    document::ID_FIELD,
    error::DocumentStoreResult,
    join::Join,
    stage::{Accumulator, GroupKey, GroupSpec, Projection, Stage},
};

use crate::{
    evaluator::{Comparable, DocumentEvaluator, get_path, lookup_path, remove_path, set_path, sort_documents},
    store::StoreMap,
};

/// Where the rows of a pipeline end up when it writes to a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sink {
    /// Replace the target collection with the rows.
    Replace(String),
    /// Upsert the rows into the target collection by `_id`.
    Merge(String),
}

impl Sink {
    /// Writes `rows` into the target collection of `collections`.
    pub(crate) fn apply(self, rows: Vec<Document>, collections: &mut StoreMap) {
        match self {
            Sink::Replace(target) => {
                collections.insert(target, rows);
            }
            Sink::Merge(target) => {
                let documents = collections.entry(target).or_default();
                for row in rows {
                    let position = row.get(ID_FIELD).and_then(|id| {
                        documents
                            .iter()
                            .position(|document| document.get(ID_FIELD).is_some_and(|other| same(other, id)))
                    });
                    match position {
                        Some(position) => documents[position] = row,
                        None => documents.push(row),
                    }
                }
            }
        }
    }
}

/// The rows a pipeline produced and where they should be written, if anywhere.
#[derive(Debug, Default)]
pub(crate) struct PipelineOutput {
    pub rows: Vec<Document>,
    pub sink: Option<Sink>,
}

fn same(left: &Bson, right: &Bson) -> bool {
    Comparable::from(left) == Comparable::from(right)
}

/// Runs `stages` over `rows`, reading joined collections from `collections`.
pub(crate) fn run(stages: &[Stage], mut rows: Vec<Document>, collections: &StoreMap) -> DocumentStoreResult<PipelineOutput> {
    let mut sink = None;

    for stage in stages {
        trace!(stage = stage.operator(), rows = rows.len(), "running stage");

        rows = match stage {
            Stage::Match(filter) => DocumentEvaluator::filter_documents(&rows, filter)?,
            Stage::Sort(sort) => {
                sort_documents(&mut rows, sort);
                rows
            }
            Stage::Group(group) => group_rows(group, &rows),
            Stage::Project(projection) => rows.into_iter().map(|row| project(projection, row)).collect(),
            Stage::ReferenceLength(fields) => rows
                .into_iter()
                .map(|mut row| {
                    for (output, join) in fields {
                        let length = match get_path(&row, join.field()) {
                            Some(Bson::Array(references)) => references.len() as i32,
                            _ => 0,
                        };
                        set_path(&mut row, output, Bson::Int32(length));
                    }
                    row
                })
                .collect(),
            Stage::Lookup(join) => {
                let targets = collections.get(join.collection()).map(Vec::as_slice).unwrap_or_default();
                rows.into_iter().map(|row| lookup(join, targets, row)).collect()
            }
            Stage::Unwind(path) => rows.into_iter().flat_map(|row| unwind(path, row)).collect(),
            Stage::Skip(skip) => rows
                .into_iter()
                .skip(usize::try_from(*skip).unwrap_or(usize::MAX))
                .collect(),
            Stage::Limit(limit) => rows
                .into_iter()
                .take(usize::try_from(*limit).unwrap_or(usize::MAX))
                .collect(),
            Stage::Count(field) => match rows.len() {
                0 => Vec::new(),
                count => vec![doc! { field.as_str(): count as i32 }],
            },
            Stage::Out(target) => {
                sink = Some(Sink::Replace(target.clone()));
                rows
            }
            Stage::Merge(target) => {
                sink = Some(Sink::Merge(target.clone()));
                rows
            }
        };
    }

    Ok(PipelineOutput { rows, sink })
}

fn group_key(key: &GroupKey, row: &Document) -> Bson {
    match key {
        GroupKey::All => Bson::Null,
        GroupKey::Value(field) => get_path(row, field).cloned().unwrap_or(Bson::Null),
        GroupKey::Fields(fields) => {
            let mut key = Document::new();
            for field in fields {
                if let Some(value) = get_path(row, field) {
                    key.insert(field.as_str(), value.clone());
                }
            }
            Bson::Document(key)
        }
    }
}

/// Groups rows in order of first appearance of each key.
fn group_rows(group: &GroupSpec, rows: &[Document]) -> Vec<Document> {
    let mut groups: Vec<(Bson, Vec<&Document>)> = Vec::new();

    for row in rows {
        let key = group_key(group.key(), row);
        match groups.iter_mut().find(|(existing, _)| same(existing, &key)) {
            Some((_, members)) => members.push(row),
            None => groups.push((key, vec![row])),
        }
    }

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut output = doc! { ID_FIELD: key };
            for (name, accumulator) in group.accumulators() {
                output.insert(name.as_str(), accumulate(accumulator, &members));
            }
            output
        })
        .collect()
}

fn accumulate(accumulator: &Accumulator, members: &[&Document]) -> Bson {
    let values = |field: &str| {
        members
            .iter()
            .filter_map(|member| get_path(member, field))
            .cloned()
            .collect::<Vec<_>>()
    };

    match accumulator {
        Accumulator::Sum(field) => sum(&values(field)),
        Accumulator::Count => i32::try_from(members.len())
            .map(Bson::Int32)
            .unwrap_or(Bson::Int64(members.len() as i64)),
        Accumulator::Avg(field) => {
            let numbers = values(field).iter().filter_map(number).collect::<Vec<_>>();
            match numbers.len() {
                0 => Bson::Null,
                count => Bson::Double(numbers.iter().sum::<f64>() / count as f64),
            }
        }
        Accumulator::Min(field) => extreme(values(field), Ordering::Less),
        Accumulator::Max(field) => extreme(values(field), Ordering::Greater),
        Accumulator::FirstDocument => members
            .first()
            .map(|member| Bson::Document((*member).clone()))
            .unwrap_or(Bson::Null),
    }
}

fn number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(value) => Some(*value as f64),
        Bson::Int64(value) => Some(*value as f64),
        Bson::Double(value) => Some(*value),
        _ => None,
    }
}

/// Sums the numeric values, ignoring everything else. Integer sums stay
/// integers until they overflow.
fn sum(values: &[Bson]) -> Bson {
    let mut integer: Option<i64> = Some(0);
    let mut float = 0.0;
    let mut wide = false;

    for value in values {
        match value {
            Bson::Int32(value) => integer = integer.and_then(|sum| sum.checked_add(*value as i64)),
            Bson::Int64(value) => {
                wide = true;
                integer = integer.and_then(|sum| sum.checked_add(*value));
            }
            Bson::Double(_) => integer = None,
            _ => continue,
        }
        if let Some(value) = number(value) {
            float += value;
        }
    }

    match integer {
        Some(sum) if !wide => i32::try_from(sum).map(Bson::Int32).unwrap_or(Bson::Int64(sum)),
        Some(sum) => Bson::Int64(sum),
        None => Bson::Double(float),
    }
}

fn extreme(values: Vec<Bson>, wanted: Ordering) -> Bson {
    values
        .into_iter()
        .filter(|value| !matches!(value, Bson::Null))
        .reduce(|best, value| {
            if Comparable::from(&value).sort_cmp(&Comparable::from(&best)) == wanted {
                value
            } else {
                best
            }
        })
        .unwrap_or(Bson::Null)
}

fn project(projection: &Projection, mut row: Document) -> Document {
    match projection {
        Projection::Include(fields) => {
            let mut projected = Document::new();
            if !fields.iter().any(|field| field == ID_FIELD) {
                if let Some(id) = row.get(ID_FIELD) {
                    projected.insert(ID_FIELD, id.clone());
                }
            }
            for field in fields {
                if let Some(value) = get_path(&row, field) {
                    set_path(&mut projected, field, value.clone());
                }
            }
            projected
        }
        Projection::Exclude(fields) => {
            for field in fields {
                remove_path(&mut row, field);
            }
            row
        }
    }
}

fn lookup(join: &Join, targets: &[Document], mut row: Document) -> Document {
    let references = match get_path(&row, join.field()) {
        Some(Bson::Array(references)) => references.clone(),
        Some(reference) => vec![reference.clone()],
        None => Vec::new(),
    };

    let mut joined = targets
        .iter()
        .filter(|target| {
            lookup_path(target, join.foreign())
                .into_iter()
                .any(|value| references.iter().any(|reference| same(value, reference)))
        })
        .cloned()
        .collect::<Vec<_>>();
    sort_documents(&mut joined, join.sort());
    joined.truncate(usize::try_from(join.limit()).unwrap_or(usize::MAX));

    set_path(&mut row, join.output(), Bson::Array(joined.into_iter().map(Bson::Document).collect()));
    row
}

/// Unwinds an array field, keeping rows whose array is missing or empty.
fn unwind(path: &str, mut row: Document) -> Vec<Document> {
    let items = match get_path(&row, path) {
        Some(Bson::Array(items)) => items.clone(),
        _ => return vec![row],
    };

    if items.is_empty() {
        remove_path(&mut row, path);
        return vec![row];
    }

    items
        .into_iter()
        .map(|item| {
            let mut unwound = row.clone();
            set_path(&mut unwound, path, item);
            unwound
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use docweave_core::stage::{SortDirection, SortSpec};
    use pretty_assertions::assert_eq;

    use super::*;

    fn orders() -> Vec<Document> {
        vec![
            doc! { "_id": "o1", "category": "books", "amount": 10 },
            doc! { "_id": "o2", "category": "games", "amount": 25 },
            doc! { "_id": "o3", "category": "books", "amount": 5 },
        ]
    }

    #[test]
    fn test_group_keeps_first_seen_order() {
        let group = GroupSpec::new(GroupKey::Fields(vec!["category".into()]))
            .with("amountSum", Accumulator::Sum("amount".into()))
            .with("amountAvg", Accumulator::Avg("amount".into()))
            .with("amountMax", Accumulator::Max("amount".into()))
            .with("count", Accumulator::Count);

        let output = run(&[Stage::Group(group)], orders(), &StoreMap::new()).unwrap();

        assert_eq!(
            output.rows,
            vec![
                doc! { "_id": { "category": "books" }, "amountSum": 15, "amountAvg": 7.5, "amountMax": 10, "count": 2 },
                doc! { "_id": { "category": "games" }, "amountSum": 25, "amountAvg": 25.0, "amountMax": 25, "count": 1 },
            ]
        );
    }

    #[test]
    fn test_count_of_nothing_yields_no_row() {
        let output = run(&[Stage::Count("total".into())], Vec::new(), &StoreMap::new()).unwrap();
        assert!(output.rows.is_empty());

        let output = run(&[Stage::Count("total".into())], orders(), &StoreMap::new()).unwrap();
        assert_eq!(output.rows, vec![doc! { "total": 3 }]);
    }

    #[test]
    fn test_lookup_sorts_and_limits_joined_items() {
        let mut collections = StoreMap::new();
        collections.insert(
            "members".into(),
            vec![
                doc! { "_id": "m1", "name": "Ada", "_createdDate": 2 },
                doc! { "_id": "m2", "name": "Grace", "_createdDate": 1 },
                doc! { "_id": "m3", "name": "Linus", "_createdDate": 3 },
            ],
        );
        let join = Join::new("authors", "members").max_items(2);
        let rows = vec![doc! { "_id": "p1", "authors": ["m1", "m2", "m3"] }];

        let output = run(&[Stage::Lookup(join)], rows, &collections).unwrap();
        let names = output.rows[0]
            .get_array("authors")
            .unwrap()
            .iter()
            .map(|author| author.as_document().unwrap().get_str("name").unwrap())
            .collect::<Vec<_>>();

        assert_eq!(names, vec!["Grace", "Ada"]);
    }

    #[test]
    fn test_unwind_preserves_empty_arrays() {
        let rows = vec![doc! { "_id": 1, "tags": ["a", "b"] }, doc! { "_id": 2, "tags": [] }];

        let output = run(&[Stage::Unwind("tags".into())], rows, &StoreMap::new()).unwrap();

        assert_eq!(
            output.rows,
            vec![doc! { "_id": 1, "tags": "a" }, doc! { "_id": 1, "tags": "b" }, doc! { "_id": 2 }]
        );
    }

    #[test]
    fn test_sort_skip_limit_and_project() {
        let stages = [
            Stage::Sort(SortSpec::new().with("amount", SortDirection::Descending)),
            Stage::Skip(1),
            Stage::Limit(1),
            Stage::Project(Projection::Include(vec!["amount".into()])),
        ];

        let output = run(&stages, orders(), &StoreMap::new()).unwrap();

        assert_eq!(output.rows, vec![doc! { "_id": "o1", "amount": 10 }]);
    }

    #[test]
    fn test_merge_sink_upserts_by_id() {
        let mut collections = StoreMap::new();
        collections.insert("totals".into(), vec![doc! { "_id": "books", "sum": 1 }]);

        let output = run(
            &[Stage::Merge("totals".into())],
            vec![doc! { "_id": "books", "sum": 15 }, doc! { "_id": "games", "sum": 25 }],
            &collections,
        )
        .unwrap();
        let sink = output.sink.clone().unwrap();
        sink.apply(output.rows, &mut collections);

        assert_eq!(
            collections["totals"],
            vec![doc! { "_id": "books", "sum": 15 }, doc! { "_id": "games", "sum": 25 }]
        );
    }
}
