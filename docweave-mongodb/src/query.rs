//! Filter translation to MongoDB query syntax.
//!
//! Filters are already shaped like MongoDB queries. Translating them through
//! the parsed [`Predicate`] tree rejects operators the query layer does not
//! emit before anything reaches the server.

use bson::{Bson, Document, doc};

use docweave_core::{
    error::{DocumentStoreError, DocumentStoreResult},
    filter::{FieldOp, FilterNode, FilterVisitor, Predicate},
};

/// Translates parsed predicates into MongoDB query documents.
pub(crate) struct MongoFilterTranslator;

impl MongoFilterTranslator {
    pub(crate) fn translate(filter: &FilterNode) -> DocumentStoreResult<Document> {
        if filter.is_empty() {
            return Ok(Document::new());
        }

        MongoFilterTranslator.visit_predicate(&filter.predicate()?)
    }

    fn children(&mut self, predicates: &[Predicate<'_>]) -> DocumentStoreResult<Vec<Document>> {
        predicates
            .iter()
            .map(|predicate| self.visit_predicate(predicate))
            .collect()
    }
}

impl FilterVisitor for MongoFilterTranslator {
    type Output = Document;
    type Error = DocumentStoreError;

    fn visit_and(&mut self, predicates: &[Predicate<'_>]) -> Result<Self::Output, Self::Error> {
        Ok(doc! { "$and": self.children(predicates)? })
    }

    fn visit_or(&mut self, predicates: &[Predicate<'_>]) -> Result<Self::Output, Self::Error> {
        Ok(doc! { "$or": self.children(predicates)? })
    }

    fn visit_nor(&mut self, predicates: &[Predicate<'_>]) -> Result<Self::Output, Self::Error> {
        Ok(doc! { "$nor": self.children(predicates)? })
    }

    fn visit_field(&mut self, field: &str, op: FieldOp, value: &Bson) -> Result<Self::Output, Self::Error> {
        let operator = match op {
            FieldOp::Eq => "$eq",
            FieldOp::Ne => "$ne",
            FieldOp::Gt => "$gt",
            FieldOp::Gte => "$gte",
            FieldOp::Lt => "$lt",
            FieldOp::Lte => "$lte",
            FieldOp::In => "$in",
            FieldOp::All => "$all",
            FieldOp::Exists => "$exists",
        };

        Ok(doc! { field: { operator: value.clone() } })
    }

    fn visit_regex(&mut self, field: &str, pattern: &str, options: &str) -> Result<Self::Output, Self::Error> {
        Ok(doc! { field: { "$regex": pattern, "$options": options } })
    }
}

#[cfg(test)]
mod tests {
    use docweave_core::filter::Filter;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_translates_combinators_and_regex() {
        let filter = Filter::new()
            .eq("status", "open")
            .or(Filter::new().starts_with("name", "a.b"))
            .build()
            .unwrap();

        assert_eq!(
            MongoFilterTranslator::translate(&filter).unwrap(),
            doc! {
                "$or": [
                    { "status": { "$eq": "open" } },
                    { "name": { "$regex": "^a\\.b", "$options": "i" } },
                ],
            }
        );
    }

    #[test]
    fn test_rejects_unknown_operators() {
        let filter = FilterNode::from_document(doc! { "age": { "$where": "sleep(1)" } });

        assert!(MongoFilterTranslator::translate(&filter).is_err());
        assert_eq!(MongoFilterTranslator::translate(&FilterNode::new()).unwrap(), doc! {});
    }
}
