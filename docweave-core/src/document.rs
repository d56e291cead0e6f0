//! System fields, sanitisation and conversions for stored items.
//!
//! Items are loosely typed BSON documents. Every stored item carries an `_id`
//! and the `_createdDate`/`_updatedDate` timestamps. Items written by an
//! identified caller also carry an `_owner`.
//!
//! Incoming items are never stored as received: [`sanitize`] rebuilds them key
//! by key so operator-like keys cannot reach the database.

use bson::{Bson, DateTime, Document, de::deserialize_from_bson, ser::serialize_to_bson};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DocumentStoreError, DocumentStoreResult};

/// Identity field of every item.
pub const ID_FIELD: &str = "_id";
/// Creation timestamp, set once on insert.
pub const CREATED_FIELD: &str = "_createdDate";
/// Last modification timestamp.
pub const UPDATED_FIELD: &str = "_updatedDate";
/// Identity of the caller that created the item.
pub const OWNER_FIELD: &str = "_owner";

/// Fields managed by the store that callers cannot change through updates.
pub const PROTECTED_FIELDS: [&str; 3] = [ID_FIELD, CREATED_FIELD, OWNER_FIELD];

/// Generates a new item identity.
pub fn new_id() -> Bson {
    Bson::String(Uuid::new_v4().to_string())
}

/// Renders an identity for error messages.
pub fn id_label(id: &Bson) -> String {
    match id {
        Bson::String(id) => id.clone(),
        other => other.to_string(),
    }
}

fn check_key(key: &str) -> DocumentStoreResult<()> {
    if key.is_empty() || key.starts_with('$') || key.contains('\0') {
        return Err(DocumentStoreError::InvalidDocument(format!("key {key:?} is not allowed")));
    }

    Ok(())
}

/// Rebuilds a single value, applying [`sanitize`] to nested documents.
pub fn sanitize_value(value: &Bson) -> DocumentStoreResult<Bson> {
    Ok(match value {
        Bson::Document(document) => Bson::Document(sanitize(document)?),
        Bson::Array(values) => Bson::Array(values.iter().map(sanitize_value).collect::<DocumentStoreResult<_>>()?),
        Bson::JavaScriptCode(_) | Bson::JavaScriptCodeWithScope(_) => {
            return Err(DocumentStoreError::InvalidDocument("code values cannot be stored".into()));
        }
        other => other.clone(),
    })
}

/// Rebuilds `document` into a fresh document, rejecting keys that start with
/// `$`, contain NUL or are empty, at any depth.
pub fn sanitize(document: &Document) -> DocumentStoreResult<Document> {
    let mut clean = Document::new();
    for (key, value) in document {
        check_key(key)?;
        clean.insert(key.as_str(), sanitize_value(value)?);
    }

    Ok(clean)
}

/// Prepares a sanitized item for insertion: assigns an identity if it has
/// none, stamps both timestamps and records the owner.
pub fn stamp_new(mut item: Document, owner: Option<&str>, now: DateTime) -> Document {
    if !item.contains_key(ID_FIELD) {
        item.insert(ID_FIELD, new_id());
    }
    item.insert(CREATED_FIELD, now);
    item.insert(UPDATED_FIELD, now);
    match owner {
        Some(owner) => {
            item.insert(OWNER_FIELD, owner);
        }
        None => {
            item.remove(OWNER_FIELD);
        }
    }

    item
}

/// Builds the replacement for `existing`: `replacement` keeps the identity,
/// creation time and owner of the stored item.
pub fn stamp_replacement(mut replacement: Document, existing: &Document, now: DateTime) -> Document {
    for field in PROTECTED_FIELDS {
        match existing.get(field) {
            Some(value) => {
                replacement.insert(field, value.clone());
            }
            None => {
                replacement.remove(field);
            }
        }
    }
    replacement.insert(UPDATED_FIELD, now);

    replacement
}

/// Reads a numeric BSON value as a count.
pub fn as_count(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(value) => u64::try_from(*value).ok(),
        Bson::Int64(value) => u64::try_from(*value).ok(),
        Bson::Double(value) if *value >= 0.0 => Some(*value as u64),
        _ => None,
    }
}

/// Serializes a value into a document.
///
/// # Errors
///
/// Returns [`DocumentStoreError::InvalidDocument`] if the value does not
/// serialize to a document.
pub fn to_document<T: Serialize>(value: &T) -> DocumentStoreResult<Document> {
    match serialize_to_bson(value)? {
        Bson::Document(document) => Ok(document),
        other => Err(DocumentStoreError::InvalidDocument(format!(
            "expected a document, found {:?}",
            other.element_type()
        ))),
    }
}

/// Deserializes a stored value.
pub fn from_bson<T: DeserializeOwned>(value: Bson) -> DocumentStoreResult<T> {
    Ok(deserialize_from_bson(value)?)
}

/// Converts a stored value into relaxed extended JSON.
pub fn to_json(value: Bson) -> Value {
    value.into_relaxed_extjson()
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    use super::*;

    #[test]
    fn test_sanitize_rejects_operator_keys_at_any_depth() {
        assert!(sanitize(&doc! { "name": "a", "profile": { "$where": "1" } }).is_err());
        assert!(sanitize(&doc! { "tags": [{ "$gt": 1 }] }).is_err());
        assert!(sanitize(&doc! { "a\0b": 1 }).is_err());
    }

    #[test]
    fn test_sanitize_preserves_shape() {
        let item = doc! { "name": "a", "nested": { "tags": ["x", "y"] }, "n": 3 };
        assert_eq!(sanitize(&item).unwrap(), item);
    }

    #[test]
    fn test_stamp_new_assigns_system_fields() {
        let now = DateTime::from_millis(1_000);
        let item = stamp_new(doc! { "name": "a", "_owner": "forged" }, Some("u1"), now);

        assert!(matches!(item.get(ID_FIELD), Some(Bson::String(_))));
        assert_eq!(item.get_datetime(CREATED_FIELD).unwrap(), &now);
        assert_eq!(item.get_datetime(UPDATED_FIELD).unwrap(), &now);
        assert_eq!(item.get_str(OWNER_FIELD).unwrap(), "u1");

        let anonymous = stamp_new(doc! { "_id": "fixed", "_owner": "forged" }, None, now);
        assert_eq!(anonymous.get_str(ID_FIELD).unwrap(), "fixed");
        assert!(!anonymous.contains_key(OWNER_FIELD));
    }

    #[test]
    fn test_replacement_keeps_protected_fields() {
        let created = DateTime::from_millis(1_000);
        let now = DateTime::from_millis(2_000);
        let existing = doc! { "_id": "a", "_createdDate": created, "_owner": "u1", "name": "old" };

        let replaced = stamp_replacement(doc! { "_id": "b", "name": "new" }, &existing, now);

        assert_eq!(
            replaced,
            doc! { "_id": "a", "name": "new", "_createdDate": created, "_owner": "u1", "_updatedDate": now }
        );
    }

    #[test]
    fn test_typed_round_trip() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Order {
            category: String,
            amount: i32,
        }

        let order = Order { category: "a".into(), amount: 10 };
        let document = to_document(&order).unwrap();

        assert_eq!(document, doc! { "category": "a", "amount": 10 });
        assert_eq!(from_bson::<Order>(Bson::Document(document)).unwrap(), order);
    }

    #[test]
    fn test_json_conversion() {
        let item = doc! { "a": 1, "b": "x" };
        assert_eq!(to_json(Bson::Document(item)), serde_json::json!({ "a": 1, "b": "x" }));
    }

    #[test]
    fn test_as_count() {
        assert_eq!(as_count(&Bson::Int32(3)), Some(3));
        assert_eq!(as_count(&Bson::Int64(7)), Some(7));
        assert_eq!(as_count(&Bson::Int32(-1)), None);
        assert_eq!(as_count(&Bson::String("3".into())), None);
    }
}
