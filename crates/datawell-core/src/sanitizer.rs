//! Document sanitization before persistence.
//!
//! Keys whose value is empty (empty string, empty sequence, empty mapping or
//! null) are removed recursively through nested mappings. Mappings that end
//! up empty after cleaning are removed as well. Sequences are kept as-is
//! unless they are empty, so positional series stay aligned. Non-empty falsy
//! values such as `0` and `false` are kept.

use crate::document::{Document, ItemKey, DATE_FIELD, DATE_FORMAT};
use crate::error::{CoreError, Result};
use chrono::NaiveDate;
use serde_json::{Map, Value};

/// Clean an arbitrary JSON value that must be a mapping.
pub fn clean(document: &Value) -> Result<Document> {
    match document {
        Value::Object(map) => Ok(clean_document(map)),
        other => Err(CoreError::InvalidArgument(format!(
            "document must be a mapping, got {}",
            value_kind(other)
        ))),
    }
}

/// Clean a document, returning a new mapping.
pub fn clean_document(document: &Document) -> Document {
    clean_map(document)
}

/// Check that both identity fields are present.
pub fn validate(document: &Document) -> bool {
    ItemKey::from_item(document).is_some()
}

/// `validate`, plus the sort key must be a `YYYY-MM-DD` date.
pub fn validate_strict(document: &Document) -> bool {
    validate(document)
        && document
            .get(DATE_FIELD)
            .and_then(Value::as_str)
            .is_some_and(|date| NaiveDate::parse_from_str(date, DATE_FORMAT).is_ok())
}

/// Result of sanitizing a batch of documents.
#[derive(Debug, Clone, Default)]
pub struct SanitizeReport {
    /// Cleaned documents with a valid identity.
    pub accepted: Vec<Document>,
    /// Inputs dropped: not a mapping, or missing `symbol`/`date`.
    pub dropped: usize,
}

/// Clean then validate every document, dropping the ones that fail.
pub fn sanitize_documents<I>(documents: I) -> SanitizeReport
where
    I: IntoIterator<Item = Value>,
{
    let mut report = SanitizeReport::default();
    for document in documents {
        match clean(&document) {
            Ok(cleaned) if validate(&cleaned) => report.accepted.push(cleaned),
            _ => report.dropped += 1,
        }
    }
    report
}

fn clean_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter_map(|(key, value)| clean_value(value).map(|cleaned| (key.clone(), cleaned)))
        .collect()
}

fn clean_value(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Object(map) => {
            let cleaned = clean_map(map);
            (!cleaned.is_empty()).then_some(Value::Object(cleaned))
        }
        other => Some(other.clone()),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}
