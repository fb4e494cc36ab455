//! Snapshot documents and their persisted layout.
//!
//! A document is a free-form JSON mapping that always carries two identity
//! fields: `symbol` (partition key) and `date` (sort key). In the table each
//! document is wrapped as `{symbol, date, document: <full payload>}`.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Partition key attribute.
pub const SYMBOL_FIELD: &str = "symbol";
/// Sort key attribute.
pub const DATE_FIELD: &str = "date";
/// Attribute holding the original payload.
pub const DOCUMENT_FIELD: &str = "document";
/// ISO-8601 calendar date format used for the sort key.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Per-symbol snapshot document.
pub type Document = Map<String, Value>;

/// Raw table item as exchanged with the store.
pub type Item = Map<String, Value>;

/// Primary key of a stored item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub symbol: String,
    pub date: String,
}

impl ItemKey {
    pub fn new(symbol: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            date: date.into(),
        }
    }

    /// Extract the key from an item or document.
    ///
    /// Returns `None` unless `symbol` is a non-empty string and `date` is a
    /// non-empty string.
    pub fn from_item(item: &Item) -> Option<Self> {
        let symbol = item.get(SYMBOL_FIELD)?.as_str()?;
        let date = item.get(DATE_FIELD)?.as_str()?;
        if symbol.is_empty() || date.is_empty() {
            return None;
        }
        Some(Self::new(symbol, date))
    }

    /// Key attributes only, as an item.
    pub fn to_item(&self) -> Item {
        let mut item = Map::new();
        item.insert(SYMBOL_FIELD.to_string(), Value::String(self.symbol.clone()));
        item.insert(DATE_FIELD.to_string(), Value::String(self.date.clone()));
        item
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.date)
    }
}

/// Persisted item body: `{symbol, date, document}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub symbol: String,
    pub date: String,
    /// Original payload. Items written with their key only have none.
    #[serde(default)]
    pub document: Document,
}

impl StoredItem {
    /// Wrap a document, copying its identity fields into the item key.
    ///
    /// Returns `None` when the document has no usable identity.
    pub fn from_document(document: Document) -> Option<Self> {
        let key = ItemKey::from_item(&document)?;
        Some(Self {
            symbol: key.symbol,
            date: key.date,
            document,
        })
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.symbol.clone(), self.date.clone())
    }

    /// Convert into the raw item layout.
    pub fn into_item(self) -> Item {
        let mut item = Map::new();
        item.insert(SYMBOL_FIELD.to_string(), Value::String(self.symbol));
        item.insert(DATE_FIELD.to_string(), Value::String(self.date));
        item.insert(DOCUMENT_FIELD.to_string(), Value::Object(self.document));
        item
    }

    /// Parse a raw item returned by the store.
    pub fn from_item(item: Item) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(item))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_key_from_item() {
        let doc = as_map(json!({"symbol": "AAE", "date": "2017-10-12", "price": 1.5}));
        let key = ItemKey::from_item(&doc).unwrap();
        assert_eq!(key, ItemKey::new("AAE", "2017-10-12"));
        assert_eq!(key.to_string(), "AAE@2017-10-12");
    }

    #[test]
    fn test_key_requires_string_identity() {
        assert!(ItemKey::from_item(&as_map(json!({"date": "2017-10-12"}))).is_none());
        assert!(ItemKey::from_item(&as_map(json!({"symbol": "AAE"}))).is_none());
        assert!(ItemKey::from_item(&as_map(json!({"symbol": 7, "date": "2017-10-12"}))).is_none());
        assert!(ItemKey::from_item(&as_map(json!({"symbol": "", "date": "2017-10-12"}))).is_none());
    }

    #[test]
    fn test_stored_item_layout() {
        let doc = as_map(json!({"symbol": "AAE", "date": "2017-10-12", "quote": {"last": 3}}));
        let item = StoredItem::from_document(doc.clone()).unwrap().into_item();

        assert_eq!(item["symbol"], json!("AAE"));
        assert_eq!(item["date"], json!("2017-10-12"));
        assert_eq!(item["document"], Value::Object(doc));
    }

    #[test]
    fn test_stored_item_from_key_only_item() {
        let item = ItemKey::new("EPM", "2020-04-02").to_item();
        let stored = StoredItem::from_item(item).unwrap();
        assert_eq!(stored.symbol, "EPM");
        assert!(stored.document.is_empty());
    }
}
