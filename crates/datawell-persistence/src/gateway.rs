//! Table store boundary.
//!
//! `StoreGateway` is the minimal surface the write buffer and query engine
//! need from a two-key (symbol + date) table store. Implementations wrap a
//! store SDK; they do not retry. Errors are classified here into retryable
//! capacity errors and fatal errors.

use datawell_core::{Item, ItemKey, StoredItem, DATE_FIELD, SYMBOL_FIELD};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Secondary index keyed `(date, symbol)` for date-only lookups.
pub const DATE_SYMBOL_INDEX: &str = "date-symbol-index";

/// Error codes the store uses for throttling and exceeded capacity.
const CAPACITY_ERROR_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
];

/// Classification of a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Throttling or capacity exceeded; the request may be retried.
    RetryableCapacity,
    /// Anything else (auth, malformed request, missing table).
    Fatal,
}

/// Error reported by a store gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub code: String,
    pub message: String,
}

impl StoreError {
    /// Build from a store error code, classifying it.
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let kind = if CAPACITY_ERROR_CODES.contains(&code.as_str()) {
            StoreErrorKind::RetryableCapacity
        } else {
            StoreErrorKind::Fatal
        };
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: StoreErrorKind::Fatal,
            code: code.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind == StoreErrorKind::RetryableCapacity
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One entry of a batch write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    /// Upsert a full item.
    Put(Item),
    /// Delete the item with this key.
    Delete(ItemKey),
}

impl WriteRequest {
    pub fn put(item: StoredItem) -> Self {
        WriteRequest::Put(item.into_item())
    }

    pub fn delete(key: ItemKey) -> Self {
        WriteRequest::Delete(key)
    }

    /// Key of the targeted item, if it has one.
    pub fn key(&self) -> Option<ItemKey> {
        match self {
            WriteRequest::Put(item) => ItemKey::from_item(item),
            WriteRequest::Delete(key) => Some(key.clone()),
        }
    }
}

/// Response of a batch write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWriteOutput {
    /// Requests the store did not commit.
    pub unprocessed: Vec<WriteRequest>,
}

/// Opaque continuation token (the last evaluated key of a page).
#[derive(Debug, Clone, PartialEq)]
pub struct PageCursor(Item);

impl PageCursor {
    pub fn new(last_key: Item) -> Self {
        Self(last_key)
    }

    pub fn as_item(&self) -> &Item {
        &self.0
    }

    pub fn into_item(self) -> Item {
        self.0
    }
}

/// One bounded page of a query or scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Item>,
    /// `None` on the final page.
    pub cursor: Option<PageCursor>,
}

/// Equality condition on a key attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEquals {
    pub attribute: String,
    pub value: String,
}

impl KeyEquals {
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    fn matches(&self, item: &Item) -> bool {
        item.get(&self.attribute).and_then(|v| v.as_str()) == Some(self.value.as_str())
    }
}

/// Key condition: partition equality, optionally AND sort equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCondition {
    pub partition: KeyEquals,
    pub sort: Option<KeyEquals>,
}

impl KeyCondition {
    pub fn partition(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            partition: KeyEquals::new(attribute, value),
            sort: None,
        }
    }

    #[must_use]
    pub fn and_sort(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.sort = Some(KeyEquals::new(attribute, value));
        self
    }

    /// Evaluate the condition against an item.
    pub fn matches(&self, item: &Item) -> bool {
        self.partition.matches(item) && self.sort.as_ref().map_or(true, |s| s.matches(item))
    }
}

/// Parameters of a key-conditioned query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub key_condition: KeyCondition,
    /// Attributes to return; `None` returns whole items.
    pub projection: Option<Vec<String>>,
    /// Secondary index to query instead of the table.
    pub index: Option<String>,
    pub cursor: Option<PageCursor>,
}

impl QueryRequest {
    pub fn new(key_condition: KeyCondition) -> Self {
        Self {
            key_condition,
            projection: None,
            index: None,
            cursor: None,
        }
    }

    #[must_use]
    pub fn with_projection(mut self, attributes: &[&str]) -> Self {
        self.projection = Some(attributes.iter().map(|a| a.to_string()).collect());
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }
}

/// Secondary index definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryIndex {
    pub name: String,
    pub partition_key: String,
    pub sort_key: String,
}

/// Table layout used when provisioning the snapshot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table_name: String,
    pub partition_key: String,
    pub sort_key: String,
    pub index: SecondaryIndex,
    pub read_capacity_units: i64,
    pub write_capacity_units: i64,
}

impl TableSchema {
    /// `(symbol, date)` table with the `(date, symbol)` secondary index.
    pub fn snapshots(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            partition_key: SYMBOL_FIELD.to_string(),
            sort_key: DATE_FIELD.to_string(),
            index: SecondaryIndex {
                name: DATE_SYMBOL_INDEX.to_string(),
                partition_key: DATE_FIELD.to_string(),
                sort_key: SYMBOL_FIELD.to_string(),
            },
            read_capacity_units: 5,
            write_capacity_units: 100,
        }
    }
}

/// Operations the persistence layer needs from a table store.
///
/// Implementations report partial batch failures through
/// `BatchWriteOutput::unprocessed` and never retry on their own.
pub trait StoreGateway: Send + Sync {
    /// Write a batch of puts/deletes, returning the requests not processed.
    fn batch_write<'a>(
        &'a self,
        table: &'a str,
        requests: &'a [WriteRequest],
    ) -> BoxFuture<'a, StoreResult<BatchWriteOutput>>;

    /// Run one page of a key-conditioned query.
    fn query<'a>(&'a self, table: &'a str, request: QueryRequest)
        -> BoxFuture<'a, StoreResult<Page>>;

    /// Run one page of a full table scan.
    fn scan<'a>(
        &'a self,
        table: &'a str,
        cursor: Option<PageCursor>,
    ) -> BoxFuture<'a, StoreResult<Page>>;

    fn delete_item<'a>(&'a self, table: &'a str, key: ItemKey) -> BoxFuture<'a, StoreResult<()>>;

    fn table_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, StoreResult<bool>>;

    fn create_table<'a>(&'a self, schema: &'a TableSchema) -> BoxFuture<'a, StoreResult<()>>;

    fn drop_table<'a>(&'a self, table: &'a str) -> BoxFuture<'a, StoreResult<()>>;

    /// Block until the table is usable.
    fn wait_until_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, StoreResult<()>>;

    /// Block until the table is gone.
    fn wait_until_not_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, StoreResult<()>>;
}

/// Arc wrapper for StoreGateway trait objects.
pub type DynStoreGateway = Arc<dyn StoreGateway>;
