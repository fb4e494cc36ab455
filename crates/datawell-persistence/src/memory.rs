//! In-process table store.
//!
//! `MemoryStore` follows the same contract as a remote two-key store:
//! bounded pages with continuation cursors, the `(date, symbol)` secondary
//! index, table lifecycle errors, the 25-request batch limit and the
//! rejection of batches that touch one key twice. Batch
//! outcomes can be scripted so tests can drive partial failures and
//! throttling. Every call is recorded.
//!
//! Tables can be saved to and loaded from a JSON snapshot file, which lets
//! the CLI run without a cloud store.

use crate::batch::MAX_BATCH_WRITE_ITEMS;
use crate::error::PersistenceResult;
use crate::gateway::{
    BatchWriteOutput, BoxFuture, Page, PageCursor, QueryRequest, StoreError, StoreGateway,
    StoreResult, TableSchema, WriteRequest,
};
use datawell_core::{Item, ItemKey, StoredItem};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::ready;
use std::path::Path;
use tracing::{debug, info};

/// Default number of items per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

const RESOURCE_NOT_FOUND: &str = "ResourceNotFoundException";
const RESOURCE_IN_USE: &str = "ResourceInUseException";
const VALIDATION: &str = "ValidationException";

/// Scripted outcome of one `batch_write` call.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchBehavior {
    /// Commit every request.
    Accept,
    /// Commit all but the last `n` requests and report those as unprocessed.
    LeaveUnprocessed(usize),
    /// Commit nothing and fail with this error.
    Fail(StoreError),
}

/// Calls received by a `MemoryStore`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallLog {
    pub batch_write: usize,
    pub batch_sizes: Vec<usize>,
    /// Requests of every batch write, in call order.
    pub batches: Vec<Vec<WriteRequest>>,
    pub query: usize,
    pub scan: usize,
    pub delete_item: usize,
    pub create_table: usize,
    pub drop_table: usize,
}

struct Table {
    schema: TableSchema,
    items: BTreeMap<ItemKey, Item>,
}

impl Table {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            items: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    scripted: VecDeque<BatchBehavior>,
    fallback: Option<BatchBehavior>,
    calls: CallLog,
}

impl State {
    fn table(&self, name: &str) -> StoreResult<&Table> {
        self.tables.get(name).ok_or_else(|| not_found(name))
    }

    fn table_mut(&mut self, name: &str) -> StoreResult<&mut Table> {
        self.tables.get_mut(name).ok_or_else(|| not_found(name))
    }

    fn next_behavior(&mut self) -> BatchBehavior {
        self.scripted
            .pop_front()
            .or_else(|| self.fallback.clone())
            .unwrap_or(BatchBehavior::Accept)
    }
}

/// On-disk layout of a snapshot file: table name to items.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotFile {
    tables: BTreeMap<String, Vec<Item>>,
}

/// In-process `StoreGateway`.
pub struct MemoryStore {
    page_size: usize,
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Store returning at most `page_size` items per query/scan page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            state: Mutex::new(State::default()),
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Queue the outcome of the next `batch_write` call.
    pub fn push_batch_behavior(&self, behavior: BatchBehavior) {
        self.state.lock().scripted.push_back(behavior);
    }

    /// Outcome used once the scripted queue is empty.
    pub fn set_fallback_behavior(&self, behavior: BatchBehavior) {
        self.state.lock().fallback = Some(behavior);
    }

    /// Snapshot of the calls received so far.
    pub fn calls(&self) -> CallLog {
        self.state.lock().calls.clone()
    }

    /// Create a table without going through the gateway. No-op if it exists.
    pub fn create_table_now(&self, schema: TableSchema) {
        let mut state = self.state.lock();
        state
            .tables
            .entry(schema.table_name.clone())
            .or_insert_with(|| Table::new(schema));
    }

    /// Insert items directly, creating the table when missing.
    pub fn seed<I>(&self, table: &str, items: I)
    where
        I: IntoIterator<Item = StoredItem>,
    {
        let mut state = self.state.lock();
        let table = state
            .tables
            .entry(table.to_string())
            .or_insert_with(|| Table::new(TableSchema::snapshots(table)));
        for item in items {
            table.items.insert(item.key(), item.into_item());
        }
    }

    /// Items in `table`, or 0 when it does not exist.
    pub fn item_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table)
            .map_or(0, |t| t.items.len())
    }

    /// All items of `table` in key order.
    pub fn items(&self, table: &str) -> Vec<Item> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.items.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Load tables from a JSON snapshot, replacing tables of the same name.
    ///
    /// Returns the number of items loaded.
    pub async fn load_snapshot(&self, path: &Path) -> PersistenceResult<usize> {
        let content = tokio::fs::read_to_string(path).await?;
        let snapshot: SnapshotFile = serde_json::from_str(&content)?;

        let mut loaded = 0;
        let mut state = self.state.lock();
        for (name, items) in snapshot.tables {
            let mut table = Table::new(TableSchema::snapshots(name.clone()));
            for item in items {
                if let Some(key) = ItemKey::from_item(&item) {
                    table.items.insert(key, item);
                    loaded += 1;
                }
            }
            state.tables.insert(name, table);
        }

        info!(path = %path.display(), items = loaded, "Loaded store snapshot");
        Ok(loaded)
    }

    /// Write every table to a JSON snapshot file.
    pub async fn save_snapshot(&self, path: &Path) -> PersistenceResult<()> {
        let snapshot = {
            let state = self.state.lock();
            SnapshotFile {
                tables: state
                    .tables
                    .iter()
                    .map(|(name, table)| (name.clone(), table.items.values().cloned().collect()))
                    .collect(),
            }
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_string_pretty(&snapshot)?).await?;

        debug!(path = %path.display(), tables = snapshot.tables.len(), "Saved store snapshot");
        Ok(())
    }

    fn apply_batch(&self, table: &str, requests: &[WriteRequest]) -> StoreResult<BatchWriteOutput> {
        let mut state = self.state.lock();
        state.calls.batch_write += 1;
        state.calls.batch_sizes.push(requests.len());
        state.calls.batches.push(requests.to_vec());

        if requests.is_empty() || requests.len() > MAX_BATCH_WRITE_ITEMS {
            return Err(StoreError::from_code(
                VALIDATION,
                format!(
                    "batch must contain between 1 and {MAX_BATCH_WRITE_ITEMS} requests, got {}",
                    requests.len()
                ),
            ));
        }
        let mut seen = HashSet::with_capacity(requests.len());
        if requests
            .iter()
            .filter_map(WriteRequest::key)
            .any(|key| !seen.insert(key))
        {
            return Err(StoreError::from_code(
                VALIDATION,
                "Provided list of item keys contains duplicates",
            ));
        }
        state.table(table)?;

        let committed = match state.next_behavior() {
            BatchBehavior::Accept => requests.len(),
            BatchBehavior::LeaveUnprocessed(n) => requests.len().saturating_sub(n),
            BatchBehavior::Fail(err) => return Err(err),
        };

        let items = &mut state.table_mut(table)?.items;
        for request in &requests[..committed] {
            match request {
                WriteRequest::Put(item) => {
                    let key = ItemKey::from_item(item).ok_or_else(|| {
                        StoreError::from_code(VALIDATION, "item is missing its key attributes")
                    })?;
                    items.insert(key, item.clone());
                }
                WriteRequest::Delete(key) => {
                    items.remove(key);
                }
            }
        }

        Ok(BatchWriteOutput {
            unprocessed: requests[committed..].to_vec(),
        })
    }

    fn run_query(&self, table: &str, request: QueryRequest) -> StoreResult<Page> {
        let mut state = self.state.lock();
        state.calls.query += 1;
        let table = state.table(table)?;

        let by_index = match request.index.as_deref() {
            None => false,
            Some(name) if name == table.schema.index.name => true,
            Some(name) => {
                return Err(StoreError::from_code(
                    VALIDATION,
                    format!("table has no index named {name}"),
                ))
            }
        };

        let mut matched: Vec<(ItemKey, &Item)> = table
            .items
            .iter()
            .filter(|(_, item)| request.key_condition.matches(item))
            .map(|(key, item)| (order_key(key, by_index), item))
            .collect();
        if by_index {
            matched.sort_by(|a, b| a.0.cmp(&b.0));
        }

        let resume_after = request
            .cursor
            .as_ref()
            .and_then(|c| ItemKey::from_item(c.as_item()))
            .map(|key| order_key(&key, by_index));

        Ok(paginate(
            matched,
            resume_after,
            self.page_size,
            request.projection.as_deref(),
            by_index,
        ))
    }

    fn run_scan(&self, table: &str, cursor: Option<PageCursor>) -> StoreResult<Page> {
        let mut state = self.state.lock();
        state.calls.scan += 1;
        let table = state.table(table)?;

        let all: Vec<(ItemKey, &Item)> = table
            .items
            .iter()
            .map(|(key, item)| (key.clone(), item))
            .collect();
        let resume_after = cursor.as_ref().and_then(|c| ItemKey::from_item(c.as_item()));

        Ok(paginate(all, resume_after, self.page_size, None, false))
    }
}

impl StoreGateway for MemoryStore {
    fn batch_write<'a>(
        &'a self,
        table: &'a str,
        requests: &'a [WriteRequest],
    ) -> BoxFuture<'a, StoreResult<BatchWriteOutput>> {
        Box::pin(ready(self.apply_batch(table, requests)))
    }

    fn query<'a>(&'a self, table: &'a str, request: QueryRequest) -> BoxFuture<'a, StoreResult<Page>> {
        Box::pin(ready(self.run_query(table, request)))
    }

    fn scan<'a>(
        &'a self,
        table: &'a str,
        cursor: Option<PageCursor>,
    ) -> BoxFuture<'a, StoreResult<Page>> {
        Box::pin(ready(self.run_scan(table, cursor)))
    }

    fn delete_item<'a>(&'a self, table: &'a str, key: ItemKey) -> BoxFuture<'a, StoreResult<()>> {
        let result = {
            let mut state = self.state.lock();
            state.calls.delete_item += 1;
            state.table_mut(table).map(|t| {
                t.items.remove(&key);
            })
        };
        Box::pin(ready(result))
    }

    fn table_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        let exists = self.state.lock().tables.contains_key(table);
        Box::pin(ready(Ok(exists)))
    }

    fn create_table<'a>(&'a self, schema: &'a TableSchema) -> BoxFuture<'a, StoreResult<()>> {
        let result = {
            let mut state = self.state.lock();
            state.calls.create_table += 1;
            if state.tables.contains_key(&schema.table_name) {
                Err(StoreError::from_code(
                    RESOURCE_IN_USE,
                    format!("Table already exists: {}", schema.table_name),
                ))
            } else {
                state
                    .tables
                    .insert(schema.table_name.clone(), Table::new(schema.clone()));
                Ok(())
            }
        };
        Box::pin(ready(result))
    }

    fn drop_table<'a>(&'a self, table: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        let result = {
            let mut state = self.state.lock();
            state.calls.drop_table += 1;
            state
                .tables
                .remove(table)
                .map(|_| ())
                .ok_or_else(|| not_found(table))
        };
        Box::pin(ready(result))
    }

    fn wait_until_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        let result = if self.state.lock().tables.contains_key(table) {
            Ok(())
        } else {
            Err(not_found(table))
        };
        Box::pin(ready(result))
    }

    fn wait_until_not_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        let result = if self.state.lock().tables.contains_key(table) {
            Err(StoreError::from_code(
                RESOURCE_IN_USE,
                format!("Table still exists: {table}"),
            ))
        } else {
            Ok(())
        };
        Box::pin(ready(result))
    }
}

fn not_found(table: &str) -> StoreError {
    StoreError::from_code(
        RESOURCE_NOT_FOUND,
        format!("Requested resource not found: Table: {table} not found"),
    )
}

/// Position of an item in table order `(symbol, date)` or index order `(date, symbol)`.
fn order_key(key: &ItemKey, by_index: bool) -> ItemKey {
    if by_index {
        ItemKey::new(key.date.clone(), key.symbol.clone())
    } else {
        key.clone()
    }
}

/// Cut one page out of `ordered`, resuming strictly after `resume_after`.
///
/// Resuming by position rather than by exact key lets a cursor survive
/// deletes made between pages.
fn paginate(
    ordered: Vec<(ItemKey, &Item)>,
    resume_after: Option<ItemKey>,
    page_size: usize,
    projection: Option<&[String]>,
    by_index: bool,
) -> Page {
    let mut remaining = ordered
        .into_iter()
        .filter(|(key, _)| resume_after.as_ref().map_or(true, |after| key > after))
        .peekable();

    let mut items = Vec::new();
    let mut last_key = None;
    while items.len() < page_size {
        let Some((key, item)) = remaining.next() else {
            break;
        };
        items.push(project(item, projection));
        last_key = Some(key);
    }

    let cursor = match (remaining.peek(), last_key) {
        (Some(_), Some(last)) => {
            let table_key = order_key(&last, by_index);
            Some(PageCursor::new(table_key.to_item()))
        }
        _ => None,
    };

    Page { items, cursor }
}

fn project(item: &Item, projection: Option<&[String]>) -> Item {
    match projection {
        None => item.clone(),
        Some(attributes) => item
            .iter()
            .filter(|(name, _)| attributes.iter().any(|a| a == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{KeyCondition, DATE_SYMBOL_INDEX};
    use serde_json::json;

    const TABLE: &str = "snapshots";

    fn make_item(symbol: &str, date: &str) -> StoredItem {
        let document = match json!({"symbol": symbol, "date": date, "close": 1.0}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        StoredItem::from_document(document).unwrap()
    }

    fn seeded(page_size: usize) -> MemoryStore {
        let store = MemoryStore::with_page_size(page_size);
        store.seed(
            TABLE,
            vec![
                make_item("AAE", "2020-01-01"),
                make_item("AAE", "2020-01-02"),
                make_item("AAE", "2020-01-03"),
                make_item("TRC", "2020-01-01"),
                make_item("TRC", "2020-01-02"),
            ],
        );
        store
    }

    #[tokio::test]
    async fn test_query_pages_follow_cursor() {
        let store = seeded(2);
        let condition = KeyCondition::partition("symbol", "AAE");

        let first = store.query(TABLE, QueryRequest::new(condition.clone())).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.cursor.expect("more pages");

        let mut request = QueryRequest::new(condition);
        request.cursor = Some(cursor);
        let second = store.query(TABLE, request).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0]["date"], json!("2020-01-03"));
        assert!(second.cursor.is_none());
    }

    #[tokio::test]
    async fn test_exact_page_has_no_trailing_cursor() {
        let store = seeded(3);
        let page = store
            .query(TABLE, QueryRequest::new(KeyCondition::partition("symbol", "AAE")))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(page.cursor.is_none());
    }

    #[tokio::test]
    async fn test_index_query_by_date() {
        let store = seeded(10);
        let request = QueryRequest::new(KeyCondition::partition("date", "2020-01-01"))
            .with_index(DATE_SYMBOL_INDEX);
        let page = store.query(TABLE, request).await.unwrap();

        let symbols: Vec<_> = page.items.iter().map(|i| i["symbol"].clone()).collect();
        assert_eq!(symbols, vec![json!("AAE"), json!("TRC")]);

        let bad = QueryRequest::new(KeyCondition::partition("date", "2020-01-01")).with_index("nope");
        let err = store.query(TABLE, bad).await.unwrap_err();
        assert_eq!(err.code, VALIDATION);
    }

    #[tokio::test]
    async fn test_projection() {
        let store = seeded(10);
        let request = QueryRequest::new(KeyCondition::partition("symbol", "TRC"))
            .with_projection(&["symbol", "date"]);
        let page = store.query(TABLE, request).await.unwrap();

        assert_eq!(page.items.len(), 2);
        assert!(page.items.iter().all(|i| i.len() == 2 && !i.contains_key("document")));
    }

    #[tokio::test]
    async fn test_scan_pages() {
        let store = seeded(2);
        let mut cursor = None;
        let mut seen = 0;
        let mut pages = 0;
        loop {
            let page = store.scan(TABLE, cursor).await.unwrap();
            seen += page.items.len();
            pages += 1;
            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }
        assert_eq!(seen, 5);
        assert_eq!(pages, 3);
        assert_eq!(store.calls().scan, 3);
    }

    #[tokio::test]
    async fn test_missing_table_errors() {
        let store = MemoryStore::new();
        let err = store.scan("absent", None).await.unwrap_err();
        assert_eq!(err.code, RESOURCE_NOT_FOUND);
        assert!(!err.is_retryable());
        assert!(!store.table_exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_table_lifecycle() {
        let store = MemoryStore::new();
        let schema = TableSchema::snapshots(TABLE);

        store.create_table(&schema).await.unwrap();
        store.wait_until_exists(TABLE).await.unwrap();
        let err = store.create_table(&schema).await.unwrap_err();
        assert_eq!(err.code, RESOURCE_IN_USE);

        store.drop_table(TABLE).await.unwrap();
        store.wait_until_not_exists(TABLE).await.unwrap();
        assert!(!store.table_exists(TABLE).await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_limit_is_enforced() {
        let store = MemoryStore::new();
        store.create_table_now(TableSchema::snapshots(TABLE));
        let requests: Vec<_> = (0..26)
            .map(|d| WriteRequest::put(make_item("AAE", &format!("2020-02-{:02}", d + 1))))
            .collect();

        let err = store.batch_write(TABLE, &requests).await.unwrap_err();
        assert_eq!(err.code, VALIDATION);
        assert_eq!(store.item_count(TABLE), 0);
    }

    #[tokio::test]
    async fn test_scripted_behaviors_then_fallback() {
        let store = MemoryStore::new();
        store.create_table_now(TableSchema::snapshots(TABLE));
        store.push_batch_behavior(BatchBehavior::LeaveUnprocessed(1));
        store.set_fallback_behavior(BatchBehavior::Fail(StoreError::from_code("500", "down")));

        let requests = vec![
            WriteRequest::put(make_item("AAE", "2020-01-01")),
            WriteRequest::put(make_item("AAE", "2020-01-02")),
        ];
        let output = store.batch_write(TABLE, &requests).await.unwrap();
        assert_eq!(output.unprocessed, requests[1..].to_vec());
        assert_eq!(store.item_count(TABLE), 1);

        assert!(store.batch_write(TABLE, &requests[1..]).await.is_err());
        assert_eq!(store.calls().batch_sizes, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_duplicate_keys_in_one_batch_are_rejected() {
        let store = MemoryStore::new();
        store.create_table_now(TableSchema::snapshots(TABLE));
        let requests = vec![
            WriteRequest::put(make_item("AAE", "2020-01-01")),
            WriteRequest::delete(ItemKey::new("AAE", "2020-01-01")),
        ];

        let err = store.batch_write(TABLE, &requests).await.unwrap_err();
        assert_eq!(err.code, VALIDATION);
        assert!(!err.is_retryable());
        assert_eq!(store.item_count(TABLE), 0);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let store = seeded(10);
        store.save_snapshot(&path).await.unwrap();

        let restored = MemoryStore::new();
        assert_eq!(restored.load_snapshot(&path).await.unwrap(), 5);
        assert_eq!(restored.items(TABLE), store.items(TABLE));
    }
}
