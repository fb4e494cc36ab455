//! Document store facade: store, find, purge.

use crate::batch::{BatchWriteBuffer, FlushSummary, WriterSettings};
use crate::error::{PersistenceError, PersistenceResult};
use crate::gateway::{DynStoreGateway, TableSchema};
use crate::query::{FilterCriteria, PaginatedQueryEngine};
use chrono::NaiveDate;
use datawell_core::{
    sanitize_documents, validate_strict, ActionStatus, Document, ItemKey, StoredItem, DATE_FIELD,
};
use datawell_telemetry::Metrics;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Store error code for a table that is already being created.
const RESOURCE_IN_USE: &str = "ResourceInUseException";

/// Sanitizing, batching and paginating access to the snapshot table.
pub struct DocumentStore {
    gateway: DynStoreGateway,
    schema: TableSchema,
    settings: WriterSettings,
    engine: PaginatedQueryEngine,
}

impl DocumentStore {
    pub fn new(gateway: DynStoreGateway, table_name: impl Into<String>, settings: WriterSettings) -> Self {
        let schema = TableSchema::snapshots(table_name);
        let engine = PaginatedQueryEngine::new(gateway.clone(), schema.table_name.clone());
        Self {
            gateway,
            schema,
            settings,
            engine,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.schema.table_name
    }

    pub fn settings(&self) -> WriterSettings {
        self.settings
    }

    /// Administrative table operations (create/recreate).
    pub fn admin(&self) -> TableAdmin {
        TableAdmin {
            gateway: self.gateway.clone(),
            schema: self.schema.clone(),
        }
    }

    /// Sanitize and persist documents.
    ///
    /// Documents that are not mappings or lack `symbol`/`date` are dropped
    /// with a warning. Returns `Success` once every surviving document is
    /// acknowledged (or none survived) and `Error` when the retry budget ran
    /// out. A fatal store error is returned as `Err`.
    pub async fn store(&self, documents: Vec<Value>) -> PersistenceResult<ActionStatus> {
        let started = Instant::now();
        let received = documents.len();
        let report = sanitize_documents(documents);

        if report.dropped > 0 {
            warn!(
                table = %self.schema.table_name,
                dropped = report.dropped,
                "Dropped documents without symbol or date"
            );
            Metrics::documents_dropped(report.dropped);
        }

        if report.accepted.is_empty() {
            info!(table = %self.schema.table_name, received, "Nothing to store");
            log_elapsed("store", started);
            return Ok(ActionStatus::Success);
        }

        let accepted = report.accepted.len();
        let result = self.write_documents(report.accepted).await;
        log_elapsed("store", started);

        match result {
            Ok(summary) => {
                info!(
                    table = %self.schema.table_name,
                    received,
                    stored = summary.acknowledged,
                    store_calls = summary.store_calls,
                    retries = summary.retries,
                    "Stored documents"
                );
                Ok(ActionStatus::Success)
            }
            Err(PersistenceError::ExhaustedRetries { attempts, unflushed }) => {
                error!(
                    table = %self.schema.table_name,
                    accepted,
                    attempts,
                    unflushed,
                    "Data was not persisted, retry budget exhausted"
                );
                Ok(ActionStatus::Error)
            }
            Err(err) => Err(err),
        }
    }

    /// Items matching the optional symbol and date filters.
    pub async fn find(
        &self,
        symbol: Option<&str>,
        date: Option<NaiveDate>,
    ) -> PersistenceResult<Vec<StoredItem>> {
        self.find_by(&FilterCriteria::new(symbol, date)).await
    }

    pub async fn find_by(&self, criteria: &FilterCriteria) -> PersistenceResult<Vec<StoredItem>> {
        let started = Instant::now();
        let items = self.engine.query(criteria).await;
        log_elapsed("find", started);

        items?
            .into_iter()
            .map(|item| StoredItem::from_item(item).map_err(PersistenceError::from))
            .collect()
    }

    /// Delete every item of the given symbols and return the count.
    ///
    /// An empty list clears the entire table by recreating it and returns `-1`.
    pub async fn purge(&self, symbols: &[String]) -> PersistenceResult<i64> {
        let started = Instant::now();

        let result = if symbols.is_empty() {
            warn!(table = %self.schema.table_name, "Purging entire table");
            self.admin().recreate_table().await.map(|()| -1)
        } else {
            self.engine
                .delete_by_symbols(symbols, self.settings)
                .await
                .map(|count| i64::try_from(count).unwrap_or(i64::MAX))
        };

        log_elapsed("purge", started);
        result
    }

    /// Delete a single item by key.
    pub async fn delete(&self, key: ItemKey) -> PersistenceResult<()> {
        Metrics::store_call("delete_item");
        self.gateway.delete_item(&self.schema.table_name, key.clone()).await?;
        info!(table = %self.schema.table_name, %key, "Deleted item");
        Ok(())
    }

    async fn write_documents(&self, documents: Vec<Document>) -> PersistenceResult<FlushSummary> {
        self.admin().ensure_table().await?;

        let mut writer =
            BatchWriteBuffer::new(self.gateway.clone(), self.schema.table_name.clone(), self.settings);
        for document in documents {
            if !validate_strict(&document) {
                warn!(
                    table = %self.schema.table_name,
                    date = ?document.get(DATE_FIELD),
                    "Document date is not YYYY-MM-DD"
                );
            }
            let Some(item) = StoredItem::from_document(document) else {
                continue;
            };
            writer.put_item(item).await?;
        }
        writer.close().await
    }
}

/// Table provisioning. Recreating a table destroys its contents.
pub struct TableAdmin {
    gateway: DynStoreGateway,
    schema: TableSchema,
}

impl TableAdmin {
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Create the table unless it already exists.
    pub async fn ensure_table(&self) -> PersistenceResult<()> {
        if self.gateway.table_exists(&self.schema.table_name).await? {
            debug!(table = %self.schema.table_name, "Table exists");
            return Ok(());
        }
        self.create_table().await
    }

    /// Create the table and wait until it is usable.
    pub async fn create_table(&self) -> PersistenceResult<()> {
        let table = &self.schema.table_name;
        info!(%table, "Creating table");
        Metrics::store_call("create_table");

        match self.gateway.create_table(&self.schema).await {
            Ok(()) => {}
            // Created concurrently by another writer.
            Err(err) if err.code == RESOURCE_IN_USE => {
                debug!(%table, %err, "Table creation already in progress");
            }
            Err(err) => return Err(err.into()),
        }

        self.gateway.wait_until_exists(table).await?;
        info!(%table, "Table ready");
        Ok(())
    }

    /// Drop the table if present, then create it empty.
    pub async fn recreate_table(&self) -> PersistenceResult<()> {
        let table = &self.schema.table_name;
        if self.gateway.table_exists(table).await? {
            info!(%table, "Dropping table");
            Metrics::store_call("drop_table");
            self.gateway.drop_table(table).await?;
            self.gateway.wait_until_not_exists(table).await?;
        }
        self.create_table().await
    }
}

fn log_elapsed(category: &str, started: Instant) {
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    info!(category, elapsed_ms, "Execution time");
    Metrics::operation_duration(category, elapsed_ms);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::StoreError;
    use crate::memory::{BatchBehavior, MemoryStore};
    use datawell_core::RetryConfig;
    use serde_json::json;
    use std::sync::Arc;

    const TABLE: &str = "snapshots";

    fn make_store(max_attempts: i64) -> (Arc<MemoryStore>, DocumentStore) {
        let memory = Arc::new(MemoryStore::new());
        let settings = WriterSettings {
            flush_size: 25,
            retry: RetryConfig::new(max_attempts, 1, 60),
        };
        let store = DocumentStore::new(memory.clone(), TABLE, settings);
        (memory, store)
    }

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
    }

    fn quotes(symbol: &str, days: u32) -> Vec<Value> {
        (1..=days)
            .map(|d| json!({"symbol": symbol, "date": format!("2020-01-{d:02}"), "close": d}))
            .collect()
    }

    #[tokio::test]
    async fn test_store_then_find_end_to_end() {
        let (memory, store) = make_store(10);
        let documents = vec![
            json!({"symbol": "AAE", "date": "2017-10-12", "document1": {"docField": "fieldsValue", "empty": ""}}),
            json!({"NotASymbol": "AAE", "date": "2017-10-12"}),
            json!({"symbol": "AAE", "NotADate": "2017-10-12"}),
            json!("not a document"),
        ];

        let status = store.store(documents).await.unwrap();

        assert_eq!(status, ActionStatus::Success);
        assert_eq!(memory.calls().batch_sizes, vec![1]);
        assert_eq!(memory.calls().create_table, 1);

        let expected =
            json!({"symbol": "AAE", "date": "2017-10-12", "document1": {"docField": "fieldsValue"}});

        let by_symbol = store.find(Some("AAE"), None).await.unwrap();
        assert_eq!(by_symbol.len(), 1);
        assert_eq!(by_symbol[0].key(), ItemKey::new("AAE", "2017-10-12"));
        assert_eq!(Value::Object(by_symbol[0].document.clone()), expected);

        let found = store.find(Some("AAE"), Some(date("2017-10-12"))).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(Value::Object(found[0].document.clone()), expected);
    }

    #[tokio::test]
    async fn test_store_same_key_twice_keeps_last() {
        let (memory, store) = make_store(10);
        let documents = vec![
            json!({"symbol": "AAE", "date": "2020-01-01", "v": 1}),
            json!({"symbol": "AAE", "date": "2020-01-01", "v": 2}),
        ];

        let status = store.store(documents).await.unwrap();

        assert_eq!(status, ActionStatus::Success);
        assert_eq!(memory.calls().batch_sizes, vec![1]);
        let found = store.find(Some("AAE"), None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].document["v"], json!(2));
    }

    #[tokio::test]
    async fn test_store_nothing_valid_is_success_without_calls() {
        let (memory, store) = make_store(10);

        let status = store.store(vec![json!({"date": "2020-01-01"})]).await.unwrap();

        assert_eq!(status, ActionStatus::Success);
        assert_eq!(memory.calls().batch_write, 0);
        assert_eq!(memory.calls().create_table, 0);
    }

    #[tokio::test]
    async fn test_store_reuses_existing_table() {
        let (memory, store) = make_store(10);
        store.admin().ensure_table().await.unwrap();

        store.store(quotes("AAE", 30)).await.unwrap();

        assert_eq!(memory.calls().create_table, 1);
        assert_eq!(memory.calls().batch_sizes, vec![25, 5]);
        assert_eq!(memory.item_count(TABLE), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_reports_error_when_budget_exhausted() {
        let (memory, store) = make_store(2);
        memory.set_fallback_behavior(BatchBehavior::LeaveUnprocessed(1));

        let status = store.store(quotes("AAE", 1)).await.unwrap();

        assert_eq!(status, ActionStatus::Error);
        assert_eq!(memory.calls().batch_write, 3);
    }

    #[tokio::test]
    async fn test_store_propagates_fatal_error() {
        let (memory, store) = make_store(10);
        memory.push_batch_behavior(BatchBehavior::Fail(StoreError::from_code("500", "Error insert")));

        let err = store.store(quotes("AAE", 1)).await.unwrap_err();

        assert!(matches!(err, PersistenceError::Store(_)));
        assert_eq!(memory.calls().batch_write, 1);
    }

    #[tokio::test]
    async fn test_find_by_date_and_all() {
        let (_memory, store) = make_store(10);
        store.store(quotes("AAE", 3)).await.unwrap();
        store.store(quotes("TRC", 2)).await.unwrap();

        let on_day_two = store.find(None, Some(date("2020-01-02"))).await.unwrap();
        assert_eq!(on_day_two.len(), 2);

        let everything = store.find(None, None).await.unwrap();
        assert_eq!(everything.len(), 5);
    }

    #[tokio::test]
    async fn test_purge_all_returns_sentinel_and_empties_table() {
        let (memory, store) = make_store(10);
        store.store(quotes("AAE", 3)).await.unwrap();

        let result = store.purge(&[]).await.unwrap();

        assert_eq!(result, -1);
        assert_eq!(memory.calls().drop_table, 1);
        assert!(memory.calls().create_table >= 2);
        assert_eq!(memory.item_count(TABLE), 0);
        assert!(store.find(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_symbols_returns_count() {
        let (memory, store) = make_store(10);
        store.store(quotes("AAE", 4)).await.unwrap();
        store.store(quotes("TRC", 2)).await.unwrap();

        let deleted = store.purge(&["AAE".to_string()]).await.unwrap();

        assert_eq!(deleted, 4);
        assert_eq!(memory.item_count(TABLE), 2);
        assert_eq!(memory.calls().drop_table, 0);
    }

    #[tokio::test]
    async fn test_purge_repeated_symbol_counts_once() {
        let (memory, store) = make_store(10);
        store.store(quotes("AAE", 3)).await.unwrap();

        let deleted = store
            .purge(&["AAE".to_string(), "AAE".to_string()])
            .await
            .unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(memory.item_count(TABLE), 0);
        assert_eq!(memory.calls().batch_sizes, vec![3, 3]);
    }

    #[tokio::test]
    async fn test_delete_single_item() {
        let (memory, store) = make_store(10);
        store.store(quotes("AAE", 2)).await.unwrap();

        store.delete(ItemKey::new("AAE", "2020-01-01")).await.unwrap();

        let left = store.find(Some("AAE"), None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].date, "2020-01-02");
        assert_eq!(memory.calls().delete_item, 1);
    }

    #[tokio::test]
    async fn test_recreate_missing_table_only_creates() {
        let (memory, store) = make_store(10);

        store.admin().recreate_table().await.unwrap();

        assert_eq!(memory.calls().drop_table, 0);
        assert_eq!(memory.calls().create_table, 1);
        assert_eq!(store.admin().schema().table_name, TABLE);
    }
}
