//! Batching write buffer with unprocessed-item retry.
//!
//! Callers `put` requests one at a time; the buffer sends them in groups of
//! at most `flush_size` (the store's batch limit). When the store leaves part
//! of a batch unprocessed, or rejects the whole batch for lack of capacity,
//! the affected requests go back to the front of the buffer and the next
//! flush waits for an exponentially growing delay first. Once the retry
//! budget is spent the session fails with `ExhaustedRetries`.
//!
//! A request whose key is already pending replaces the earlier one in place,
//! since the store rejects batches that touch the same item twice.
//!
//! A session ends with `close()`, which flushes everything still pending.
//! `close()` returns `Ok` only when every request was acknowledged.

use crate::error::{PersistenceError, PersistenceResult};
use crate::gateway::{DynStoreGateway, WriteRequest};
use datawell_core::{ItemKey, RetryConfig, StoredItem};
use datawell_telemetry::Metrics;
use std::collections::VecDeque;
use tracing::{debug, error, warn};

/// Maximum number of requests the store accepts in one batch write.
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

/// Buffer sizing and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSettings {
    /// Requests per batch; clamped to `1..=MAX_BATCH_WRITE_ITEMS`.
    pub flush_size: usize,
    pub retry: RetryConfig,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            flush_size: MAX_BATCH_WRITE_ITEMS,
            retry: RetryConfig::new(10, 1, 60),
        }
    }
}

/// Counters for one write session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Requests the store acknowledged.
    pub acknowledged: usize,
    /// Batch write calls issued.
    pub store_calls: usize,
    /// Retries scheduled (partial failures plus capacity errors).
    pub retries: usize,
}

/// Write buffer for one persistence session.
///
/// Not safe for concurrent use; give each task its own buffer.
pub struct BatchWriteBuffer {
    gateway: DynStoreGateway,
    table: String,
    buffer: VecDeque<WriteRequest>,
    flush_size: usize,
    retry: RetryConfig,
    /// Consecutive failed flushes; reset by a fully processed batch.
    retry_attempt: u32,
    summary: FlushSummary,
}

impl BatchWriteBuffer {
    pub fn new(gateway: DynStoreGateway, table: impl Into<String>, settings: WriterSettings) -> Self {
        let flush_size = settings.flush_size.clamp(1, MAX_BATCH_WRITE_ITEMS);
        Self {
            gateway,
            table: table.into(),
            buffer: VecDeque::with_capacity(flush_size),
            flush_size,
            retry: settings.retry,
            retry_attempt: 0,
            summary: FlushSummary::default(),
        }
    }

    /// Requests not yet acknowledged.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    #[must_use]
    pub fn summary(&self) -> FlushSummary {
        self.summary
    }

    /// Queue a request, flushing once the buffer reaches `flush_size`.
    ///
    /// A pending request for the same key is overwritten; the last one wins.
    pub async fn put(&mut self, request: WriteRequest) -> PersistenceResult<()> {
        if let Some(position) = self.pending_position(&request) {
            debug!(table = %self.table, key = ?request.key(), "Overwriting pending request");
            self.buffer[position] = request;
            return Ok(());
        }
        self.buffer.push_back(request);

        if self.buffer.len() >= self.flush_size {
            self.flush().await?;
        }

        Ok(())
    }

    /// Queue an upsert of a stored item.
    pub async fn put_item(&mut self, item: StoredItem) -> PersistenceResult<()> {
        self.put(WriteRequest::put(item)).await
    }

    /// Queue a delete by key.
    pub async fn delete_item(&mut self, key: ItemKey) -> PersistenceResult<()> {
        self.put(WriteRequest::delete(key)).await
    }

    /// Send one batch from the front of the buffer.
    ///
    /// Retryable outcomes re-queue the affected requests and return `Ok`;
    /// the caller keeps flushing until the buffer is empty.
    pub async fn flush(&mut self) -> PersistenceResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        self.backoff_if_needed().await;

        let take = self.flush_size.min(self.buffer.len());
        let batch: Vec<WriteRequest> = self.buffer.drain(..take).collect();

        debug!(table = %self.table, items = batch.len(), "Sending batch");
        self.summary.store_calls += 1;
        Metrics::store_call("batch_write");

        match self.gateway.batch_write(&self.table, &batch).await {
            Ok(output) if output.unprocessed.is_empty() => {
                self.summary.acknowledged += batch.len();
                Metrics::requests_acknowledged(batch.len());
                self.retry_attempt = 0;
                Ok(())
            }
            Ok(output) => {
                let acknowledged = batch.len().saturating_sub(output.unprocessed.len());
                self.summary.acknowledged += acknowledged;
                Metrics::requests_acknowledged(acknowledged);
                debug!(
                    table = %self.table,
                    unprocessed = output.unprocessed.len(),
                    "Store left items unprocessed"
                );
                Metrics::batch_retry("unprocessed");
                self.prepare_retry(output.unprocessed)
            }
            Err(err) if err.is_retryable() => {
                warn!(table = %self.table, code = %err.code, "Store throttled batch write");
                Metrics::batch_retry("capacity");
                self.prepare_retry(batch)
            }
            Err(err) => {
                error!(table = %self.table, %err, "Batch write failed");
                // The batch is neither acknowledged nor retried; keep it visible as pending.
                self.requeue_front(batch);
                Err(err.into())
            }
        }
    }

    /// Flush everything that is pending and end the session.
    pub async fn close(mut self) -> PersistenceResult<FlushSummary> {
        while !self.buffer.is_empty() {
            self.flush().await?;
        }
        Ok(self.summary)
    }

    async fn backoff_if_needed(&self) {
        if self.retry_attempt == 0 {
            return;
        }
        let delay = self.retry.delay_for(self.retry_attempt);
        if delay.is_zero() {
            return;
        }
        debug!(
            retry_attempt = self.retry_attempt,
            ?delay,
            "Backing off before retry"
        );
        tokio::time::sleep(delay).await;
    }

    fn prepare_retry(&mut self, unprocessed: Vec<WriteRequest>) -> PersistenceResult<()> {
        self.retry_attempt += 1;
        self.summary.retries += 1;
        self.requeue_front(unprocessed);

        if self.retry.is_exhausted(self.retry_attempt) {
            error!(
                table = %self.table,
                retry_attempt = self.retry_attempt,
                max_attempts = ?self.retry.max_attempts(),
                unflushed = self.buffer.len(),
                "Max retries exceeded"
            );
            Metrics::retries_exhausted();
            return Err(PersistenceError::ExhaustedRetries {
                attempts: self.retry_attempt,
                unflushed: self.buffer.len(),
            });
        }

        Ok(())
    }

    fn pending_position(&self, request: &WriteRequest) -> Option<usize> {
        let key = request.key()?;
        self.buffer
            .iter()
            .position(|pending| pending.key().as_ref() == Some(&key))
    }

    fn requeue_front(&mut self, requests: Vec<WriteRequest>) {
        for request in requests.into_iter().rev() {
            self.buffer.push_front(request);
        }
    }
}

impl Drop for BatchWriteBuffer {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            warn!(
                table = %self.table,
                pending = self.buffer.len(),
                "Write buffer dropped with requests that were never persisted"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{StoreError, TableSchema};
    use crate::memory::{BatchBehavior, MemoryStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    const TABLE: &str = "snapshots";

    fn make_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.create_table_now(TableSchema::snapshots(TABLE));
        store
    }

    fn make_item(symbol: &str, day: u32) -> StoredItem {
        StoredItem {
            symbol: symbol.to_string(),
            date: format!("2020-01-{day:02}"),
            document: serde_json::Map::new(),
        }
    }

    fn settings(flush_size: usize, max_attempts: i64) -> WriterSettings {
        WriterSettings {
            flush_size,
            retry: RetryConfig::new(max_attempts, 1, 60),
        }
    }

    #[tokio::test]
    async fn test_flushes_at_threshold() {
        let store = make_store();
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(3, 1));

        for day in 1..=7 {
            writer.put_item(make_item("AAE", day)).await.unwrap();
        }
        assert_eq!(store.calls().batch_sizes, vec![3, 3]);
        assert_eq!(writer.pending(), 1);

        let summary = writer.close().await.unwrap();
        assert_eq!(store.calls().batch_sizes, vec![3, 3, 1]);
        assert_eq!(summary.acknowledged, 7);
        assert_eq!(summary.store_calls, 3);
        assert_eq!(store.item_count(TABLE), 7);
    }

    #[tokio::test]
    async fn test_close_sends_remainder_in_one_call() {
        let store = make_store();
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(25, 1));

        for day in 1..=4 {
            writer.put_item(make_item("AAE", day)).await.unwrap();
        }
        assert!(store.calls().batch_sizes.is_empty());

        writer.close().await.unwrap();
        assert_eq!(store.calls().batch_sizes, vec![4]);
    }

    #[tokio::test]
    async fn test_flush_size_is_clamped_to_store_limit() {
        let store = make_store();
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(100, 1));

        for day in 1..=28 {
            writer.put_item(make_item("AAE", day)).await.unwrap();
        }
        writer.close().await.unwrap();
        assert_eq!(store.calls().batch_sizes, vec![25, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_unprocessed_items_are_resent() {
        let store = make_store();
        store.push_batch_behavior(BatchBehavior::LeaveUnprocessed(2));
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(25, 3));

        for day in 1..=5 {
            writer.put_item(make_item("AAE", day)).await.unwrap();
        }
        let summary = writer.close().await.unwrap();

        assert_eq!(store.calls().batch_sizes, vec![5, 2]);
        assert_eq!(summary.acknowledged, 5);
        assert_eq!(summary.retries, 1);
        assert_eq!(store.item_count(TABLE), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprocessed_items_go_before_new_ones() {
        let store = make_store();
        store.push_batch_behavior(BatchBehavior::LeaveUnprocessed(1));
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(2, 3));

        writer.put_item(make_item("AAE", 1)).await.unwrap();
        writer.put_item(make_item("AAE", 2)).await.unwrap();
        // Day 2 was left unprocessed and sits at the front.
        assert_eq!(writer.pending(), 1);
        assert_eq!(writer.retry_attempt(), 1);

        writer.put_item(make_item("AAE", 3)).await.unwrap();
        let sent = store.calls().batches;
        let second: Vec<_> = sent[1].iter().filter_map(WriteRequest::key).collect();
        assert_eq!(
            second,
            vec![ItemKey::new("AAE", "2020-01-02"), ItemKey::new("AAE", "2020-01-03")]
        );
        assert_eq!(writer.retry_attempt(), 0);
        writer.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failures_then_success() {
        let store = make_store();
        for _ in 0..3 {
            store.push_batch_behavior(BatchBehavior::LeaveUnprocessed(1));
        }
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(25, 5));
        writer.put_item(make_item("AAE", 1)).await.unwrap();

        let started = Instant::now();
        let summary = writer.close().await.unwrap();

        assert_eq!(store.calls().batch_write, 4);
        assert_eq!(summary.retries, 3);
        // Delays before retries 1, 2, 3: 1s, 2s, 4s.
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_max_attempts_plus_one_calls() {
        let store = make_store();
        store.set_fallback_behavior(BatchBehavior::LeaveUnprocessed(usize::MAX));
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(25, 3));
        writer.put_item(make_item("AAE", 1)).await.unwrap();
        writer.put_item(make_item("AAE", 2)).await.unwrap();

        let err = writer.close().await.unwrap_err();

        assert!(matches!(
            err,
            PersistenceError::ExhaustedRetries {
                attempts: 4,
                unflushed: 2
            }
        ));
        assert_eq!(store.calls().batch_write, 4);
    }

    #[tokio::test]
    async fn test_zero_max_attempts_disables_retry() {
        let store = make_store();
        store.push_batch_behavior(BatchBehavior::LeaveUnprocessed(1));
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(25, 0));
        writer.put_item(make_item("AAE", 1)).await.unwrap();

        let err = writer.close().await.unwrap_err();
        assert!(matches!(err, PersistenceError::ExhaustedRetries { attempts: 1, .. }));
        assert_eq!(store.calls().batch_write, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_error_resends_whole_batch() {
        let store = make_store();
        let throttled = StoreError::from_code("ProvisionedThroughputExceededException", "Error insert");
        for _ in 0..4 {
            store.push_batch_behavior(BatchBehavior::Fail(throttled.clone()));
        }
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(25, 10));
        writer.put_item(make_item("AAE", 1)).await.unwrap();
        writer.put_item(make_item("TRC", 1)).await.unwrap();

        let summary = writer.close().await.unwrap();

        assert_eq!(store.calls().batch_sizes, vec![2, 2, 2, 2, 2]);
        assert_eq!(summary.acknowledged, 2);
        assert_eq!(store.item_count(TABLE), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_without_retry() {
        let store = make_store();
        store.push_batch_behavior(BatchBehavior::Fail(StoreError::from_code("500", "Error insert")));
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(25, 10));
        writer.put_item(make_item("AAE", 1)).await.unwrap();

        let err = writer.close().await.unwrap_err();

        assert!(matches!(err, PersistenceError::Store(ref e) if e.code == "500"));
        assert_eq!(store.calls().batch_write, 1);
    }

    #[tokio::test]
    async fn test_same_key_overwrites_pending_request() {
        let store = make_store();
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(25, 1));
        let mut first = make_item("AAE", 1);
        first.document.insert("v".to_string(), serde_json::json!(1));
        let mut second = make_item("AAE", 1);
        second.document.insert("v".to_string(), serde_json::json!(2));

        writer.put_item(first).await.unwrap();
        writer.put_item(make_item("TRC", 1)).await.unwrap();
        writer.put_item(second).await.unwrap();
        assert_eq!(writer.pending(), 2);

        let summary = writer.close().await.unwrap();
        assert_eq!(store.calls().batch_sizes, vec![2]);
        assert_eq!(summary.acknowledged, 2);
        let stored = store.items(TABLE);
        assert_eq!(stored[0]["document"]["v"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_delete_overwrites_pending_put() {
        let store = make_store();
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(25, 1));
        writer.put_item(make_item("AAE", 1)).await.unwrap();
        writer
            .delete_item(ItemKey::new("AAE", "2020-01-01"))
            .await
            .unwrap();

        writer.close().await.unwrap();
        assert_eq!(store.calls().batch_sizes, vec![1]);
        assert_eq!(store.item_count(TABLE), 0);
    }

    #[tokio::test]
    async fn test_deletes_share_the_buffer() {
        let store = make_store();
        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(25, 1));
        writer.put_item(make_item("AAE", 1)).await.unwrap();
        writer.put_item(make_item("AAE", 2)).await.unwrap();
        writer.close().await.unwrap();

        let mut writer = BatchWriteBuffer::new(store.clone(), TABLE, settings(25, 1));
        writer
            .delete_item(ItemKey::new("AAE", "2020-01-01"))
            .await
            .unwrap();
        writer.close().await.unwrap();

        assert_eq!(store.item_count(TABLE), 1);
    }
}
