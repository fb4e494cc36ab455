//! Prometheus metrics for datawell.
//!
//! Covers the persistence path:
//! - Store calls by operation
//! - Write buffer acknowledgements, retries and exhausted budgets
//! - Documents dropped by the sanitizer
//! - Query pages and deleted items
//! - Duration of the exposed store/find/purge operations
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means a duplicate metric name, which is a programming error that should
//! surface at first use rather than be silently ignored.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder,
    HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

/// Calls issued to the table store.
/// Labels: operation (batch_write/query/scan/delete_item/create_table/drop_table)
pub static STORE_CALLS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "datawell_store_calls_total",
        "Calls issued to the table store",
        &["operation"]
    )
    .unwrap()
});

/// Write requests acknowledged by the store.
pub static REQUESTS_ACKNOWLEDGED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "datawell_requests_acknowledged_total",
        "Write requests acknowledged by the table store"
    )
    .unwrap()
});

/// Batch retries.
/// Labels: reason (unprocessed/capacity)
pub static BATCH_RETRIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "datawell_batch_retries_total",
        "Batch write retries scheduled",
        &["reason"]
    )
    .unwrap()
});

/// Write sessions that ran out of retry budget.
pub static RETRIES_EXHAUSTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "datawell_retries_exhausted_total",
        "Write sessions aborted after exhausting the retry budget"
    )
    .unwrap()
});

/// Retries performed by the generic retry policy.
pub static POLICY_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "datawell_policy_retries_total",
        "Retries performed by the retry policy"
    )
    .unwrap()
});

/// Documents rejected before reaching the store.
pub static DOCUMENTS_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "datawell_documents_dropped_total",
        "Documents dropped by the sanitizer (missing symbol or date)"
    )
    .unwrap()
});

/// Pages fetched by the query engine.
/// Labels: source (query/index/scan)
pub static QUERY_PAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "datawell_query_pages_total",
        "Pages fetched from the table store",
        &["source"]
    )
    .unwrap()
});

/// Items deleted by purge.
pub static ITEMS_DELETED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "datawell_items_deleted_total",
        "Items deleted by symbol purge"
    )
    .unwrap()
});

/// Duration of exposed operations in milliseconds.
/// Labels: operation (store/find/purge)
pub static OPERATION_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "datawell_operation_duration_ms",
        "Running time of store/find/purge in milliseconds",
        &["operation"],
        vec![5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 30000.0, 120000.0]
    )
    .unwrap()
});

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    /// Record a call to the table store.
    pub fn store_call(operation: &str) {
        STORE_CALLS_TOTAL.with_label_values(&[operation]).inc();
    }

    /// Record acknowledged write requests.
    pub fn requests_acknowledged(count: usize) {
        REQUESTS_ACKNOWLEDGED_TOTAL.inc_by(count as u64);
    }

    /// Record a scheduled batch retry.
    pub fn batch_retry(reason: &str) {
        BATCH_RETRIES_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record a write session aborted by the retry budget.
    pub fn retries_exhausted() {
        RETRIES_EXHAUSTED_TOTAL.inc();
    }

    /// Record a retry of the generic retry policy.
    pub fn policy_retry() {
        POLICY_RETRIES_TOTAL.inc();
    }

    /// Record documents dropped by the sanitizer.
    pub fn documents_dropped(count: usize) {
        DOCUMENTS_DROPPED_TOTAL.inc_by(count as u64);
    }

    /// Record a fetched page.
    pub fn query_page(source: &str) {
        QUERY_PAGES_TOTAL.with_label_values(&[source]).inc();
    }

    /// Record deleted items.
    pub fn items_deleted(count: usize) {
        ITEMS_DELETED_TOTAL.inc_by(count as u64);
    }

    /// Record the running time of an exposed operation.
    pub fn operation_duration(operation: &str, elapsed_ms: f64) {
        OPERATION_DURATION_MS
            .with_label_values(&[operation])
            .observe(elapsed_ms);
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let before = STORE_CALLS_TOTAL.with_label_values(&["query"]).get();
        Metrics::store_call("query");
        Metrics::store_call("query");
        assert_eq!(STORE_CALLS_TOTAL.with_label_values(&["query"]).get(), before + 2);

        let dropped = DOCUMENTS_DROPPED_TOTAL.get();
        Metrics::documents_dropped(3);
        assert_eq!(DOCUMENTS_DROPPED_TOTAL.get(), dropped + 3);
    }

    #[test]
    fn test_render_contains_registered_metrics() {
        Metrics::operation_duration("store", 12.0);
        Metrics::requests_acknowledged(1);
        let text = Metrics::render().unwrap();
        assert!(text.contains("datawell_operation_duration_ms"));
        assert!(text.contains("datawell_requests_acknowledged_total"));
    }
}
