//! Cursor-paginated reads and delete-by-symbol.
//!
//! A query keeps reissuing the same request with the continuation cursor of
//! the previous page until the store stops returning one. Symbol filters
//! query the table, date-only filters query the `(date, symbol)` index, and
//! an empty filter scans the whole table.

use crate::batch::{BatchWriteBuffer, WriterSettings};
use crate::error::{PersistenceError, PersistenceResult};
use crate::gateway::{DynStoreGateway, KeyCondition, PageCursor, QueryRequest, DATE_SYMBOL_INDEX};
use chrono::NaiveDate;
use datawell_core::{Item, ItemKey, DATE_FIELD, DATE_FORMAT, SYMBOL_FIELD};
use datawell_telemetry::Metrics;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Which items a read selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterCriteria {
    /// Every item (full scan).
    All,
    Symbol(String),
    /// Every symbol on one date (index query).
    Date(NaiveDate),
    SymbolAndDate(String, NaiveDate),
}

impl FilterCriteria {
    /// Build from optional filters. An empty symbol counts as absent.
    pub fn new(symbol: Option<&str>, date: Option<NaiveDate>) -> Self {
        match (symbol.filter(|s| !s.is_empty()), date) {
            (Some(symbol), Some(date)) => FilterCriteria::SymbolAndDate(symbol.to_string(), date),
            (Some(symbol), None) => FilterCriteria::Symbol(symbol.to_string()),
            (None, Some(date)) => FilterCriteria::Date(date),
            (None, None) => FilterCriteria::All,
        }
    }

    /// Parse user-supplied filters, rejecting empty symbols and non-ISO dates.
    pub fn parse(symbol: Option<&str>, date: Option<&str>) -> PersistenceResult<Self> {
        if symbol.is_some_and(|s| s.trim().is_empty()) {
            return Err(PersistenceError::InvalidArgument(
                "symbol must not be empty".to_string(),
            ));
        }
        let date = date
            .map(|raw| {
                NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|e| {
                    PersistenceError::InvalidArgument(format!(
                        "date must be YYYY-MM-DD, got {raw:?}: {e}"
                    ))
                })
            })
            .transpose()?;

        Ok(Self::new(symbol, date))
    }

    /// Key-conditioned request for this filter, or `None` for a full scan.
    pub fn to_request(&self) -> Option<QueryRequest> {
        match self {
            FilterCriteria::All => None,
            FilterCriteria::Symbol(symbol) => Some(QueryRequest::new(KeyCondition::partition(
                SYMBOL_FIELD,
                symbol.as_str(),
            ))),
            FilterCriteria::Date(date) => Some(
                QueryRequest::new(KeyCondition::partition(DATE_FIELD, format_date(date)))
                    .with_index(DATE_SYMBOL_INDEX),
            ),
            FilterCriteria::SymbolAndDate(symbol, date) => Some(QueryRequest::new(
                KeyCondition::partition(SYMBOL_FIELD, symbol.as_str())
                    .and_sort(DATE_FIELD, format_date(date)),
            )),
        }
    }
}

fn format_date(date: &NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Finite page iterator over one query or scan.
///
/// Not restartable: once the final page has been returned, `next_page`
/// yields `None`.
pub struct PageStream {
    gateway: DynStoreGateway,
    table: String,
    /// `None` = scan.
    request: Option<QueryRequest>,
    cursor: Option<PageCursor>,
    finished: bool,
    pages_fetched: usize,
}

impl PageStream {
    fn new(gateway: DynStoreGateway, table: String, request: Option<QueryRequest>) -> Self {
        Self {
            gateway,
            table,
            request,
            cursor: None,
            finished: false,
            pages_fetched: 0,
        }
    }

    /// Fetch the next page, or `None` once the result set is exhausted.
    pub async fn next_page(&mut self) -> PersistenceResult<Option<Vec<Item>>> {
        if self.finished {
            return Ok(None);
        }

        let cursor = self.cursor.take();
        let page = match &self.request {
            Some(request) => {
                let mut request = request.clone();
                request.cursor = cursor;
                let source = if request.index.is_some() { "index" } else { "query" };
                Metrics::store_call("query");
                Metrics::query_page(source);
                self.gateway.query(&self.table, request).await?
            }
            None => {
                Metrics::store_call("scan");
                Metrics::query_page("scan");
                self.gateway.scan(&self.table, cursor).await?
            }
        };

        self.pages_fetched += 1;
        self.finished = page.cursor.is_none();
        self.cursor = page.cursor;
        debug!(
            table = %self.table,
            page = self.pages_fetched,
            items = page.items.len(),
            more = !self.finished,
            "Fetched page"
        );

        Ok(Some(page.items))
    }

    #[must_use]
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

/// Paginated reads and deletes against one table.
#[derive(Clone)]
pub struct PaginatedQueryEngine {
    gateway: DynStoreGateway,
    table: String,
}

impl PaginatedQueryEngine {
    pub fn new(gateway: DynStoreGateway, table: impl Into<String>) -> Self {
        Self {
            gateway,
            table: table.into(),
        }
    }

    /// Page iterator over the items matching `criteria`.
    pub fn pages(&self, criteria: &FilterCriteria) -> PageStream {
        PageStream::new(self.gateway.clone(), self.table.clone(), criteria.to_request())
    }

    /// Every item matching `criteria`, in the store's native order.
    pub async fn query(&self, criteria: &FilterCriteria) -> PersistenceResult<Vec<Item>> {
        let mut stream = self.pages(criteria);
        let mut items = Vec::new();
        while let Some(page) = stream.next_page().await? {
            items.extend(page);
        }

        debug!(
            table = %self.table,
            ?criteria,
            pages = stream.pages_fetched(),
            items = items.len(),
            "Query complete"
        );
        Ok(items)
    }

    /// Delete every item of the given symbols, returning how many were deleted.
    ///
    /// Keys are read page by page with a `symbol, date` projection and fed to
    /// a write buffer as delete requests. Empty and repeated symbols are
    /// skipped; an empty list deletes nothing.
    pub async fn delete_by_symbols(
        &self,
        symbols: &[String],
        settings: WriterSettings,
    ) -> PersistenceResult<usize> {
        let mut writer = BatchWriteBuffer::new(self.gateway.clone(), self.table.clone(), settings);
        let mut deleted = 0;
        let mut seen = HashSet::with_capacity(symbols.len());

        for symbol in symbols {
            if symbol.is_empty() {
                warn!(table = %self.table, "Skipping empty symbol in purge");
                continue;
            }
            if !seen.insert(symbol.as_str()) {
                debug!(table = %self.table, %symbol, "Skipping repeated symbol in purge");
                continue;
            }

            let request = QueryRequest::new(KeyCondition::partition(SYMBOL_FIELD, symbol.as_str()))
                .with_projection(&[SYMBOL_FIELD, DATE_FIELD]);
            let mut stream = PageStream::new(self.gateway.clone(), self.table.clone(), Some(request));

            let mut symbol_deleted = 0;
            while let Some(page) = stream.next_page().await? {
                for item in page {
                    let Some(key) = ItemKey::from_item(&item) else {
                        warn!(table = %self.table, ?item, "Projected item has no key");
                        continue;
                    };
                    writer.delete_item(key).await?;
                    symbol_deleted += 1;
                }
            }

            info!(table = %self.table, symbol = %symbol, deleted = symbol_deleted, "Queued deletes");
            deleted += symbol_deleted;
        }

        let summary = writer.close().await?;
        Metrics::items_deleted(deleted);
        info!(
            table = %self.table,
            deleted,
            store_calls = summary.store_calls,
            retries = summary.retries,
            "Delete by symbols complete"
        );
        Ok(deleted)
    }
}
