//! Application wiring.
//!
//! Builds the configured table store backend and exposes the CLI
//! operations on top of `DocumentStore`.

use crate::config::{AppConfig, StoreBackend};
use crate::error::{AppError, AppResult};
use datawell_core::{ActionStatus, ItemKey, StoredItem, DATE_FORMAT};
use datawell_persistence::{DocumentStore, DynStoreGateway, FilterCriteria, MemoryStore};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Main application.
pub struct Application {
    config: AppConfig,
    /// Set for the memory backend, for snapshot persistence.
    memory: Option<Arc<MemoryStore>>,
    store: DocumentStore,
}

impl Application {
    /// Connect to the configured backend.
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let (gateway, memory) = build_gateway(&config).await?;
        let store = DocumentStore::new(
            gateway,
            config.store.table_name.clone(),
            config.persistence.writer_settings(),
        );

        info!(
            backend = ?config.store.backend,
            table = %config.store.table_name,
            "Application initialized"
        );
        Ok(Self {
            config,
            memory,
            store,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Persist documents read from a JSON array or JSON-lines file.
    pub async fn store_file(&self, path: &Path) -> AppResult<ActionStatus> {
        let content = tokio::fs::read_to_string(path).await?;
        let documents = parse_documents(&content)?;
        info!(path = %path.display(), documents = documents.len(), "Read documents");

        let status = self.store.store(documents).await?;
        self.save_snapshot().await?;
        Ok(status)
    }

    /// Items matching optional symbol and `YYYY-MM-DD` date filters.
    pub async fn find(&self, symbol: Option<&str>, date: Option<&str>) -> AppResult<Vec<StoredItem>> {
        let criteria = FilterCriteria::parse(symbol, date)?;
        Ok(self.store.find_by(&criteria).await?)
    }

    /// Delete the given symbols, or the whole table when `all` is set.
    pub async fn purge(&self, symbols: &[String], all: bool) -> AppResult<i64> {
        if symbols.is_empty() && !all {
            return Err(AppError::Input(
                "no symbols given; pass --all to clear the entire table".to_string(),
            ));
        }
        if !symbols.is_empty() && all {
            return Err(AppError::Input(
                "--all cannot be combined with symbols".to_string(),
            ));
        }

        let deleted = self.store.purge(symbols).await?;
        self.save_snapshot().await?;
        Ok(deleted)
    }

    /// Delete one item by key.
    pub async fn delete(&self, symbol: &str, date: &str) -> AppResult<()> {
        if symbol.is_empty() {
            return Err(AppError::Input("symbol must not be empty".to_string()));
        }
        chrono::NaiveDate::parse_from_str(date, DATE_FORMAT)
            .map_err(|e| AppError::Input(format!("date must be YYYY-MM-DD, got {date:?}: {e}")))?;

        self.store.delete(ItemKey::new(symbol, date)).await?;
        self.save_snapshot().await
    }

    /// Write the memory backend to its snapshot file, if configured.
    pub async fn save_snapshot(&self) -> AppResult<()> {
        if let (Some(memory), Some(path)) = (&self.memory, &self.config.store.snapshot_path) {
            memory.save_snapshot(path).await?;
        }
        Ok(())
    }
}

async fn build_gateway(config: &AppConfig) -> AppResult<(DynStoreGateway, Option<Arc<MemoryStore>>)> {
    match config.store.backend {
        StoreBackend::Memory => {
            let memory = Arc::new(MemoryStore::with_page_size(config.store.page_size));
            if let Some(path) = config.store.snapshot_path.as_deref().filter(|p| p.exists()) {
                memory.load_snapshot(path).await?;
            }
            let gateway: DynStoreGateway = memory.clone();
            Ok((gateway, Some(memory)))
        }
        StoreBackend::Dynamodb => build_dynamo(config).await.map(|gateway| (gateway, None)),
    }
}

#[cfg(feature = "dynamodb")]
async fn build_dynamo(config: &AppConfig) -> AppResult<DynStoreGateway> {
    let store = datawell_persistence::DynamoStore::connect(
        config.store.region.as_deref(),
        config.store.endpoint_url.as_deref(),
    )
    .await
    .with_page_size(config.store.page_size);
    Ok(Arc::new(store))
}

#[cfg(not(feature = "dynamodb"))]
async fn build_dynamo(_config: &AppConfig) -> AppResult<DynStoreGateway> {
    Err(AppError::Config(
        "dynamodb backend requires building with the `dynamodb` feature".to_string(),
    ))
}

/// Parse a JSON array of documents, or one JSON value per non-empty line.
pub fn parse_documents(content: &str) -> AppResult<Vec<Value>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .map_err(|e| AppError::Input(format!("line {}: {e}", n + 1)))
        })
        .collect()
}
