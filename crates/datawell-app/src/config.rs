//! Configuration management.

use crate::error::{AppError, AppResult};
use datawell_core::RetryConfig;
use datawell_persistence::{WriterSettings, MAX_BATCH_WRITE_ITEMS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config path used when neither `--config` nor `DATAWELL_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
/// Environment variable holding the config path.
pub const CONFIG_ENV: &str = "DATAWELL_CONFIG";
/// Environment variable overriding `store.table_name`.
pub const TABLE_NAME_ENV: &str = "DATAWELL_TABLE_NAME";

/// Table store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process tables, optionally persisted to a snapshot file.
    #[default]
    Memory,
    /// Amazon DynamoDB (requires the `dynamodb` feature).
    Dynamodb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// AWS region; the SDK default chain is used when unset.
    #[serde(default)]
    pub region: Option<String>,

    /// Alternative endpoint, e.g. a local DynamoDB.
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Memory backend snapshot file, loaded at start and saved after writes.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,

    /// Items per query/scan page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_table_name() -> String {
    "snapshots".to_string()
}

fn default_page_size() -> usize {
    100
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            table_name: default_table_name(),
            region: None,
            endpoint_url: None,
            snapshot_path: None,
            page_size: default_page_size(),
        }
    }
}

/// Write buffer and retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_flush_size")]
    pub flush_size: usize,

    /// Negative = unlimited, 0 = no retry.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,

    #[serde(default = "default_init_delay_secs")]
    pub init_delay_secs: i64,

    /// Negative = no cap, 0 = no sleep.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: i64,
}

fn default_flush_size() -> usize {
    MAX_BATCH_WRITE_ITEMS
}

fn default_max_attempts() -> i64 {
    10
}

fn default_init_delay_secs() -> i64 {
    1
}

fn default_max_delay_secs() -> i64 {
    60
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_size: default_flush_size(),
            max_attempts: default_max_attempts(),
            init_delay_secs: default_init_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl PersistenceConfig {
    pub fn writer_settings(&self) -> WriterSettings {
        WriterSettings {
            flush_size: self.flush_size,
            retry: RetryConfig::new(self.max_attempts, self.init_delay_secs, self.max_delay_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default log directives; `RUST_LOG` overrides.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Config path: CLI argument > `DATAWELL_CONFIG` > default.
    pub fn resolve_path(cli: Option<String>) -> String {
        cli.or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load from `path`, falling back to defaults when the file is missing,
    /// then apply environment overrides.
    pub fn load(path: &str) -> AppResult<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_table_override(std::env::var(TABLE_NAME_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    pub fn apply_table_override(&mut self, table_name: Option<String>) {
        if let Some(name) = table_name.filter(|n| !n.trim().is_empty()) {
            self.store.table_name = name;
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.store.table_name.trim().is_empty() {
            return Err(AppError::Config("store.table_name must not be empty".to_string()));
        }
        if self.store.page_size == 0 {
            return Err(AppError::Config("store.page_size must be positive".to_string()));
        }
        if self.persistence.flush_size == 0 || self.persistence.flush_size > MAX_BATCH_WRITE_ITEMS {
            return Err(AppError::Config(format!(
                "persistence.flush_size must be between 1 and {MAX_BATCH_WRITE_ITEMS}"
            )));
        }
        Ok(())
    }
}
