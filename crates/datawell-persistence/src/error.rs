//! Persistence error types.

use crate::gateway::StoreError;
use datawell_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Max retries exceeded: retry attempt {attempts}, {unflushed} item(s) not persisted")]
    ExhaustedRetries { attempts: u32, unflushed: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CoreError> for PersistenceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidArgument(msg) => PersistenceError::InvalidArgument(msg),
            CoreError::InvalidConfig(msg) => PersistenceError::InvalidConfig(msg),
            CoreError::Json(e) => PersistenceError::Json(e),
        }
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
