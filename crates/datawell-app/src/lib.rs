//! datawell command line application.
//!
//! Wires configuration, logging and the selected table store backend into
//! the `store`, `find`, `purge` and `delete` commands.

pub mod app;
pub mod config;
pub mod error;

pub use app::{parse_documents, Application};
pub use config::{AppConfig, PersistenceConfig, StoreBackend, StoreConfig, TelemetryConfig};
pub use error::{AppError, AppResult};
