//! Core domain types for the datawell snapshot store.
//!
//! This crate provides the types shared by every other crate in the workspace:
//! - `Document`, `StoredItem`, `ItemKey`: per-symbol snapshot documents and their persisted layout
//! - `ActionStatus`, `Outcome`: coarse status reporting for batch jobs
//! - `RetryConfig`: exponential backoff schedule used by the write path
//! - `sanitizer`: recursive removal of empty fields and identity validation

pub mod backoff;
pub mod document;
pub mod error;
pub mod sanitizer;
pub mod status;

pub use backoff::{exponential_delay, RetryConfig};
pub use document::{
    Document, Item, ItemKey, StoredItem, DATE_FIELD, DATE_FORMAT, DOCUMENT_FIELD, SYMBOL_FIELD,
};
pub use error::{CoreError, Result};
pub use sanitizer::{
    clean, clean_document, sanitize_documents, validate, validate_strict, SanitizeReport,
};
pub use status::{ActionStatus, Outcome};
