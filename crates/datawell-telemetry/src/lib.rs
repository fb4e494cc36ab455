//! Prometheus metrics and structured logging for datawell.
//!
//! - Structured logging with tracing (JSON in production, pretty otherwise)
//! - Prometheus counters for the write buffer, query pages and deletes
//! - Operation duration histogram for the exposed store/find/purge calls

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
