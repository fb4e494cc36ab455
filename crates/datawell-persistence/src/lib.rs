//! Resilient persistence for datawell snapshots.
//!
//! Documents flow through the sanitizer into a batching write buffer that
//! absorbs partial failures from the table store, and come back out through
//! a cursor-paginated query engine:
//! - `gateway`: the store boundary (`StoreGateway`) and its wire types
//! - `retry`: exponential-backoff retry for status+payload operations
//! - `batch`: write buffer with unprocessed-item retry
//! - `query`: filter criteria, page streaming and delete-by-symbol
//! - `store`: `DocumentStore` facade exposing store/find/purge
//! - `memory`: in-process gateway; `dynamo`: DynamoDB gateway (feature `dynamodb`)

pub mod batch;
#[cfg(feature = "dynamodb")]
pub mod dynamo;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod query;
pub mod retry;
pub mod store;

pub use batch::{BatchWriteBuffer, FlushSummary, WriterSettings, MAX_BATCH_WRITE_ITEMS};
#[cfg(feature = "dynamodb")]
pub use dynamo::DynamoStore;
pub use error::{PersistenceError, PersistenceResult};
pub use gateway::{
    BatchWriteOutput, BoxFuture, DynStoreGateway, KeyCondition, KeyEquals, Page, PageCursor,
    QueryRequest, StoreError, StoreErrorKind, StoreGateway, StoreResult, TableSchema,
    WriteRequest, DATE_SYMBOL_INDEX,
};
pub use memory::{BatchBehavior, CallLog, MemoryStore};
pub use query::{FilterCriteria, PageStream, PaginatedQueryEngine};
pub use retry::{with_retry, RetryPolicy};
pub use store::{DocumentStore, TableAdmin};
