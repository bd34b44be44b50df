//! # Destination Sinks
//!
//! The submodules contain the stores a loader can write to.
//!
//! - [`memory::MemorySink`]: an in-memory Arrow store, queryable through DataFusion.
//! - [`postgres::PostgresSink`]: a PostgreSQL database reached through `sqlx`.

pub mod memory;
pub mod postgres;

use crate::exceptions::IngestResult;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;

/// Write modes a destination table supports.
///
/// Writes are issued one at a time and each call completes before the next one starts.
#[async_trait]
pub trait TableSink: Send {
    /// Replaces `table` with an empty table of the given schema.
    async fn create_schema(&mut self, table: &str, schema: SchemaRef) -> IngestResult<()>;

    /// Appends the rows of `batch` to an existing `table`.
    async fn append(&mut self, table: &str, batch: &RecordBatch) -> IngestResult<()>;

    /// Replaces `table` with exactly the rows of `batch`.
    async fn replace(&mut self, table: &str, batch: &RecordBatch) -> IngestResult<()>;

    /// Creates an empty `table` with the given schema unless it already exists.
    async fn create_if_missing(&mut self, table: &str, schema: SchemaRef) -> IngestResult<()>;
}

