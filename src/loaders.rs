//! ## Batch and Lookup Loaders
//!
//! This module implements the two one-shot loaders:
//!
//! - **Batch Loader** ([`ingest_trips`]): fetches one monthly trip dataset, splits it into
//!   contiguous batches of at most `batch_size` rows, and writes them with a two-phase protocol:
//!   a schema-only `create_schema` for the first batch, then one `append` per batch (the first
//!   one included).
//! - **Lookup Loader** ([`ingest_lookup`]): fetches a small reference dataset and writes it
//!   with a single `replace`.
//!
//! Fetch and write failures abort the run. Batches that were already appended stay in the
//! destination table.

use crate::exceptions::{IngestError, IngestResult};
use crate::sinks::TableSink;
use crate::source::{DatasetHandle, DatasetSource, TripDataTemplate};
use arrow::record_batch::RecordBatch;
use std::ops::Range;
use std::time::Instant;
use tracing::{debug, info};

/// Batch size used when the caller does not pick one.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Trip dataset loaded when the caller does not pick one.
pub const DEFAULT_TRIP_VARIANT: &str = "green";

/// One monthly trip dataset to load into `table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripLoadRequest {
    pub table: String,
    pub variant: String,
    pub year: i32,
    pub month: u32,
    pub batch_size: usize,
}

impl TripLoadRequest {
    pub fn new(table: impl Into<String>, year: i32, month: u32) -> Self {
        Self {
            table: table.into(),
            variant: DEFAULT_TRIP_VARIANT.to_string(),
            year,
            month,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Summary of a completed load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub table: String,
    pub rows: usize,
    pub batches: usize,
}

/// Contiguous row ranges of at most `batch_size` rows covering `0..total_rows` in order.
pub fn batch_ranges(total_rows: usize, batch_size: usize) -> IngestResult<Vec<Range<usize>>> {
    if batch_size == 0 {
        return Err(IngestError::InvalidParameter(
            "batch size must be at least 1".to_string(),
        ));
    }
    Ok((0..total_rows)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(total_rows))
        .collect())
}

/// Splits `batch` into zero-copy slices of at most `batch_size` rows.
pub fn split_batches(batch: &RecordBatch, batch_size: usize) -> IngestResult<Vec<RecordBatch>> {
    Ok(batch_ranges(batch.num_rows(), batch_size)?
        .into_iter()
        .map(|range| batch.slice(range.start, range.len()))
        .collect())
}

/// Writes `data` to `table` in batches of at most `batch_size` rows.
///
/// Phase one re-creates `table` from the schema of the first batch. Phase two appends every
/// batch in order. An empty dataset produces no writes at all.
pub async fn load_batches<K>(
    sink: &mut K,
    table: &str,
    data: &RecordBatch,
    batch_size: usize,
) -> IngestResult<LoadReport>
where
    K: TableSink + ?Sized,
{
    let batches = split_batches(data, batch_size)?;
    let Some(first) = batches.first() else {
        info!("No rows to load into '{}'", table);
        return Ok(LoadReport {
            table: table.to_string(),
            rows: 0,
            batches: 0,
        });
    };

    sink.create_schema(table, first.schema()).await?;

    let total = batches.len();
    let mut rows = 0;
    for (i, batch) in batches.iter().enumerate() {
        let start = Instant::now();
        sink.append(table, batch).await?;
        rows += batch.num_rows();
        debug!(
            "Batch {}/{}: {} rows into '{}' in {:?}",
            i + 1,
            total,
            batch.num_rows(),
            table,
            start.elapsed()
        );
    }

    Ok(LoadReport {
        table: table.to_string(),
        rows,
        batches: total,
    })
}

/// Batch Loader: fetches one monthly trip dataset and loads it into `request.table`.
pub async fn ingest_trips<S, K>(
    source: &S,
    sink: &mut K,
    template: &TripDataTemplate,
    request: &TripLoadRequest,
) -> IngestResult<LoadReport>
where
    S: DatasetSource + ?Sized,
    K: TableSink + ?Sized,
{
    if request.batch_size == 0 {
        return Err(IngestError::InvalidParameter(
            "batch size must be at least 1".to_string(),
        ));
    }
    let handle = template.handle(&request.variant, request.year, request.month)?;
    let data = source.fetch(&handle).await?;
    info!("Fetched {} rows from {}", data.num_rows(), handle);

    let report = load_batches(sink, &request.table, &data, request.batch_size).await?;
    info!(
        "Loaded trips data: {} rows in {} batches into '{}'",
        report.rows, report.batches, report.table
    );
    Ok(report)
}

/// Lookup Loader: fetches a reference dataset and replaces `table` with it in one write.
pub async fn ingest_lookup<S, K>(
    source: &S,
    sink: &mut K,
    handle: &DatasetHandle,
    table: &str,
) -> IngestResult<LoadReport>
where
    S: DatasetSource + ?Sized,
    K: TableSink + ?Sized,
{
    let data = source.fetch(handle).await?;
    sink.replace(table, &data).await?;
    info!("Loaded lookup data: {} rows into '{}'", data.num_rows(), table);
    Ok(LoadReport {
        table: table.to_string(),
        rows: data.num_rows(),
        batches: 1,
    })
}
