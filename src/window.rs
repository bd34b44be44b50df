//! ## Window Fetcher
//!
//! Fetches every (variant, month) trip dataset in a date window and combines them into one
//! table for a downstream materialization step.
//!
//! - Months are enumerated from the start date's month through the end date's month, inclusive.
//! - Fetches run one after the other, variant-major and then month-ascending. A failed fetch is
//!   logged and recorded in [`WindowOutcome::failures`]; the remaining fetches still run.
//! - Each fetched batch is tagged with a [`VARIANT_COLUMN`] column. Batches are concatenated by
//!   column name. Missing columns become nulls; a column whose type differs between batches is
//!   widened to a common type (see [`common_type`]).
//! - One [`EXTRACTED_AT_COLUMN`] timestamp, taken once the last fetch has finished, is stamped
//!   on every row.
//!
//! [`fetch_window`] itself writes nothing; [`materialize_window`] appends an outcome to a sink.

use crate::exceptions::{IngestError, IngestResult};
use crate::settings::WindowContext;
use crate::sinks::TableSink;
use crate::source::{DatasetHandle, DatasetSource, TripDataTemplate};
use arrow::array::{new_null_array, ArrayRef, StringArray, TimestampMicrosecondArray};
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{DataType, Field, FieldRef, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use datafusion::logical_expr::type_coercion::binary::comparison_coercion;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Column holding the variant a row was fetched for.
pub const VARIANT_COLUMN: &str = "taxi_type";

/// Column holding the time the window was extracted.
pub const EXTRACTED_AT_COLUMN: &str = "extracted_at";

/// A calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Months since year 0, used for stepping.
    fn ordinal(self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month) - 1
    }

    fn from_ordinal(ordinal: i64) -> Self {
        Self {
            year: ordinal.div_euclid(12) as i32,
            month: ordinal.rem_euclid(12) as u32 + 1,
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

/// Every month from `start`'s month through `end`'s month, ascending.
/// Empty when `end` precedes `start`.
pub fn months_in_window(start: NaiveDate, end: NaiveDate) -> Vec<YearMonth> {
    let first = YearMonth::of(start).ordinal();
    let last = YearMonth::of(end).ordinal();
    (first..=last).map(YearMonth::from_ordinal).collect()
}

/// One (variant, month) fetch that did not produce data.
#[derive(Debug)]
pub struct FetchFailure {
    pub variant: String,
    pub month: YearMonth,
    pub url: String,
    pub error: IngestError,
}

/// Result of a window fetch.
#[derive(Debug)]
pub struct WindowOutcome {
    /// All fetched rows; an empty batch with no columns when nothing was fetched.
    pub table: RecordBatch,
    pub extracted_at: DateTime<Utc>,
    /// Number of (variant, month) fetches attempted.
    pub attempted: usize,
    pub failures: Vec<FetchFailure>,
}

impl WindowOutcome {
    pub fn succeeded(&self) -> usize {
        self.attempted - self.failures.len()
    }

    pub fn num_rows(&self) -> usize {
        self.table.num_rows()
    }
}

/// Returns `batch` with `field`/`array` replacing the column of the same name, or appended.
fn with_column(batch: &RecordBatch, field: Field, array: ArrayRef) -> IngestResult<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<FieldRef> = schema.fields().iter().cloned().collect();
    let mut columns = batch.columns().to_vec();
    match schema.index_of(field.name()) {
        Ok(i) => {
            fields[i] = Arc::new(field);
            columns[i] = array;
        }
        Err(_) => {
            fields.push(Arc::new(field));
            columns.push(array);
        }
    }
    let schema = Schema::new_with_metadata(fields, schema.metadata().clone());
    Ok(RecordBatch::try_new(Arc::new(schema), columns)?)
}

/// Adds a [`VARIANT_COLUMN`] column holding `variant` on every row.
pub fn tag_variant(batch: &RecordBatch, variant: &str) -> IngestResult<RecordBatch> {
    let values: ArrayRef = Arc::new(StringArray::from(vec![variant; batch.num_rows()]));
    with_column(
        batch,
        Field::new(VARIANT_COLUMN, DataType::Utf8, false),
        values,
    )
}

/// Adds an [`EXTRACTED_AT_COLUMN`] column holding `extracted_at` (UTC, microseconds) on every row.
pub fn stamp_extracted_at(
    batch: &RecordBatch,
    extracted_at: DateTime<Utc>,
) -> IngestResult<RecordBatch> {
    let micros = extracted_at.timestamp_micros();
    let values: ArrayRef = Arc::new(
        TimestampMicrosecondArray::from(vec![micros; batch.num_rows()]).with_timezone("UTC"),
    );
    with_column(
        batch,
        Field::new(
            EXTRACTED_AT_COLUMN,
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        values,
    )
}

/// Type both `a` and `b` can be cast to without losing values.
///
/// A `Null` column adopts the other type. Two numeric types (or two temporal types) are
/// coerced the way DataFusion coerces comparison operands, so mixed integers and floats become
/// `Float64`. Any other mismatch falls back to `Utf8`.
pub fn common_type(a: &DataType, b: &DataType) -> DataType {
    match (a, b) {
        _ if a == b => a.clone(),
        (DataType::Null, other) | (other, DataType::Null) => other.clone(),
        _ if a.is_numeric() && b.is_numeric() => {
            comparison_coercion(a, b).unwrap_or(DataType::Float64)
        }
        _ if a.is_temporal() && b.is_temporal() => {
            comparison_coercion(a, b).unwrap_or(DataType::Utf8)
        }
        _ => DataType::Utf8,
    }
}

fn align_to(batch: &RecordBatch, schema: &SchemaRef) -> IngestResult<RecordBatch> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(field.name()) {
            Some(column) if column.data_type() == field.data_type() => Ok(column.clone()),
            Some(column) => Ok(cast(column, field.data_type())?),
            None => Ok(new_null_array(field.data_type(), batch.num_rows())),
        })
        .collect::<IngestResult<Vec<_>>>()?;
    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

/// Concatenates batches in order, matching columns by name.
///
/// The combined schema lists columns in first-seen order, each with the [`common_type`] of
/// every batch that has it. A column absent from a batch is filled with nulls for that batch's
/// rows. No batches yields an empty batch with no columns.
pub fn concat_by_name(batches: &[RecordBatch]) -> IngestResult<RecordBatch> {
    if batches.is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
    }
    let mut fields: Vec<Field> = Vec::new();
    for batch in batches {
        for field in batch.schema().fields() {
            match fields.iter_mut().find(|f| f.name() == field.name()) {
                Some(existing) => {
                    let widened = common_type(existing.data_type(), field.data_type());
                    if &widened != existing.data_type() {
                        *existing = existing.clone().with_data_type(widened);
                    }
                }
                None => fields.push(field.as_ref().clone().with_nullable(true)),
            }
        }
    }
    let schema = Arc::new(Schema::new(fields));
    let aligned = batches
        .iter()
        .map(|batch| align_to(batch, &schema))
        .collect::<IngestResult<Vec<_>>>()?;
    Ok(concat_batches(&schema, &aligned)?)
}

/// Window Fetcher: fetches every (variant, month) dataset in the window and combines them.
///
/// Fetch failures are collected, never raised. Invalid variants or months in the context are
/// rejected before anything is fetched.
pub async fn fetch_window<S>(
    source: &S,
    template: &TripDataTemplate,
    context: &WindowContext,
) -> IngestResult<WindowOutcome>
where
    S: DatasetSource + ?Sized,
{
    let months = months_in_window(context.start, context.end);
    let mut plan: Vec<(&str, YearMonth, DatasetHandle)> = Vec::new();
    for variant in &context.variants {
        for month in &months {
            let handle = template.handle(variant, month.year, month.month)?;
            plan.push((variant.as_str(), *month, handle));
        }
    }
    info!(
        "Fetching {} datasets for {} variants over {} months ({} to {})",
        plan.len(),
        context.variants.len(),
        months.len(),
        context.start,
        context.end
    );

    let attempted = plan.len();
    let mut fetched = Vec::new();
    let mut failures = Vec::new();
    for (variant, month, handle) in plan {
        match source.fetch(&handle).await {
            Ok(batch) => {
                info!("Successfully fetched {} data for {}", variant, month);
                fetched.push(tag_variant(&batch, variant)?);
            }
            Err(error) => {
                warn!("Failed to fetch {}: {}", handle, error);
                failures.push(FetchFailure {
                    variant: variant.to_string(),
                    month,
                    url: handle.url().to_string(),
                    error,
                });
            }
        }
    }

    let combined = concat_by_name(&fetched)?;
    let extracted_at = Utc::now();
    let table = if combined.num_columns() == 0 {
        combined
    } else {
        stamp_extracted_at(&combined, extracted_at)?
    };

    info!(
        "Window fetch finished: {} rows from {}/{} datasets, {} failed",
        table.num_rows(),
        attempted - failures.len(),
        attempted,
        failures.len()
    );
    Ok(WindowOutcome {
        table,
        extracted_at,
        attempted,
        failures,
    })
}

/// Appends a window outcome to `table`, creating the table first if it does not exist.
/// Returns the number of rows written; an outcome without columns writes nothing.
pub async fn materialize_window<K>(
    sink: &mut K,
    table: &str,
    outcome: &WindowOutcome,
) -> IngestResult<usize>
where
    K: TableSink + ?Sized,
{
    if outcome.table.num_columns() == 0 {
        info!("Nothing to materialize into '{}'", table);
        return Ok(0);
    }
    sink.create_if_missing(table, outcome.table.schema()).await?;
    sink.append(table, &outcome.table).await?;
    info!("Appended {} rows to '{}'", outcome.num_rows(), table);
    Ok(outcome.num_rows())
}
