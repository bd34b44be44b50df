//! ## PostgreSQL destination
//!
//! [`PostgresSink`] writes Arrow record batches to PostgreSQL tables through `sqlx`.
//!
//! Column types are derived from the Arrow schema (see [`pg_column_type`]); decimals keep their
//! precision and scale as `NUMERIC`, and types without a direct PostgreSQL counterpart are
//! stored as `TEXT`. Rows are sent as multi-row `INSERT` statements (see [`insert_statements`]),
//! each one kept under PostgreSQL's limit of 65 535 bind parameters.
//!
//! Each `create_schema`, `append`, and `replace` call runs in its own transaction, so a failed
//! append leaves earlier appends in place.

use crate::exceptions::IngestResult;
use crate::settings::ConnectionConfig;
use crate::sinks::TableSink;
use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Date32Array, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{
    DataType, Date32Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Schema,
    SchemaRef, TimeUnit, TimestampMicrosecondType,
};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

/// Upper bound on bind parameters in one PostgreSQL statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Quotes an SQL identifier, doubling any embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Maps an Arrow type to the Arrow type values are bound as and the PostgreSQL column type.
///
/// Decimals are bound as their text rendering and cast to `NUMERIC` in the statement.
pub fn pg_column_type(data_type: &DataType) -> (DataType, String) {
    let (bound, sql) = match data_type {
        DataType::Boolean => (DataType::Boolean, "BOOLEAN"),
        DataType::Int8 | DataType::Int16 | DataType::UInt8 => (DataType::Int16, "SMALLINT"),
        DataType::Int32 | DataType::UInt16 => (DataType::Int32, "INTEGER"),
        DataType::Int64 | DataType::UInt32 => (DataType::Int64, "BIGINT"),
        DataType::Float16 | DataType::Float32 => (DataType::Float32, "REAL"),
        DataType::Float64 => (DataType::Float64, "DOUBLE PRECISION"),
        DataType::Date32 | DataType::Date64 => (DataType::Date32, "DATE"),
        DataType::Decimal128(precision, scale) | DataType::Decimal256(precision, scale) => {
            return (
                DataType::Utf8,
                format!("NUMERIC({}, {})", precision, scale),
            );
        }
        DataType::Timestamp(_, None) => (
            DataType::Timestamp(TimeUnit::Microsecond, None),
            "TIMESTAMP",
        ),
        DataType::Timestamp(_, Some(tz)) => (
            DataType::Timestamp(TimeUnit::Microsecond, Some(tz.clone())),
            "TIMESTAMPTZ",
        ),
        _ => (DataType::Utf8, "TEXT"),
    };
    (bound, sql.to_string())
}

/// Builds a `CREATE TABLE` statement for `schema`.
pub fn create_table_sql(table: &str, schema: &Schema, if_not_exists: bool) -> String {
    let columns = schema
        .fields()
        .iter()
        .map(|f| format!("{} {}", quote_ident(f.name()), pg_column_type(f.data_type()).1))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE {}{} ({})",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        quote_ident(table),
        columns
    )
}

/// Number of rows that fit in one `INSERT` for a table with `num_columns` columns.
pub fn rows_per_statement(num_columns: usize) -> usize {
    (MAX_BIND_PARAMS / num_columns.max(1)).max(1)
}

/// A column cast to one of the types `sqlx` binds directly.
enum BindColumn {
    Boolean(BooleanArray),
    Int16(Int16Array),
    Int32(Int32Array),
    Int64(Int64Array),
    Float32(Float32Array),
    Float64(Float64Array),
    Date(Date32Array),
    Timestamp(TimestampMicrosecondArray),
    TimestampTz(TimestampMicrosecondArray),
    Numeric(StringArray),
    Text(StringArray),
}

fn date_value(array: &Date32Array, row: usize) -> Option<NaiveDate> {
    array.is_valid(row).then(|| array.value_as_date(row)).flatten()
}

fn timestamp_value(array: &TimestampMicrosecondArray, row: usize) -> Option<NaiveDateTime> {
    array.is_valid(row).then(|| array.value_as_datetime(row)).flatten()
}

/// Timezone-aware values are stored as UTC instants; the Arrow values are already UTC.
fn timestamptz_value(array: &TimestampMicrosecondArray, row: usize) -> Option<DateTime<Utc>> {
    timestamp_value(array, row).map(|ts| ts.and_utc())
}

fn text_value(array: &StringArray, row: usize) -> Option<String> {
    array.is_valid(row).then(|| array.value(row).to_string())
}

impl BindColumn {
    fn try_new(array: &ArrayRef) -> IngestResult<Self> {
        let (target, _) = pg_column_type(array.data_type());
        if matches!(
            array.data_type(),
            DataType::Decimal128(..) | DataType::Decimal256(..)
        ) {
            return Ok(BindColumn::Numeric(
                cast(array, &DataType::Utf8)?.as_string::<i32>().clone(),
            ));
        }
        let array = if array.data_type() == &target {
            array.clone()
        } else {
            cast(array, &target)?
        };
        Ok(match &target {
            DataType::Boolean => BindColumn::Boolean(array.as_boolean().clone()),
            DataType::Int16 => BindColumn::Int16(array.as_primitive::<Int16Type>().clone()),
            DataType::Int32 => BindColumn::Int32(array.as_primitive::<Int32Type>().clone()),
            DataType::Int64 => BindColumn::Int64(array.as_primitive::<Int64Type>().clone()),
            DataType::Float32 => BindColumn::Float32(array.as_primitive::<Float32Type>().clone()),
            DataType::Float64 => BindColumn::Float64(array.as_primitive::<Float64Type>().clone()),
            DataType::Date32 => BindColumn::Date(array.as_primitive::<Date32Type>().clone()),
            DataType::Timestamp(_, None) => {
                BindColumn::Timestamp(array.as_primitive::<TimestampMicrosecondType>().clone())
            }
            DataType::Timestamp(_, Some(_)) => {
                BindColumn::TimestampTz(array.as_primitive::<TimestampMicrosecondType>().clone())
            }
            _ => BindColumn::Text(array.as_string::<i32>().clone()),
        })
    }

    fn push_bind(&self, row_sep: &mut Separated<'_, '_, Postgres, &'static str>, row: usize) {
        match self {
            BindColumn::Boolean(a) => row_sep.push_bind(a.is_valid(row).then(|| a.value(row))),
            BindColumn::Int16(a) => row_sep.push_bind(a.is_valid(row).then(|| a.value(row))),
            BindColumn::Int32(a) => row_sep.push_bind(a.is_valid(row).then(|| a.value(row))),
            BindColumn::Int64(a) => row_sep.push_bind(a.is_valid(row).then(|| a.value(row))),
            BindColumn::Float32(a) => row_sep.push_bind(a.is_valid(row).then(|| a.value(row))),
            BindColumn::Float64(a) => row_sep.push_bind(a.is_valid(row).then(|| a.value(row))),
            BindColumn::Date(a) => row_sep.push_bind(date_value(a, row)),
            BindColumn::Timestamp(a) => row_sep.push_bind(timestamp_value(a, row)),
            BindColumn::TimestampTz(a) => row_sep.push_bind(timestamptz_value(a, row)),
            BindColumn::Numeric(a) => row_sep
                .push_bind(text_value(a, row))
                .push_unseparated("::NUMERIC"),
            BindColumn::Text(a) => row_sep.push_bind(text_value(a, row)),
        };
    }
}

fn build_inserts(
    table: &str,
    batch: &RecordBatch,
    rows_per_chunk: usize,
) -> IngestResult<Vec<QueryBuilder<'static, Postgres>>> {
    if batch.num_rows() == 0 || batch.num_columns() == 0 {
        return Ok(Vec::new());
    }
    let columns = batch
        .columns()
        .iter()
        .map(BindColumn::try_new)
        .collect::<IngestResult<Vec<_>>>()?;
    let column_list = batch
        .schema()
        .fields()
        .iter()
        .map(|f| quote_ident(f.name()))
        .collect::<Vec<_>>()
        .join(", ");
    let chunk = rows_per_chunk.max(1);

    let mut statements = Vec::with_capacity(batch.num_rows().div_ceil(chunk));
    let mut start = 0;
    while start < batch.num_rows() {
        let end = (start + chunk).min(batch.num_rows());
        let mut query: QueryBuilder<'static, Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            quote_ident(table),
            column_list
        ));
        query.push_values(start..end, |mut row_sep, row| {
            for column in &columns {
                column.push_bind(&mut row_sep, row);
            }
        });
        statements.push(query);
        start = end;
    }
    Ok(statements)
}

/// Builds the multi-row `INSERT` statements for `batch`, in row order.
///
/// Each statement carries at most [`rows_per_statement`] rows. An empty batch yields none.
pub fn insert_statements(
    table: &str,
    batch: &RecordBatch,
) -> IngestResult<Vec<QueryBuilder<'static, Postgres>>> {
    build_inserts(table, batch, rows_per_statement(batch.num_columns()))
}

/// Inserts every row of `batch` into `table` over `conn`.
async fn insert_batch(
    conn: &mut PgConnection,
    table: &str,
    batch: &RecordBatch,
) -> IngestResult<()> {
    for mut query in insert_statements(table, batch)? {
        query.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Destination backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    /// Opens a pool for the given connection parameters.
    pub async fn connect(config: &ConnectionConfig) -> IngestResult<Self> {
        info!(
            "Connecting to postgres at {}:{}/{}",
            config.host, config.port, config.database
        );
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&config.url())
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TableSink for PostgresSink {
    async fn create_schema(&mut self, table: &str, schema: SchemaRef) -> IngestResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&create_table_sql(table, &schema, false))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!("Created table '{}'", table);
        Ok(())
    }

    async fn append(&mut self, table: &str, batch: &RecordBatch) -> IngestResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_batch(&mut *tx, table, batch).await?;
        tx.commit().await?;
        debug!("Appended {} rows to '{}'", batch.num_rows(), table);
        Ok(())
    }

    async fn replace(&mut self, table: &str, batch: &RecordBatch) -> IngestResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&create_table_sql(table, &batch.schema(), false))
            .execute(&mut *tx)
            .await?;
        insert_batch(&mut *tx, table, batch).await?;
        tx.commit().await?;
        debug!("Replaced '{}' with {} rows", table, batch.num_rows());
        Ok(())
    }

    async fn create_if_missing(&mut self, table: &str, schema: SchemaRef) -> IngestResult<()> {
        sqlx::query(&create_table_sql(table, &schema, true))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
