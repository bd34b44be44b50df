//! ## In-memory Arrow store
//!
//! [`MemorySink`] keeps every written table as a list of Arrow record batches. It is the
//! local analytic store of the crate: once loaded, tables can be queried with SQL through
//! [`MemorySink::session_context`], which registers each table with DataFusion.

use crate::exceptions::{IngestError, IngestResult};
use crate::sinks::TableSink;
use arrow::compute::concat_batches;
use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use async_trait::async_trait;
use datafusion::datasource::MemTable;
use datafusion::prelude::SessionContext;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredTable {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

/// Destination that stores tables in process memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: BTreeMap<String, StoredTable>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Names of all stored tables, in sorted order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn schema(&self, table: &str) -> Option<SchemaRef> {
        self.tables.get(table).map(|t| t.schema.clone())
    }

    pub fn num_rows(&self, table: &str) -> Option<usize> {
        self.tables
            .get(table)
            .map(|t| t.batches.iter().map(RecordBatch::num_rows).sum())
    }

    /// Returns the full contents of `table` as one batch.
    pub fn table(&self, table: &str) -> IngestResult<RecordBatch> {
        let stored = self
            .tables
            .get(table)
            .ok_or_else(|| IngestError::MissingTable(table.to_string()))?;
        Ok(concat_batches(&stored.schema, &stored.batches)?)
    }

    /// Builds a DataFusion session with every stored table registered under its own name.
    pub fn session_context(&self) -> IngestResult<SessionContext> {
        let ctx = SessionContext::new();
        for (name, stored) in &self.tables {
            let mem_table = MemTable::try_new(stored.schema.clone(), vec![stored.batches.clone()])?;
            ctx.register_table(name.as_str(), Arc::new(mem_table))?;
        }
        Ok(ctx)
    }

    fn store(&mut self, table: &str, schema: SchemaRef, batches: Vec<RecordBatch>) {
        self.tables
            .insert(table.to_string(), StoredTable { schema, batches });
    }
}

/// Checks that `batch` carries the same column names and types as `expected`.
fn check_compatible(table: &str, expected: &Schema, batch: &RecordBatch) -> IngestResult<()> {
    let actual = batch.schema();
    if expected.fields().len() != actual.fields().len() {
        return Err(IngestError::SchemaMismatch(format!(
            "table '{}' has {} columns, batch has {}",
            table,
            expected.fields().len(),
            actual.fields().len()
        )));
    }
    for (want, got) in expected.fields().iter().zip(actual.fields().iter()) {
        if want.name() != got.name() || want.data_type() != got.data_type() {
            return Err(IngestError::SchemaMismatch(format!(
                "table '{}' expects column '{}' ({}), batch has '{}' ({})",
                table,
                want.name(),
                want.data_type(),
                got.name(),
                got.data_type()
            )));
        }
    }
    Ok(())
}

/// Re-labels `batch` with the stored table schema.
fn with_schema(schema: &SchemaRef, batch: &RecordBatch) -> IngestResult<RecordBatch> {
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        schema.clone(),
        batch.columns().to_vec(),
        &options,
    )?)
}

#[async_trait]
impl TableSink for MemorySink {
    async fn create_schema(&mut self, table: &str, schema: SchemaRef) -> IngestResult<()> {
        debug!("Creating empty table '{}' with {} columns", table, schema.fields().len());
        self.store(table, schema, Vec::new());
        Ok(())
    }

    async fn append(&mut self, table: &str, batch: &RecordBatch) -> IngestResult<()> {
        let stored = self
            .tables
            .get_mut(table)
            .ok_or_else(|| IngestError::MissingTable(table.to_string()))?;
        check_compatible(table, &stored.schema, batch)?;
        if batch.num_rows() > 0 {
            let batch = with_schema(&stored.schema, batch)?;
            stored.batches.push(batch);
        }
        debug!("Appended {} rows to '{}'", batch.num_rows(), table);
        Ok(())
    }

    async fn replace(&mut self, table: &str, batch: &RecordBatch) -> IngestResult<()> {
        debug!("Replacing '{}' with {} rows", table, batch.num_rows());
        self.store(table, batch.schema(), vec![batch.clone()]);
        Ok(())
    }

    async fn create_if_missing(&mut self, table: &str, schema: SchemaRef) -> IngestResult<()> {
        if !self.contains(table) {
            self.store(table, schema, Vec::new());
        }
        Ok(())
    }
}
