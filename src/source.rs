//! ## Dataset Sources
//!
//! This module resolves remote trip-record datasets and reads them fully into memory.
//!
//! - [`DatasetHandle`] identifies one remote file (URL plus format); [`TripDataTemplate`]
//!   builds handles from the `{base}/{variant}_tripdata_{year}-{month:02}.parquet` pattern.
//! - The [`DatasetSource`] trait is the seam between the loaders and the place data comes from.
//!   [`HttpSource`] fetches over HTTP(S); [`LocalSource`] reads the same file names from a
//!   local directory.
//! - [`read_parquet`] and [`read_csv`] decode a whole file into a single `RecordBatch`.

use crate::exceptions::{IngestError, IngestResult};
use arrow::compute::concat_batches;
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::record_batch::{RecordBatch, RecordBatchReader};
use async_trait::async_trait;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::reader::ChunkReader;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Host serving the monthly trip-record Parquet snapshots.
pub const DEFAULT_TRIP_DATA_URL: &str = "https://d37ci6vzurychx.cloudfront.net/trip-data";

/// Taxi zone reference table.
pub const ZONE_LOOKUP_URL: &str =
    "https://github.com/DataTalksClub/nyc-tlc-data/releases/download/misc/taxi_zone_lookup.csv";

/// File formats a dataset can be served in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Parquet,
    Csv,
}

impl DataFormat {
    /// Infers the format from the extension of a URL or path.
    pub fn from_location(location: &str) -> IngestResult<Self> {
        let name = location
            .split(['?', '#'])
            .next()
            .unwrap_or(location)
            .to_ascii_lowercase();
        if name.ends_with(".parquet") {
            Ok(DataFormat::Parquet)
        } else if name.ends_with(".csv") {
            Ok(DataFormat::Csv)
        } else {
            Err(IngestError::UnsupportedFormat(format!(
                "cannot infer data format of '{}'",
                location
            )))
        }
    }
}

/// An immutable reference to one remote dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetHandle {
    url: String,
    format: DataFormat,
}

impl DatasetHandle {
    /// Handle for a fixed location, with the format taken from its extension.
    pub fn from_url(url: impl Into<String>) -> IngestResult<Self> {
        let url = url.into();
        let format = DataFormat::from_location(&url)?;
        Ok(Self { url, format })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    /// Last path segment of the URL, e.g. `green_tripdata_2025-11.parquet`.
    pub fn file_name(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        path.rsplit('/').next().unwrap_or(path)
    }
}

impl fmt::Display for DatasetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Builds monthly trip-data handles from a base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripDataTemplate {
    base_url: String,
}

impl Default for TripDataTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_TRIP_DATA_URL)
    }
}

impl TripDataTemplate {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Handle for `{base}/{variant}_tripdata_{year}-{month:02}.parquet`.
    pub fn handle(&self, variant: &str, year: i32, month: u32) -> IngestResult<DatasetHandle> {
        if !(1..=12).contains(&month) {
            return Err(IngestError::InvalidParameter(format!(
                "month must be between 1 and 12, got {}",
                month
            )));
        }
        if variant.is_empty() || variant.contains('/') {
            return Err(IngestError::InvalidParameter(format!(
                "invalid dataset variant '{}'",
                variant
            )));
        }
        Ok(DatasetHandle {
            url: format!(
                "{}/{}_tripdata_{}-{:02}.parquet",
                self.base_url, variant, year, month
            ),
            format: DataFormat::Parquet,
        })
    }
}

/// Reads an entire Parquet file into one batch.
pub fn read_parquet<R>(reader: R) -> IngestResult<RecordBatch>
where
    R: ChunkReader + 'static,
{
    let reader = ParquetRecordBatchReaderBuilder::try_new(reader)?.build()?;
    let schema = reader.schema();
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    Ok(concat_batches(&schema, &batches)?)
}

/// Reads an entire CSV file (with a header row) into one batch.
/// Column types are inferred from the whole file.
pub fn read_csv(data: &[u8]) -> IngestResult<RecordBatch> {
    let format = Format::default().with_header(true);
    let (schema, _) = format.infer_schema(Cursor::new(data), None)?;
    let schema = Arc::new(schema);
    let reader = ReaderBuilder::new(schema.clone())
        .with_format(format)
        .build(Cursor::new(data))?;
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    Ok(concat_batches(&schema, &batches)?)
}

/// Anything that can produce the full contents of a dataset.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Fetches the whole dataset behind `handle` into memory.
    async fn fetch(&self, handle: &DatasetHandle) -> IngestResult<RecordBatch>;
}

/// Fetches datasets with plain HTTP(S) GET requests.
#[derive(Debug, Clone, Default)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DatasetSource for HttpSource {
    async fn fetch(&self, handle: &DatasetHandle) -> IngestResult<RecordBatch> {
        info!("Fetching {}", handle);
        let body = self
            .client
            .get(handle.url())
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        debug!("Downloaded {} bytes from {}", body.len(), handle);

        let batch = match handle.format() {
            DataFormat::Parquet => read_parquet(body)?,
            DataFormat::Csv => read_csv(&body)?,
        };
        debug!("Decoded {} rows from {}", batch.num_rows(), handle);
        Ok(batch)
    }
}

/// Serves datasets from a local directory, looking each handle up by its file name.
#[derive(Debug, Clone)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path a handle resolves to.
    pub fn path_for(&self, handle: &DatasetHandle) -> PathBuf {
        self.root.join(handle.file_name())
    }
}

#[async_trait]
impl DatasetSource for LocalSource {
    async fn fetch(&self, handle: &DatasetHandle) -> IngestResult<RecordBatch> {
        let path = self.path_for(handle);
        debug!("Reading {} for {}", path.display(), handle);
        match handle.format() {
            DataFormat::Parquet => read_parquet(std::fs::File::open(&path)?),
            DataFormat::Csv => read_csv(&std::fs::read(&path)?),
        }
    }
}
