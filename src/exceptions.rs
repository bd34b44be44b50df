//! ## Custom Errors for Trip Ingest
//!
//! This module defines the error type shared by every loader, source, and sink in the crate.
//! It uses the `thiserror` crate to derive the `Error` trait. Errors raised by the underlying
//! libraries (Arrow, Parquet, DataFusion, HTTP, SQL) are wrapped transparently, while the
//! domain variants describe failures specific to an ingestion run.
//!
//! The `IngestResult` type alias simplifies error handling by providing a convenient
//! alias for results returned by the library.
//!
//! ### Example
//!
//! ```rust
//! use trip_ingest::exceptions::{IngestError, IngestResult};
//!
//! fn check_batch_size(size: usize) -> IngestResult<usize> {
//!     if size == 0 {
//!         return Err(IngestError::InvalidParameter("batch size must be at least 1".into()));
//!     }
//!     Ok(size)
//! }
//! ```

use thiserror::Error;

/// Errors specific to the Trip Ingest library.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Wraps underlying I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Wraps errors from DataFusion.
    #[error("DataFusion error: {0}")]
    DataFusionError(#[from] datafusion::error::DataFusionError),

    /// Wraps errors from Arrow.
    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),

    /// Wraps errors from Parquet.
    #[error("Parquet error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),

    /// Wraps network and HTTP status errors raised while fetching a dataset.
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Wraps errors returned by the destination database.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Wraps errors from decoding JSON pipeline variables.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Indicates that an invalid parameter was provided (e.g., zero batch size or month 13).
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Indicates that the remote data format is unsupported (e.g., unknown file extension).
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Indicates that a required runtime variable is absent from the environment.
    #[error("Missing variable: {0}")]
    MissingVariable(String),

    /// Indicates that an append was issued against a table that was never created.
    #[error("Missing table: {0}")]
    MissingTable(String),

    /// Indicates that a batch does not match the columns of its destination table.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
}

/// A convenient result type for Trip Ingest operations.
pub type IngestResult<T> = std::result::Result<T, IngestError>;
