//! # Trip Ingest
//!
//! Bulk loaders for public trip-record datasets published as monthly Parquet files, plus the
//! CSV zone lookup that goes with them.
//!
//! - [`loaders::ingest_trips`] loads one month of trips in fixed-size batches.
//! - [`loaders::ingest_lookup`] replaces a reference table in a single write.
//! - [`window::fetch_window`] fetches many months and variants for a pipeline scheduler
//!   and returns one combined, stamped table.
//!
//! Data is read through a [`source::DatasetSource`] and written through a
//! [`sinks::TableSink`] (PostgreSQL or the in-memory Arrow store).

pub mod exceptions;
pub mod loaders;
pub mod logging;
pub mod settings;
pub mod sinks;
pub mod source;
pub mod window;
