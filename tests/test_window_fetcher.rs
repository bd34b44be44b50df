use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use arrow::array::{Array, AsArray, Float64Array, NullArray, StringArray};
use arrow::datatypes::{DataType, Field, Float64Type, Schema, TimestampMicrosecondType};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::NaiveDate;

use trip_ingest::exceptions::{IngestError, IngestResult};
use trip_ingest::settings::WindowContext;
use trip_ingest::sinks::memory::MemorySink;
use trip_ingest::source::{DatasetHandle, DatasetSource, TripDataTemplate};
use trip_ingest::window::{
    fetch_window, materialize_window, YearMonth, EXTRACTED_AT_COLUMN, VARIANT_COLUMN,
};

/// A monthly file with `rows` rows; `period` records which file the row came from.
fn monthly(pickup_column: &str, period: &str, rows: usize) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("period", DataType::Utf8, false),
        Field::new(pickup_column, DataType::Utf8, true),
        Field::new("fare_amount", DataType::Float64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(vec![period; rows])),
            Arc::new(StringArray::from(vec!["2023-01-01 00:00:00"; rows])),
            Arc::new(Float64Array::from(vec![10.0; rows])),
        ],
    )
    .unwrap()
}

/// Serves every `{variant}_tripdata_{year}-{month}.parquet` file except the missing ones.
struct WindowSource {
    files: HashMap<String, RecordBatch>,
    fetched: Mutex<Vec<String>>,
}

impl WindowSource {
    fn new(variants: &[&str], months: &[&str], missing: &[&str], rows: usize) -> Self {
        let mut files = HashMap::new();
        for variant in variants {
            let pickup = if *variant == "yellow" {
                "tpep_pickup_datetime"
            } else {
                "lpep_pickup_datetime"
            };
            for month in months {
                let name = format!("{}_tripdata_{}.parquet", variant, month);
                if !missing.contains(&name.as_str()) {
                    let period = format!("{}/{}", variant, month);
                    files.insert(name, monthly(pickup, &period, rows));
                }
            }
        }
        Self {
            files,
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// Serves `batch` under `name`, replacing any generated file.
    fn with_file(mut self, name: &str, batch: RecordBatch) -> Self {
        self.files.insert(name.to_string(), batch);
        self
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatasetSource for WindowSource {
    async fn fetch(&self, handle: &DatasetHandle) -> IngestResult<RecordBatch> {
        self.fetched.lock().unwrap().push(handle.file_name().to_string());
        self.files
            .get(handle.file_name())
            .cloned()
            .ok_or_else(|| IngestError::InvalidParameter(format!("403 Forbidden: {}", handle)))
    }
}

fn context(start: &str, end: &str, vars: &str) -> WindowContext {
    WindowContext::from_vars(start, end, Some(vars)).unwrap()
}

fn column_strings(batch: &RecordBatch, name: &str) -> Vec<String> {
    batch
        .column(batch.schema().index_of(name).unwrap())
        .as_string::<i32>()
        .iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_window_skips_failed_month() -> IngestResult<()> {
    // Two variants over three months, with green February missing upstream.
    let source = WindowSource::new(
        &["yellow", "green"],
        &["2023-01", "2023-02", "2023-03"],
        &["green_tripdata_2023-02.parquet"],
        4,
    );
    let ctx = context("2023-01-01", "2023-03-01", r#"{"taxi_types": ["yellow", "green"]}"#);

    let outcome = fetch_window(&source, &TripDataTemplate::default(), &ctx).await?;

    // Every pair is attempted, variant-major, including the one after the failure.
    assert_eq!(
        source.fetched(),
        vec![
            "yellow_tripdata_2023-01.parquet",
            "yellow_tripdata_2023-02.parquet",
            "yellow_tripdata_2023-03.parquet",
            "green_tripdata_2023-01.parquet",
            "green_tripdata_2023-02.parquet",
            "green_tripdata_2023-03.parquet",
        ]
    );
    assert_eq!(outcome.attempted, 6);
    assert_eq!(outcome.succeeded(), 5);
    assert_eq!(outcome.failures.len(), 1);
    let failure = &outcome.failures[0];
    assert_eq!(failure.variant, "green");
    assert_eq!(failure.month, YearMonth { year: 2023, month: 2 });
    assert!(failure.url.ends_with("green_tripdata_2023-02.parquet"));

    // Five files of four rows, concatenated in fetch order.
    assert_eq!(outcome.num_rows(), 20);
    let mut expected_periods = Vec::new();
    for period in [
        "yellow/2023-01",
        "yellow/2023-02",
        "yellow/2023-03",
        "green/2023-01",
        "green/2023-03",
    ] {
        expected_periods.extend(std::iter::repeat(period.to_string()).take(4));
    }
    assert_eq!(column_strings(&outcome.table, "period"), expected_periods);
    Ok(())
}

#[tokio::test]
async fn test_window_labels_and_stamps_every_row() -> IngestResult<()> {
    let source = WindowSource::new(&["yellow", "green"], &["2023-05", "2023-06"], &[], 3);
    let ctx = context("2023-05-20", "2023-06-02", r#"{"taxi_types": ["yellow", "green"]}"#);

    let outcome = fetch_window(&source, &TripDataTemplate::default(), &ctx).await?;
    let table = &outcome.table;
    assert_eq!(table.num_rows(), 12);

    // Each row carries the variant it was fetched for.
    let requested: HashSet<&str> = ["yellow", "green"].into_iter().collect();
    let variants = column_strings(table, VARIANT_COLUMN);
    assert!(variants.iter().all(|v| requested.contains(v.as_str())));
    assert_eq!(variants.iter().filter(|v| *v == "green").count(), 6);

    // One extraction time is shared by every row.
    let stamps = table
        .column(table.schema().index_of(EXTRACTED_AT_COLUMN).unwrap())
        .as_primitive::<TimestampMicrosecondType>();
    assert_eq!(stamps.null_count(), 0);
    assert!(stamps
        .values()
        .iter()
        .all(|v| *v == outcome.extracted_at.timestamp_micros()));
    Ok(())
}

#[tokio::test]
async fn test_window_unions_differing_columns() -> IngestResult<()> {
    // Yellow files use `tpep_*` pickup columns and green files use `lpep_*`.
    let source = WindowSource::new(&["yellow", "green"], &["2024-01"], &[], 2);
    let ctx = context("2024-01-01", "2024-01-31", r#"{"taxi_types": ["yellow", "green"]}"#);

    let outcome = fetch_window(&source, &TripDataTemplate::default(), &ctx).await?;
    let table = &outcome.table;
    let schema = table.schema();
    let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(
        names,
        vec![
            "period",
            "tpep_pickup_datetime",
            "fare_amount",
            VARIANT_COLUMN,
            "lpep_pickup_datetime",
            EXTRACTED_AT_COLUMN,
        ]
    );
    // Yellow rows come first, so the green pickup column is null for them and vice versa.
    let tpep = table.column(1);
    let lpep = table.column(4);
    assert_eq!(tpep.null_count(), 2);
    assert_eq!(lpep.null_count(), 2);
    assert!(tpep.is_valid(0) && lpep.is_null(0));
    assert!(tpep.is_null(3) && lpep.is_valid(3));
    Ok(())
}

#[tokio::test]
async fn test_window_all_failures_is_empty() -> IngestResult<()> {
    // The source serves nothing, so all twelve months fail.
    let source = WindowSource::new(&[], &[], &[], 0);
    let ctx = context("2023-01-01", "2023-12-31", r#"{"taxi_types": ["fhv"]}"#);

    let outcome = fetch_window(&source, &TripDataTemplate::default(), &ctx).await?;

    assert_eq!(outcome.attempted, 12);
    assert_eq!(outcome.failures.len(), 12);
    assert_eq!(outcome.num_rows(), 0);
    assert_eq!(outcome.table.num_columns(), 0);
    Ok(())
}

#[tokio::test]
async fn test_window_defaults_to_yellow() -> IngestResult<()> {
    let source = WindowSource::new(&["yellow"], &["2022-12"], &[], 1);
    // No BRUIN_VARS payload at all.
    let ctx = WindowContext::from_vars("2022-12-01", "2022-12-31", None)?;

    let outcome = fetch_window(&source, &TripDataTemplate::default(), &ctx).await?;

    assert_eq!(source.fetched(), vec!["yellow_tripdata_2022-12.parquet"]);
    assert_eq!(column_strings(&outcome.table, VARIANT_COLUMN), vec!["yellow"]);
    Ok(())
}

#[tokio::test]
async fn test_window_rejects_bad_variant_before_fetching() {
    let source = WindowSource::new(&[], &[], &[], 0);
    let ctx = context("2023-01-01", "2023-02-01", r#"{"taxi_types": ["yellow", ""]}"#);

    let result = fetch_window(&source, &TripDataTemplate::default(), &ctx).await;

    assert!(matches!(result, Err(IngestError::InvalidParameter(_))));
    assert!(source.fetched().is_empty());
}

#[tokio::test]
async fn test_window_end_before_start_fetches_nothing() -> IngestResult<()> {
    let source = WindowSource::new(&["yellow"], &["2023-01"], &[], 1);
    let ctx = WindowContext {
        start: NaiveDate::from_ymd_opt(2023, 3, 1).unwrap(),
        end: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
        variants: vec!["yellow".to_string()],
    };

    let outcome = fetch_window(&source, &TripDataTemplate::default(), &ctx).await?;

    assert_eq!(outcome.attempted, 0);
    assert!(source.fetched().is_empty());
    assert_eq!(outcome.num_rows(), 0);
    Ok(())
}

#[tokio::test]
async fn test_materialize_appends_each_run() -> IngestResult<()> {
    let source = WindowSource::new(&["green"], &["2023-01", "2023-02"], &[], 5);
    let ctx = context("2023-01-01", "2023-02-28", r#"{"taxi_types": ["green"]}"#);
    let template = TripDataTemplate::default();
    let mut sink = MemorySink::new();

    // Two runs over the same window append twice; nothing is deduplicated.
    let first = fetch_window(&source, &template, &ctx).await?;
    assert_eq!(materialize_window(&mut sink, "ingestion_trips", &first).await?, 10);
    let second = fetch_window(&source, &template, &ctx).await?;
    assert_eq!(materialize_window(&mut sink, "ingestion_trips", &second).await?, 10);

    assert_eq!(sink.num_rows("ingestion_trips"), Some(20));
    Ok(())
}

#[tokio::test]
async fn test_materialize_skips_empty_outcome() -> IngestResult<()> {
    let source = WindowSource::new(&[], &[], &[], 0);
    let ctx = context("2023-01-01", "2023-01-31", r#"{"taxi_types": ["yellow"]}"#);
    let outcome = fetch_window(&source, &TripDataTemplate::default(), &ctx).await?;
    let mut sink = MemorySink::new();

    assert_eq!(materialize_window(&mut sink, "ingestion_trips", &outcome).await?, 0);
    assert!(!sink.contains("ingestion_trips"));
    Ok(())
}

#[tokio::test]
async fn test_window_tolerates_all_null_column() -> IngestResult<()> {
    // January has no e-hail fees at all, so Parquet decodes the column as `Null`.
    let january = RecordBatch::try_new(
        Arc::new(Schema::new(vec![
            Field::new("period", DataType::Utf8, false),
            Field::new("ehail_fee", DataType::Null, true),
        ])),
        vec![
            Arc::new(StringArray::from(vec!["green/2023-01"; 2])),
            Arc::new(NullArray::new(2)),
        ],
    )
    .unwrap();
    let february = RecordBatch::try_new(
        Arc::new(Schema::new(vec![
            Field::new("period", DataType::Utf8, false),
            Field::new("ehail_fee", DataType::Float64, true),
        ])),
        vec![
            Arc::new(StringArray::from(vec!["green/2023-02"; 2])),
            Arc::new(Float64Array::from(vec![1.25, 3.5])),
        ],
    )
    .unwrap();
    let source = WindowSource::new(&[], &[], &[], 0)
        .with_file("green_tripdata_2023-01.parquet", january)
        .with_file("green_tripdata_2023-02.parquet", february);
    let ctx = context("2023-01-01", "2023-02-28", r#"{"taxi_types": ["green"]}"#);

    let outcome = fetch_window(&source, &TripDataTemplate::default(), &ctx).await?;

    // Both months are kept and the fee column takes February's type.
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.num_rows(), 4);
    let table = &outcome.table;
    let fees = table
        .column(table.schema().index_of("ehail_fee").unwrap())
        .as_primitive::<Float64Type>();
    assert_eq!(fees.null_count(), 2);
    assert_eq!(fees.value(2), 1.25);
    assert_eq!(fees.value(3), 3.5);
    Ok(())
}
