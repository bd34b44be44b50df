use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trip_ingest::exceptions::IngestResult;
use trip_ingest::loaders::{
    ingest_lookup, ingest_trips, TripLoadRequest, DEFAULT_BATCH_SIZE, DEFAULT_TRIP_VARIANT,
};
use trip_ingest::settings::{ConnectionConfig, WindowContext};
use trip_ingest::sinks::postgres::PostgresSink;
use trip_ingest::source::{
    DatasetHandle, DatasetSource, HttpSource, LocalSource, TripDataTemplate, DEFAULT_TRIP_DATA_URL,
    ZONE_LOOKUP_URL,
};
use trip_ingest::window::{fetch_window, materialize_window};

#[derive(Parser)]
#[command(
    name = "trip-ingest",
    version,
    about = "Load trip-record datasets into PostgreSQL"
)]
struct Cli {
    /// Runs `trips` and then `zones` with their defaults when omitted
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct SourceArgs {
    #[arg(
        long,
        env = "TRIP_DATA_URL",
        default_value = DEFAULT_TRIP_DATA_URL,
        help = "Base URL of the monthly trip files"
    )]
    base_url: String,

    #[arg(long, help = "Read dataset files from this directory instead of the network")]
    data_dir: Option<PathBuf>,
}

impl SourceArgs {
    fn source(&self) -> Box<dyn DatasetSource> {
        match &self.data_dir {
            Some(dir) => Box::new(LocalSource::new(dir)),
            None => Box::new(HttpSource::new()),
        }
    }

    fn template(&self) -> TripDataTemplate {
        TripDataTemplate::new(&self.base_url)
    }
}

impl Default for SourceArgs {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_TRIP_DATA_URL.to_string(),
            data_dir: None,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load one month of trip data in batches
    Trips {
        #[arg(long, default_value = "green_taxi_trips")]
        table: String,

        #[arg(long, default_value = DEFAULT_TRIP_VARIANT)]
        variant: String,

        #[arg(long, default_value_t = 2025)]
        year: i32,

        #[arg(long, default_value_t = 11)]
        month: u32,

        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        #[command(flatten)]
        source: SourceArgs,
    },
    /// Replace the zone lookup table
    Zones {
        #[arg(long, default_value = "zones_lookup")]
        table: String,

        #[arg(long, default_value = ZONE_LOOKUP_URL)]
        url: String,

        #[arg(long, help = "Read the lookup file from this directory instead of the network")]
        data_dir: Option<PathBuf>,
    },
    /// Fetch the BRUIN_START_DATE..BRUIN_END_DATE window for every variant in BRUIN_VARS
    Window {
        #[arg(long, help = "Append the combined result to this table")]
        table: Option<String>,

        #[command(flatten)]
        source: SourceArgs,
    },
}

async fn run_trips(
    config: &ConnectionConfig,
    request: TripLoadRequest,
    source: &SourceArgs,
) -> IngestResult<()> {
    let mut sink = PostgresSink::connect(config).await?;
    ingest_trips(&*source.source(), &mut sink, &source.template(), &request).await?;
    Ok(())
}

async fn run_zones(
    config: &ConnectionConfig,
    table: &str,
    url: &str,
    data_dir: Option<PathBuf>,
) -> IngestResult<()> {
    let handle = DatasetHandle::from_url(url)?;
    let source: Box<dyn DatasetSource> = match data_dir {
        Some(dir) => Box::new(LocalSource::new(dir)),
        None => Box::new(HttpSource::new()),
    };
    let mut sink = PostgresSink::connect(config).await?;
    ingest_lookup(&*source, &mut sink, &handle, table).await?;
    Ok(())
}

async fn run_window(table: Option<String>, source: &SourceArgs) -> IngestResult<()> {
    let context = WindowContext::from_env()?;
    let outcome = fetch_window(&*source.source(), &source.template(), &context).await?;
    for failure in &outcome.failures {
        warn!("Missing {} {}: {}", failure.variant, failure.month, failure.error);
    }
    match table {
        Some(table) => {
            let config = ConnectionConfig::from_env()?;
            let mut sink = PostgresSink::connect(&config).await?;
            materialize_window(&mut sink, &table, &outcome).await?;
        }
        None => info!(
            "Fetched {} rows ({} of {} datasets), extracted at {}",
            outcome.num_rows(),
            outcome.succeeded(),
            outcome.attempted,
            outcome.extracted_at
        ),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> IngestResult<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Trips {
            table,
            variant,
            year,
            month,
            batch_size,
            source,
        }) => {
            let config = ConnectionConfig::from_env()?;
            let request = TripLoadRequest::new(table, year, month)
                .with_variant(variant)
                .with_batch_size(batch_size);
            run_trips(&config, request, &source).await?;
        }
        Some(Commands::Zones {
            table,
            url,
            data_dir,
        }) => {
            let config = ConnectionConfig::from_env()?;
            run_zones(&config, &table, &url, data_dir).await?;
        }
        Some(Commands::Window { table, source }) => {
            run_window(table, &source).await?;
        }
        None => {
            let config = ConnectionConfig::from_env()?;
            let request = TripLoadRequest::new("green_taxi_trips", 2025, 11);
            run_trips(&config, request, &SourceArgs::default()).await?;
            run_zones(&config, "zones_lookup", ZONE_LOOKUP_URL, None).await?;
        }
    }

    Ok(())
}
