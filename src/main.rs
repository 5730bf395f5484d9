//! CLI entry point for the broadband statistics pipeline.
//!
//! Provides subcommands for downloading block shapefiles and M-Lab sample
//! files, loading the FCC Form 477 CSV into an indexed store, and producing
//! per-geography provider and sample aggregates as JSON arrays.

use anyhow::{Context, Result};
use broadband_stats::aggregate::{ProviderAggregator, SampleAggregator};
use broadband_stats::config::{self, Settings};
use broadband_stats::fetch::{BasicClient, FetchQueue, FetchReport, HttpFetcher, resource};
use broadband_stats::geo::{self, Granularity};
use broadband_stats::ingest;
use clap::{Args, Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "broadband_stats")]
#[command(about = "Aggregate broadband availability and measurement data by geography", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download TIGER/Line census block shapefiles for every state
    DownloadBlocks {
        /// TIGER/Line vintage year
        #[arg(long, default_value_t = config::DEFAULT_TIGER_VINTAGE)]
        vintage: u16,

        /// Directory to save the zip archives into
        #[arg(short, long, default_value = config::DEFAULT_BLOCKS_DIR)]
        dir: PathBuf,

        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Download M-Lab daily histogram statistics for every geography
    DownloadSamples {
        /// Geography level: counties or tracts
        #[arg(value_name = "GRANULARITY", default_value = "counties")]
        granularity: Granularity,

        /// Year of statistics to download
        #[arg(long, default_value_t = config::DEFAULT_SAMPLE_YEAR)]
        year: u16,

        /// Directory to save the JSON files into
        #[arg(short, long, default_value = config::DEFAULT_SAMPLES_DIR)]
        dir: PathBuf,

        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Load the provider availability CSV into a new indexed store
    Ingest {
        /// FCC Form 477 fixed broadband deployment CSV
        #[arg(value_name = "CSV")]
        input: PathBuf,

        /// Store to create
        #[arg(long, default_value = config::DEFAULT_STORE)]
        db: PathBuf,

        /// Replace the store if it already exists
        #[arg(long, default_value_t = false)]
        overwrite: bool,

        /// Rows per insert transaction
        #[arg(long, default_value_t = config::DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },
    /// Compute provider counts and mean advertised speeds per geography
    AggregateProviders {
        /// Geography level: county or tract
        #[arg(value_name = "GRANULARITY", default_value = "county")]
        granularity: Granularity,

        /// Store produced by `ingest`
        #[arg(long, default_value = config::DEFAULT_STORE)]
        db: PathBuf,

        /// Output JSON file (default: fcc-<granularity>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum number of concurrent store queries
        #[arg(short, long, default_value_t = config::DEFAULT_PROVIDER_CONCURRENCY)]
        concurrency: usize,
    },
    /// Compute half-yearly speed medians and threshold shares per geography
    AggregateSamples {
        /// Geography level: counties or tracts
        #[arg(value_name = "GRANULARITY", default_value = "counties")]
        granularity: Granularity,

        /// Directory holding the downloaded sample files
        #[arg(short, long, default_value = config::DEFAULT_SAMPLES_DIR)]
        dir: PathBuf,

        /// Output JSON file (default: mlab-<granularity>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum number of files processed at once
        #[arg(short, long, default_value_t = config::DEFAULT_SAMPLE_CONCURRENCY)]
        concurrency: usize,
    },
}

#[derive(Args)]
struct FetchArgs {
    /// Maximum number of concurrent downloads
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Attempts per file before giving up
    #[arg(long, default_value_t = config::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Upper bound on a single download attempt, in seconds
    #[arg(long, default_value_t = config::DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file
    let settings = Settings::from_env();

    // Logging setup: colored stderr + JSON rolling log file
    let log_dir = settings
        .log_file_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"));
    let log_file_name = settings
        .log_file_path
        .file_name()
        .unwrap_or(OsStr::new("broadband_stats.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(env_filter("RUST_LOG", "info")?);

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(env_filter("RUST_LOG_JSON", "debug")?);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let cancel = shutdown_token();

    match cli.command {
        Commands::DownloadBlocks { vintage, dir, fetch } => {
            let policy = fetch.policy(config::DEFAULT_BLOCK_FETCH_CONCURRENCY);
            let resources = resource::block_shapefiles(vintage, &dir);
            info!(vintage, dir = %dir.display(), "Downloading block shapefiles");

            let fetcher = Arc::new(HttpFetcher::new(BasicClient::with_timeout(
                policy.task_timeout,
            )?));
            let report = FetchQueue::new(policy)
                .with_identity_filter(geo::is_state_fips)
                .run(fetcher, resources, cancel)
                .await;
            log_fetch_report(&report);
        }
        Commands::DownloadSamples {
            granularity,
            year,
            dir,
            fetch,
        } => {
            let policy = fetch.policy(config::DEFAULT_SAMPLE_FETCH_CONCURRENCY);
            let client = BasicClient::with_timeout(policy.task_timeout)?;
            let bucket = settings.sample_bucket;

            info!(%granularity, "Finding sample files to download");
            let ids = match bucket
                .list_geographies(&client, granularity, &policy, &cancel)
                .await
            {
                Ok(ids) => ids,
                Err(e) => {
                    error!(
                        error = %format!("{e:#}"),
                        "Unable to list sample files, nothing to download"
                    );
                    Vec::new()
                }
            };
            let resources =
                bucket.sample_files(granularity, year, ids.iter().map(String::as_str), &dir);
            info!(count = resources.len(), "Found files to download, starting now");

            let report = FetchQueue::new(policy)
                .run(Arc::new(HttpFetcher::new(client)), resources, cancel)
                .await;
            log_fetch_report(&report);
        }
        Commands::Ingest {
            input,
            db,
            overwrite,
            batch_size,
        } => {
            let summary = tokio::task::spawn_blocking(move || {
                ingest::ingest_file(&input, &db, batch_size, overwrite)
            })
            .await
            .context("ingestion task")??;
            info!(
                rows_stored = summary.rows_stored,
                rows_rejected = summary.rows_rejected,
                "Ingestion finished"
            );
        }
        Commands::AggregateProviders {
            granularity,
            db,
            output,
            concurrency,
        } => {
            let output = output.unwrap_or_else(|| config::provider_output(granularity));
            let summary = ProviderAggregator::new(&db, granularity, concurrency)
                .run(&output, cancel)
                .await?;
            info!(
                geographies = summary.geographies,
                failed = summary.failed,
                output = %output.display(),
                "Provider aggregates written"
            );
        }
        Commands::AggregateSamples {
            granularity,
            dir,
            output,
            concurrency,
        } => {
            let output = output.unwrap_or_else(|| config::sample_output(granularity));
            let summary = SampleAggregator::new(&dir, granularity, concurrency)
                .run(&output, cancel)
                .await?;
            info!(
                geographies = summary.geographies,
                failed = summary.failed,
                output = %output.display(),
                "Sample aggregates written"
            );
        }
    }

    Ok(())
}

impl FetchArgs {
    fn policy(&self, default_concurrency: usize) -> broadband_stats::fetch::FetchPolicy {
        config::fetch_policy(
            self.concurrency.unwrap_or(default_concurrency),
            self.max_attempts,
            self.timeout_secs,
        )
    }
}

fn env_filter(var: &str, default_directive: &str) -> Result<EnvFilter> {
    Ok(EnvFilter::from_env(var).add_directive(default_directive.parse()?))
}

/// Token cancelled on the first Ctrl-C: no new work starts, in-flight work drains.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted, finishing in-flight work");
                trigger.cancel();
            }
            Err(e) => error!(error = %e, "Unable to listen for Ctrl-C"),
        }
    });
    cancel
}

fn log_fetch_report(report: &FetchReport) {
    for (identity, reason) in &report.failed {
        error!(identity = %identity, reason = %reason, "Download failed permanently");
    }
    if !report.cancelled.is_empty() {
        warn!(count = report.cancelled.len(), "Downloads cancelled before starting");
    }
    info!(
        downloaded = report.done.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        bytes = report.bytes,
        "All done downloading"
    );
}
