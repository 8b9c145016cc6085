//! CLI entry point for the subway feed ingester.
//!
//! Provides subcommands for listing line groups, reading live snapshots,
//! checking feed health, and reconciling feeds into the database once or on
//! an interval.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use subway_feed::config::{DEFAULT_LINE_GROUP, Settings};
use subway_feed::fetch::{BasicClient, load_source};
use subway_feed::output::{append_record, print_json, print_pretty};
use subway_feed::parser::parse_feed;
use subway_feed::store::{FeedUpdateRecord, MemoryStore, SqliteStore, Store};
use subway_feed::{FeedKind, IngestError, Ingestor, Reconciler, StopTimePolicy, normalize_feed};
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "subway_feed")]
#[command(about = "Ingest GTFS-realtime subway feeds into per-trip state", long_about = None)]
struct Cli {
    /// Database to reconcile into (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// How an empty stop-time list is interpreted (overrides STOP_TIME_POLICY)
    #[arg(long, global = true, value_enum)]
    stop_time_policy: Option<StopTimePolicy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured line groups and their feed URLs
    Lines,
    /// Fetch a line group's current feed and print it as JSON
    Feed {
        #[arg(value_name = "LINE_GROUP")]
        line_group: String,

        /// Which part of the snapshot to print
        #[arg(short, long, value_enum, default_value_t = FeedKind::All)]
        kind: FeedKind,
    },
    /// Report whether a line group's feed is currently usable
    Status {
        #[arg(value_name = "LINE_GROUP", default_value = DEFAULT_LINE_GROUP)]
        line_group: String,
    },
    /// Decode a feed from a file or URL and print its summary
    Inspect {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,
    },
    /// Run one reconciliation pass (all line groups if none are given)
    Ingest {
        #[arg(value_name = "LINE_GROUP")]
        line_groups: Vec<String>,

        /// Maximum number of line groups ingested at once
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,

        /// CSV file to append feed-update summaries to
        #[arg(long)]
        summary_csv: Option<String>,
    },
    /// Ingest all line groups repeatedly
    Poll {
        /// Seconds between rounds
        #[arg(short = 'r', long, default_value_t = 30)]
        interval_secs: u64,

        /// Number of rounds to run (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 0)]
        iterations: usize,

        /// Maximum number of line groups ingested at once
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,

        /// CSV file to append feed-update summaries to
        #[arg(long)]
        summary_csv: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/subway_feed.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("subway_feed.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::from_env()?;
    if let Some(url) = cli.database_url {
        settings.database_url = url;
    }
    if let Some(policy) = cli.stop_time_policy {
        settings.stop_time_policy = policy;
    }

    match cli.command {
        Commands::Lines => {
            for (line_group, url) in settings.line_groups()?.iter() {
                println!("{line_group}\t{url}");
            }
        }
        Commands::Feed { line_group, kind } => {
            // Read-through only; nothing is written.
            let ingestor = build_ingestor(&settings, Arc::new(MemoryStore::new()))?;
            let snapshot = ingestor
                .snapshot(&line_group)
                .await
                .map_err(|e| report(&e))?;
            print_json(&snapshot.view(kind))?;
        }
        Commands::Status { line_group } => {
            let ingestor = build_ingestor(&settings, Arc::new(MemoryStore::new()))?;
            let status = ingestor
                .check_status(&line_group)
                .await
                .map_err(|e| report(&e))?;
            print_json(&status)?;
        }
        Commands::Inspect { source } => {
            let client = BasicClient::with_timeout(settings.fetch_timeout)?;
            let bytes = load_source(&client, &source).await?;
            let feed = parse_feed(&bytes)?;
            let snapshot = normalize_feed(&feed);
            print_pretty(&snapshot.header);

            print_json(&serde_json::json!({
                "source": source,
                "header": snapshot.header,
                "summary": snapshot.summary,
            }))?;
        }
        Commands::Ingest {
            line_groups,
            concurrency,
            summary_csv,
        } => {
            let store = SqliteStore::connect(&settings.database_url).await?;
            let ingestor = Arc::new(build_ingestor(&settings, Arc::new(store))?);

            let results = if line_groups.is_empty() {
                ingestor.ingest_all(concurrency).await
            } else {
                let mut results = Vec::with_capacity(line_groups.len());
                for line_group in line_groups {
                    let result = ingestor.ingest(&line_group).await;
                    results.push((line_group, result));
                }
                results
            };

            let failed = record_results(&results, summary_csv.as_deref());
            if failed > 0 {
                bail!("{failed} of {} line groups failed to ingest", results.len());
            }
        }
        Commands::Poll {
            interval_secs,
            iterations,
            concurrency,
            summary_csv,
        } => {
            let store = SqliteStore::connect(&settings.database_url).await?;
            let ingestor = Arc::new(build_ingestor(&settings, Arc::new(store))?);
            poll(&ingestor, interval_secs, iterations, concurrency, summary_csv.as_deref()).await?;
        }
    }

    Ok(())
}

fn build_ingestor<S: Store + 'static>(
    settings: &Settings,
    store: Arc<S>,
) -> Result<Ingestor<BasicClient, S>> {
    let client = BasicClient::with_timeout(settings.fetch_timeout)
        .context("failed to build HTTP client")?;
    let line_groups = settings.line_groups()?;

    Ok(Ingestor::new(
        client,
        store,
        line_groups,
        Reconciler::new(settings.stop_time_policy),
    )
    .with_reconcile_timeout(settings.reconcile_timeout))
}

/// Logs the detailed error and hands back the user-facing message.
fn report(e: &IngestError) -> anyhow::Error {
    error!(error = %e, retryable = e.is_retryable(), "Request failed");
    anyhow::anyhow!(e.public_message())
}

/// Appends successful runs to the CSV file and returns the number of failures.
fn record_results(
    results: &[(String, Result<FeedUpdateRecord, IngestError>)],
    summary_csv: Option<&str>,
) -> usize {
    let mut failed = 0;
    for (line_group, result) in results {
        match result {
            Ok(record) => {
                info!(
                    line_group = %line_group,
                    feed_update = record.id,
                    entities = record.processed_count,
                    "Feed update recorded"
                );
                if let Some(path) = summary_csv {
                    if let Err(e) = append_record(path, record) {
                        error!(path, error = %e, "Failed to write summary record");
                    }
                }
            }
            Err(e) => {
                failed += 1;
                warn!(line_group = %line_group, message = %e.public_message(), "Line group skipped this round");
            }
        }
    }
    failed
}

/// Ingests every line group each round, waiting `interval_secs` between rounds.
#[tracing::instrument(skip(ingestor, summary_csv))]
async fn poll<S: Store + 'static>(
    ingestor: &Arc<Ingestor<BasicClient, S>>,
    interval_secs: u64,
    iterations: usize,
    concurrency: usize,
    summary_csv: Option<&str>,
) -> Result<()> {
    if iterations == 0 {
        info!(interval_secs, "Polling indefinitely. Press Ctrl+C to stop.");
    } else {
        info!(iterations, interval_secs, "Starting polling");
    }

    let mut round = 0;
    loop {
        if iterations > 0 && round >= iterations {
            break;
        }
        round += 1;

        info!(round, "Starting ingestion round");
        let results = ingestor.ingest_all(concurrency).await;
        let failed = record_results(&results, summary_csv);
        info!(round, line_groups = results.len(), failed, "Ingestion round finished");

        if iterations == 0 || round < iterations {
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;
        }
    }

    Ok(())
}
