//! Bulk import of JSONL event files into the Pulse store.
//!
//! Each line is one event object with the same fields the HTTP API accepts.
//! Lines that are not JSON or fail validation are logged and skipped. Valid
//! events are ingested in batches through the same idempotent engine, so an
//! import can be re-run safely.
//!
//! # Usage
//!
//! ```bash
//! # Single file
//! pulse-import -i events.jsonl
//!
//! # Directory of JSONL files, mirrored to ClickHouse
//! pulse-import -i ./exports/ --clickhouse-url http://localhost:8123
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use pulse_core::{EventInput, EventRecord, MAX_BATCH_SIZE};
use pulse_pipeline::{
    sync_best_effort, AnalyticalStore, ClickHouseConfig, EventStore, IngestionEngine,
};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Import JSONL events into the Pulse event store.
#[derive(Parser, Debug)]
#[command(name = "pulse-import")]
#[command(about = "Import JSONL events into the Pulse event store")]
struct Args {
    /// Input JSONL file or directory path
    #[arg(short, long)]
    input: PathBuf,

    /// SQLite database path
    #[arg(long, env = "PULSE_DATABASE_PATH", default_value = "./data/events.db")]
    database_path: PathBuf,

    /// ClickHouse URL (enables mirroring, e.g., http://localhost:8123)
    #[arg(long, env = "CLICKHOUSE_URL")]
    clickhouse_url: Option<String>,

    /// ClickHouse database name
    #[arg(long, env = "CLICKHOUSE_DATABASE", default_value = "default")]
    clickhouse_db: String,

    /// ClickHouse table name
    #[arg(long, env = "CLICKHOUSE_TABLE", default_value = "events")]
    clickhouse_table: String,

    /// Seconds before a ClickHouse call is abandoned
    #[arg(long, env = "CLICKHOUSE_TIMEOUT_SECS", default_value = "10")]
    clickhouse_timeout_secs: u64,

    /// Events per ingest batch
    #[arg(long, default_value_t = MAX_BATCH_SIZE)]
    batch_size: usize,

    /// Limit number of files to process (for testing)
    #[arg(long)]
    limit: Option<usize>,
}

/// Statistics collected during an import.
#[derive(Debug, Default, PartialEq, Eq)]
struct Stats {
    files_processed: usize,
    total_lines: usize,
    inserted: usize,
    duplicates: usize,
    json_errors: usize,
    validation_errors: usize,
    batches_mirrored: usize,
}

impl Stats {
    fn invalid(&self) -> usize {
        self.json_errors + self.validation_errors
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.batch_size == 0 {
        bail!("--batch-size must be at least 1");
    }

    let store = EventStore::open(&args.database_path, Duration::from_secs(5))
        .with_context(|| format!("Failed to open {}", args.database_path.display()))?;
    let engine = IngestionEngine::new(store);
    let mirror = args.clickhouse_url.as_ref().map(|url| {
        AnalyticalStore::new(ClickHouseConfig {
            url: url.clone(),
            database: args.clickhouse_db.clone(),
            table: args.clickhouse_table.clone(),
            timeout: Duration::from_secs(args.clickhouse_timeout_secs.max(1)),
        })
    });

    let files = collect_files(&args.input, args.limit)?;
    info!("Found {} JSONL files to import", files.len());

    let start = Instant::now();
    let mut stats = Stats::default();
    for (idx, path) in files.iter().enumerate() {
        info!("[{}/{}] Importing: {}", idx + 1, files.len(), path.display());
        import_file(path, &engine, mirror.as_ref(), args.batch_size, &mut stats).await?;
        stats.files_processed += 1;
    }

    print_summary(&args, &stats, start.elapsed());
    Ok(())
}

/// Collect `.jsonl`/`.ndjson` files from a file or directory path, sorted.
fn collect_files(input: &Path, limit: Option<usize>) -> Result<Vec<PathBuf>> {
    let mut files = if input.is_file() {
        vec![input.to_path_buf()]
    } else if input.is_dir() {
        let mut entries: Vec<_> = fs::read_dir(input)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext == "jsonl" || ext == "ndjson")
            })
            .collect();
        entries.sort();
        entries
    } else {
        bail!("Input path does not exist: {}", input.display());
    };

    if let Some(limit) = limit {
        files.truncate(limit);
    }
    Ok(files)
}

async fn import_file(
    path: &Path,
    engine: &IngestionEngine,
    mirror: Option<&AnalyticalStore>,
    batch_size: usize,
    stats: &mut Stats,
) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut batch: Vec<EventRecord> = Vec::with_capacity(batch_size);
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        stats.total_lines += 1;

        match parse_line(&line) {
            Ok(record) => batch.push(record),
            Err(LineError::Json(e)) => {
                stats.json_errors += 1;
                warn!("{}:{}: invalid JSON: {}", path.display(), line_no + 1, e);
            }
            Err(LineError::Invalid(reason)) => {
                stats.validation_errors += 1;
                warn!("{}:{}: {}", path.display(), line_no + 1, reason);
            }
        }

        if batch.len() >= batch_size {
            flush(engine, mirror, &mut batch, stats).await?;
        }
    }
    flush(engine, mirror, &mut batch, stats).await
}

async fn flush(
    engine: &IngestionEngine,
    mirror: Option<&AnalyticalStore>,
    batch: &mut Vec<EventRecord>,
    stats: &mut Stats,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let events = std::mem::take(batch);
    let outcome = engine
        .ingest(events.clone())
        .await
        .context("Failed to write batch to the event store")?;
    stats.inserted += outcome.inserted;
    stats.duplicates += outcome.duplicates;

    if sync_best_effort(mirror, &events).await {
        stats.batches_mirrored += 1;
    }
    Ok(())
}

enum LineError {
    Json(serde_json::Error),
    Invalid(String),
}

fn parse_line(line: &str) -> std::result::Result<EventRecord, LineError> {
    let input: EventInput = serde_json::from_str(line).map_err(LineError::Json)?;
    input.validate(0).map_err(|errors| {
        LineError::Invalid(
            errors
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect::<Vec<_>>()
                .join("; "),
        )
    })
}

fn print_summary(args: &Args, stats: &Stats, elapsed: Duration) {
    println!("\n══════════════════════════════════════════════════════════════════");
    println!("SUMMARY");
    println!("══════════════════════════════════════════════════════════════════\n");

    println!("Input:       {}", args.input.display());
    println!("Database:    {}", args.database_path.display());
    if let Some(ref ch) = args.clickhouse_url {
        println!("ClickHouse:  {}", ch);
    }
    println!();
    println!("Files processed:   {:>12}", stats.files_processed);
    println!("Lines processed:   {:>12}", stats.total_lines);
    println!("Inserted:          {:>12}", stats.inserted);
    println!("Duplicates:        {:>12}", stats.duplicates);
    println!("Invalid:           {:>12}", stats.invalid());
    if stats.invalid() > 0 {
        println!("  - JSON errors:     {:>10}", stats.json_errors);
        println!("  - Validation:      {:>10}", stats.validation_errors);
    }
    if args.clickhouse_url.is_some() {
        println!("Batches mirrored:  {:>12}", stats.batches_mirrored);
    }
    println!();
    println!("Elapsed time:      {:>12.2?}", elapsed);

    if stats.inserted > 0 {
        let per_sec = stats.inserted as f64 / elapsed.as_secs_f64();
        println!("Throughput:        {:>12.0} events/sec", per_sec);
    }
    println!();
}
