//! Pulse queue worker daemon.
//!
//! Consumes events from the Redis queue, writes them to the SQLite store and
//! mirrors them to ClickHouse when configured.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: ./data/events.db, redis://localhost:6379/0, no mirror
//! pulse-worker
//!
//! # With a ClickHouse mirror and a larger batch
//! pulse-worker \
//!     --database-path /var/lib/pulse/events.db \
//!     --redis-url redis://redis:6379/0 \
//!     --clickhouse-url http://clickhouse:8123 \
//!     --batch-size 500
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) and SIGTERM clear the running flag. The batch in flight is
//! finished and the process exits.

use anyhow::{Context, Result};
use clap::Parser;
use metrics::gauge;
use pulse_core::metrics::{init_metrics, start_metrics_server};
use pulse_pipeline::{
    AnalyticalStore, BatchProcessor, ClickHouseConfig, EventStore, IngestionEngine, RedisQueue,
    WorkerConfig,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Pulse queue worker.
#[derive(Parser, Debug)]
#[command(name = "pulse-worker")]
#[command(about = "Consume queued events into the Pulse event store")]
#[command(version)]
struct Args {
    /// Load environment variables from this file first
    #[arg(long, env = "DOTENV_PATH")]
    dotenv: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, env = "PULSE_DATABASE_PATH", default_value = "./data/events.db")]
    database_path: PathBuf,

    /// How long a write waits on a locked database (ms)
    #[arg(long, env = "PULSE_STORE_TIMEOUT_MS", default_value = "5000")]
    store_timeout_ms: u64,

    /// Redis URL of the queue
    #[arg(long, env = "PULSE_REDIS_URL", default_value = "redis://localhost:6379/0")]
    redis_url: String,

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

    /// Maximum messages per batch
    #[arg(long, env = "PULSE_WORKER_BATCH_SIZE", default_value = "100")]
    batch_size: usize,

    /// Seconds each dequeue pop waits for a message
    #[arg(long, env = "PULSE_WORKER_TIMEOUT_SECS", default_value = "5")]
    timeout_secs: u64,

    /// Emit JSON log lines
    #[arg(long, env = "PULSE_LOG_JSON")]
    log_json: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "PULSE_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // The dotenv file may set variables the real parse depends on.
    if let Some(path) = Args::parse().dotenv {
        dotenvy::from_path(&path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
    }
    let args = Args::parse();

    init_tracing(args.log_json)?;

    tracing::info!("Pulse queue worker starting...");

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
        gauge!("worker_running").set(1.0);
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, finishing current batch...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let store = EventStore::open(&args.database_path, Duration::from_millis(args.store_timeout_ms))
        .with_context(|| format!("Failed to open {}", args.database_path.display()))?;

    let queue = RedisQueue::connect(&args.redis_url)
        .await
        .context("Failed to connect to the Redis queue")?;

    let mirror = args.clickhouse_url.as_ref().map(|url| {
        AnalyticalStore::new(ClickHouseConfig {
            url: url.clone(),
            database: args.clickhouse_db.clone(),
            table: args.clickhouse_table.clone(),
            timeout: Duration::from_secs(args.clickhouse_timeout_secs.max(1)),
        })
    });

    let config = WorkerConfig {
        batch_size: args.batch_size.max(1),
        dequeue_timeout: Duration::from_secs(args.timeout_secs),
        ..Default::default()
    };

    let processor = BatchProcessor::new(
        Arc::new(queue),
        IngestionEngine::new(store),
        mirror,
        config,
    );
    processor.run(running).await;

    gauge!("worker_running").set(0.0);
    tracing::info!("Pulse queue worker exited cleanly");
    Ok(())
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,pulse_pipeline=debug"))
        .context("Invalid log filter")?;

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}
