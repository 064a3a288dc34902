//! Prometheus metrics helpers for the Pulse pipeline.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pulse_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handle = init_metrics()?;
//!     start_metrics_server(9091, handle).await?;
//!
//!     metrics::counter!("ingest_events_total").increment(1);
//!     Ok(())
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: the stage that records it (`ingest_`, `queue_`, `worker_`, `mirror_`, `analytics_`)
//! - Suffix: `_total` for counters, `_depth` for queue length gauges

use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Fails if a recorder is already installed in this process.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_common_metrics();
    Ok(handle)
}

/// Serve `/metrics` on `port` from a background task.
///
/// The listener is bound before returning so that a port clash is reported
/// to the caller.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

fn register_common_metrics() {
    // =========================================================================
    // Ingestion
    // =========================================================================

    describe_counter!("ingest_events_total", "Events submitted to the store");
    describe_counter!(
        "ingest_events_inserted_total",
        "Events newly written to the system of record"
    );
    describe_counter!(
        "ingest_events_duplicate_total",
        "Events skipped because their event_id was already stored"
    );

    // =========================================================================
    // Queue
    // =========================================================================

    describe_counter!("queue_events_enqueued_total", "Events pushed onto the queue");
    describe_counter!(
        "queue_messages_requeued_total",
        "Messages pushed back after a failed parse"
    );
    describe_counter!(
        "queue_dead_letter_total",
        "Messages moved to the dead-letter list"
    );
    describe_gauge!("queue_depth", "Messages waiting on the main queue");
    describe_gauge!("dead_letter_depth", "Messages on the dead-letter list");

    // =========================================================================
    // Worker
    // =========================================================================

    describe_gauge!(
        "worker_running",
        "Whether a queue worker is currently running (1=yes, 0=no)"
    );
    describe_counter!("worker_batches_total", "Non-empty batches processed");
    describe_counter!(
        "worker_poison_batches_total",
        "Batches whose store write failed and were dead-lettered"
    );

    // =========================================================================
    // Analytical mirror
    // =========================================================================

    describe_counter!("mirror_rows_synced_total", "Rows copied to ClickHouse");
    describe_counter!("mirror_sync_errors_total", "Failed ClickHouse mirror writes");
    describe_counter!(
        "analytics_fallback_total",
        "Queries answered by the store after the columnar backend failed"
    );
}
