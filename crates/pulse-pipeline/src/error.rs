//! Error types for the ingestion pipeline.

use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while ingesting, queueing or querying events.
#[derive(Error, Debug)]
pub enum Error {
    /// The system-of-record store failed or could not be reached.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] rusqlite::Error),

    /// The durable queue could not be reached.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(#[from] redis::RedisError),

    /// ClickHouse error.
    #[error("ClickHouse error: {0}")]
    Analytical(#[from] clickhouse::error::Error),

    /// ClickHouse did not answer in time.
    #[error("ClickHouse did not answer within {0:?}")]
    AnalyticalTimeout(Duration),

    /// Input validation error.
    #[error("validation error: {0}")]
    Validation(#[from] pulse_core::Error),

    /// A date range whose start is after its end.
    #[error("invalid date range: from {from} is after to {to}")]
    InvalidRange { from: NaiveDate, to: NaiveDate },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking store task panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Whether this error was caused by the caller's input rather than a backend.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::InvalidRange { .. })
    }
}
