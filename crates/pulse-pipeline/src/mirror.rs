//! ClickHouse mirror of committed events.
//!
//! The mirror is a derived, append-only copy of the events table used for
//! fast aggregates. It is written after the system-of-record commit and may
//! lag behind it or hold a row more than once; it is never read for
//! correctness-critical answers.
//!
//! Every call is bounded by [`ClickHouseConfig::timeout`]. A server that
//! accepts connections but never answers surfaces as
//! [`Error::AnalyticalTimeout`], the same as any other mirror failure.

use crate::analytics::{DailyActiveUsers, EventTypeCount};
use crate::{Error, Result};
use chrono::NaiveDate;
use clickhouse::{Client, Row};
use metrics::counter;
use pulse_core::EventRecord;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Connection settings for the analytical store.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// ClickHouse server URL (e.g., "http://localhost:8123")
    pub url: String,

    /// Database name
    pub database: String,

    /// Table name for mirrored events
    pub table: String,

    /// Deadline for any single ClickHouse call
    pub timeout: Duration,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            table: "events".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Row structure matching the mirrored events table.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct EventRow {
    pub event_id: String,
    pub occurred_at: i64, // DateTime64(6) as Unix microseconds
    pub user_id: String,
    pub event_type: String,
    pub properties: String,
}

impl From<&EventRecord> for EventRow {
    fn from(record: &EventRecord) -> Self {
        Self {
            event_id: record.event_id.to_string(),
            occurred_at: record.occurred_at.timestamp_micros(),
            user_id: record.user_id.clone(),
            event_type: record.event_type.clone(),
            properties: serde_json::Value::Object(record.properties.clone()).to_string(),
        }
    }
}

#[derive(Debug, Row, Deserialize)]
struct DauRow {
    date: String,
    unique_users: u64,
}

#[derive(Debug, Row, Deserialize)]
struct TopEventRow {
    event_type: String,
    count: u64,
}

/// Handle to the ClickHouse mirror.
#[derive(Clone)]
pub struct AnalyticalStore {
    client: Client,
    config: ClickHouseConfig,
    table_ready: Arc<AtomicBool>,
}

impl AnalyticalStore {
    /// Create a handle. No connection is made until the first call.
    pub fn new(config: ClickHouseConfig) -> Self {
        let client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        tracing::info!(
            "ClickHouse mirror configured: url={}, database={}, table={}",
            config.url,
            config.database,
            config.table
        );

        Self {
            client,
            config,
            table_ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run `fut` under the configured deadline.
    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.timeout, fut)
            .await
            .map_err(|_| Error::AnalyticalTimeout(self.config.timeout))?
    }

    /// Whether ClickHouse answers a trivial query.
    pub async fn probe(&self) -> bool {
        let ping = async {
            self.client.query("SELECT 1").execute().await?;
            Ok::<_, Error>(())
        };
        match self.bounded(ping).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("ClickHouse ping failed: {}", e);
                false
            }
        }
    }

    async fn ensure_table(&self) -> Result<()> {
        if self.table_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                event_id String,
                occurred_at DateTime64(6, 'UTC'),
                user_id String,
                event_type String,
                properties String
            )
            ENGINE = MergeTree
            ORDER BY (occurred_at, user_id)",
            self.config.table
        );
        self.client.query(&ddl).execute().await?;

        self.table_ready.store(true, Ordering::Release);
        tracing::info!("ClickHouse table {} ready", self.config.table);
        Ok(())
    }

    /// Append rows, creating the table on first use.
    pub async fn append(&self, rows: &[EventRecord]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.bounded(self.write_rows(rows)).await
    }

    async fn write_rows(&self, rows: &[EventRecord]) -> Result<usize> {
        self.ensure_table().await?;

        let mut inserter = self.client.insert(&self.config.table)?;
        for record in rows {
            inserter.write(&EventRow::from(record)).await?;
        }
        inserter.end().await?;

        Ok(rows.len())
    }

    pub async fn daily_active_users(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyActiveUsers>> {
        let sql = format!(
            "SELECT toString(toDate(occurred_at)) AS date, uniqExact(user_id) AS unique_users
             FROM {}
             WHERE occurred_at >= toDateTime64(?, 6, 'UTC')
               AND occurred_at < toDateTime64(?, 6, 'UTC')
             GROUP BY date
             ORDER BY date ASC",
            self.config.table
        );
        let query = self
            .client
            .query(&sql)
            .bind(day_start(from))
            .bind(day_after(to));
        let rows = self
            .bounded(async { Ok::<_, Error>(query.fetch_all::<DauRow>().await?) })
            .await?;

        rows.into_iter()
            .map(|row| {
                let date = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d").map_err(|e| {
                    Error::Analytical(clickhouse::error::Error::Custom(format!(
                        "bad date '{}': {}",
                        row.date, e
                    )))
                })?;
                Ok(DailyActiveUsers {
                    date,
                    unique_users: row.unique_users,
                })
            })
            .collect()
    }

    pub async fn top_events(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        limit: u32,
    ) -> Result<Vec<EventTypeCount>> {
        let sql = format!(
            "SELECT event_type, count() AS count
             FROM {}
             WHERE occurred_at >= toDateTime64(?, 6, 'UTC')
               AND occurred_at < toDateTime64(?, 6, 'UTC')
             GROUP BY event_type
             ORDER BY count DESC, event_type ASC
             LIMIT ?",
            self.config.table
        );
        let query = self
            .client
            .query(&sql)
            .bind(day_start(from))
            .bind(day_after(to))
            .bind(limit);
        let rows = self
            .bounded(async { Ok::<_, Error>(query.fetch_all::<TopEventRow>().await?) })
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| EventTypeCount {
                event_type: row.event_type,
                count: row.count,
            })
            .collect())
    }
}

/// Mirror `rows` if a mirror is configured.
///
/// Failures are logged and counted, never returned: the rows are already
/// committed to the system of record. Returns whether the rows were written.
pub async fn sync_best_effort(mirror: Option<&AnalyticalStore>, rows: &[EventRecord]) -> bool {
    let Some(mirror) = mirror else {
        return false;
    };
    if rows.is_empty() {
        return true;
    }

    match mirror.append(rows).await {
        Ok(n) => {
            counter!("mirror_rows_synced_total").increment(n as u64);
            tracing::debug!(rows = n, "rows mirrored to ClickHouse");
            true
        }
        Err(e) => {
            counter!("mirror_sync_errors_total").increment(1);
            tracing::warn!(rows = rows.len(), "ClickHouse mirror sync failed: {}", e);
            false
        }
    }
}

fn day_start(day: NaiveDate) -> String {
    format!("{} 00:00:00.000000", day.format("%Y-%m-%d"))
}

fn day_after(day: NaiveDate) -> String {
    match day.succ_opt() {
        Some(next) => day_start(next),
        None => format!("{} 23:59:59.999999", day.format("%Y-%m-%d")),
    }
}
