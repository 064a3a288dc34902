//! The system-of-record event store.
//!
//! A single SQLite connection behind a mutex, driven from the blocking thread
//! pool. `occurred_at` is stored as fixed-width UTC text
//! (`YYYY-MM-DDTHH:MM:SS.ffffffZ`) so that range predicates are plain string
//! comparisons that can use the time-leading indexes.

use crate::analytics::{DailyActiveUsers, EventTypeCount};
use crate::ingest::IngestOutcome;
use crate::store::schema::init_schema;
use crate::Result;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use parking_lot::Mutex;
use pulse_core::EventRecord;
use rusqlite::types::Type;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Ids per `IN (...)` lookup in the duplicate pre-check.
const PRECHECK_CHUNK: usize = 500;

/// Upper bound used when `to` is the last representable date.
const MAX_BOUND: &str = "9999-12-31T23:59:59.999999Z";

/// Handle to the events database. Cheap to clone.
#[derive(Clone)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    /// Open (or create) the database file at `path`.
    ///
    /// Parent directories are created. The connection runs in WAL mode and
    /// waits up to `busy_timeout` for a competing writer before failing.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        tracing::info!("Opened event store at {}", path.display());
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }

    /// Insert a batch, skipping ids that are already stored.
    ///
    /// Runs in one write transaction that takes the database lock up front,
    /// so a second process writing the same file waits out the busy timeout
    /// instead of failing. `inserted` is the number of rows SQLite actually
    /// wrote; everything else in the batch counts as a duplicate.
    pub async fn insert_batch(&self, records: Vec<EventRecord>) -> Result<IngestOutcome> {
        if records.is_empty() {
            return Ok(IngestOutcome::default());
        }
        self.with_conn(move |conn| insert_batch_blocking(conn, &records))
            .await
    }

    /// Fetch one event by id.
    pub async fn get(&self, event_id: Uuid) -> Result<Option<EventRecord>> {
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT event_id, occurred_at, user_id, event_type, properties
                     FROM events WHERE event_id = ?1",
                    [event_id.to_string()],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    /// Total number of stored events.
    pub async fn count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    /// Distinct users per UTC day for `from..=to`, ascending by date.
    pub async fn daily_active_users(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyActiveUsers>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT date(occurred_at) AS day, COUNT(DISTINCT user_id)
                 FROM events
                 WHERE occurred_at >= ?1 AND occurred_at < ?2
                 GROUP BY day
                 ORDER BY day ASC",
            )?;
            let rows = stmt
                .query_map(params![lower_bound(from), upper_bound(to)], |row| {
                    Ok(DailyActiveUsers {
                        date: date_column(row, 0)?,
                        unique_users: row.get::<_, i64>(1)? as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Event counts per type for `from..=to`, most frequent first.
    ///
    /// Equal counts are ordered by `event_type` ascending.
    pub async fn top_events(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        limit: u32,
    ) -> Result<Vec<EventTypeCount>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT event_type, COUNT(*) AS n
                 FROM events
                 WHERE occurred_at >= ?1 AND occurred_at < ?2
                 GROUP BY event_type
                 ORDER BY n DESC, event_type ASC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(
                    params![lower_bound(from), upper_bound(to), limit as i64],
                    |row| {
                        Ok(EventTypeCount {
                            event_type: row.get(0)?,
                            count: row.get::<_, i64>(1)? as u64,
                        })
                    },
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Distinct users with at least one event in `from..=to`.
    pub async fn cohort_size(&self, from: NaiveDate, to: NaiveDate) -> Result<u64> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT user_id) FROM events
                 WHERE occurred_at >= ?1 AND occurred_at < ?2",
                params![lower_bound(from), upper_bound(to)],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    /// Members of the cohort active in `cohort_from..=cohort_to` who also have
    /// events in `window_from..=window_to`.
    pub async fn retained_users(
        &self,
        cohort_from: NaiveDate,
        cohort_to: NaiveDate,
        window_from: NaiveDate,
        window_to: NaiveDate,
    ) -> Result<u64> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT user_id) FROM events
                 WHERE occurred_at >= ?3 AND occurred_at < ?4
                   AND user_id IN (
                       SELECT DISTINCT user_id FROM events
                       WHERE occurred_at >= ?1 AND occurred_at < ?2
                   )",
                params![
                    lower_bound(cohort_from),
                    upper_bound(cohort_to),
                    lower_bound(window_from),
                    upper_bound(window_to)
                ],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }
}

fn insert_batch_blocking(conn: &mut Connection, records: &[EventRecord]) -> Result<IngestOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let already_stored = count_existing(&tx, records)?;

    let mut inserted = 0usize;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO events (event_id, occurred_at, user_id, event_type, properties)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(event_id) DO NOTHING",
        )?;
        for record in records {
            let properties = serde_json::to_string(&record.properties)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            inserted += stmt.execute(params![
                record.event_id.to_string(),
                format_timestamp(&record.occurred_at),
                record.user_id,
                record.event_type,
                properties,
            ])?;
        }
    }

    tx.commit()?;

    let duplicates = records.len() - inserted;
    if already_stored != duplicates {
        // Ids repeated inside the batch, or a concurrent writer between the
        // lookup and the insert.
        tracing::debug!(
            already_stored,
            duplicates,
            batch = records.len(),
            "duplicate pre-check disagrees with store"
        );
    }

    Ok(IngestOutcome {
        inserted,
        duplicates,
    })
}

/// Number of distinct batch ids already present in the table.
fn count_existing(conn: &Connection, records: &[EventRecord]) -> rusqlite::Result<usize> {
    let mut found = 0usize;
    for chunk in records.chunks(PRECHECK_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("SELECT COUNT(*) FROM events WHERE event_id IN ({placeholders})");
        let ids = chunk.iter().map(|r| r.event_id.to_string());
        let n: i64 = conn.query_row(&sql, params_from_iter(ids), |row| row.get(0))?;
        found += n as usize;
    }
    Ok(found)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let event_id: String = row.get(0)?;
    let occurred_at: String = row.get(1)?;
    let properties: String = row.get(4)?;

    Ok(EventRecord {
        event_id: Uuid::parse_str(&event_id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
        occurred_at: DateTime::parse_from_rfc3339(&occurred_at)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?
            .with_timezone(&Utc),
        user_id: row.get(2)?,
        event_type: row.get(3)?,
        properties: serde_json::from_str(&properties)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
    })
}

fn date_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Stored form of a timestamp.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Inclusive lower bound: midnight UTC at the start of `day`.
fn lower_bound(day: NaiveDate) -> String {
    format!("{}T00:00:00.000000Z", day.format("%Y-%m-%d"))
}

/// Exclusive upper bound: midnight UTC at the start of the day after `day`.
fn upper_bound(day: NaiveDate) -> String {
    match day.succ_opt() {
        Some(next) => lower_bound(next),
        None => MAX_BOUND.to_string(),
    }
}
