//! The analytics query engine.
//!
//! # Backend selection
//!
//! [`AnalyticsEngine::connect`] pings ClickHouse once and picks a
//! [`QueryBackend`]. With [`QueryBackend::Columnar`], DAU and top-events go to
//! ClickHouse first and fall back to SQLite when that call fails; the fallback
//! result is returned as if nothing happened. Retention always runs on SQLite
//! because it needs the authoritative, deduplicated rows.

use crate::mirror::AnalyticalStore;
use crate::store::EventStore;
use crate::{Error, Result};
use chrono::{Days, NaiveDate};
use metrics::counter;
use pulse_core::Error as CoreError;
use serde::{Deserialize, Serialize};

/// Largest accepted `limit` for top events.
pub const MAX_TOP_EVENTS: u32 = 100;

/// Largest accepted number of retention windows.
pub const MAX_RETENTION_WINDOWS: u32 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyActiveUsers {
    pub date: NaiveDate,
    pub unique_users: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeCount {
    pub event_type: String,
    pub count: u64,
}

/// Retention of one follow-up week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionWindow {
    /// 1-based week offset from the cohort week.
    pub week: u32,
    pub week_start: NaiveDate,
    pub retained_users: u64,
    /// Percentage of the cohort, rounded to two decimals.
    pub retention_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub start_date: NaiveDate,
    pub cohort_size: u64,
    pub retention: Vec<RetentionWindow>,
}

/// Where DAU and top-events queries are answered first.
#[derive(Clone)]
pub enum QueryBackend {
    /// ClickHouse, with SQLite as fallback.
    Columnar(AnalyticalStore),
    /// SQLite only.
    Direct,
}

impl QueryBackend {
    pub fn name(&self) -> &'static str {
        match self {
            QueryBackend::Columnar(_) => "clickhouse",
            QueryBackend::Direct => "sqlite",
        }
    }
}

pub struct AnalyticsEngine {
    store: EventStore,
    backend: QueryBackend,
}

impl AnalyticsEngine {
    /// Build an engine with an explicit backend.
    pub fn new(store: EventStore, backend: QueryBackend) -> Self {
        Self { store, backend }
    }

    /// Ping `mirror` and choose the backend.
    pub async fn connect(store: EventStore, mirror: Option<AnalyticalStore>) -> Self {
        let backend = match mirror {
            Some(mirror) if mirror.probe().await => QueryBackend::Columnar(mirror),
            Some(_) => {
                tracing::warn!("ClickHouse unreachable, analytics will query SQLite directly");
                QueryBackend::Direct
            }
            None => QueryBackend::Direct,
        };
        tracing::info!(backend = backend.name(), "analytics backend selected");
        Self::new(store, backend)
    }

    pub fn backend(&self) -> &QueryBackend {
        &self.backend
    }

    /// Distinct users per UTC day in `from..=to`, ascending by date.
    pub async fn dau(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailyActiveUsers>> {
        check_range(from, to)?;

        if let QueryBackend::Columnar(mirror) = &self.backend {
            match mirror.daily_active_users(from, to).await {
                Ok(rows) => return Ok(rows),
                Err(e) => log_fallback("dau", &e),
            }
        }
        self.store.daily_active_users(from, to).await
    }

    /// The `limit` most frequent event types in `from..=to`.
    pub async fn top_events(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        limit: u32,
    ) -> Result<Vec<EventTypeCount>> {
        check_range(from, to)?;
        if !(1..=MAX_TOP_EVENTS).contains(&limit) {
            return Err(invalid("limit", format!("must be between 1 and {MAX_TOP_EVENTS}")));
        }

        if let QueryBackend::Columnar(mirror) = &self.backend {
            match mirror.top_events(from, to, limit).await {
                Ok(rows) => return Ok(rows),
                Err(e) => log_fallback("top_events", &e),
            }
        }
        self.store.top_events(from, to, limit).await
    }

    /// Weekly retention of the users active in the 7 days from `start_date`.
    pub async fn retention(&self, start_date: NaiveDate, windows: u32) -> Result<RetentionReport> {
        if !(1..=MAX_RETENTION_WINDOWS).contains(&windows) {
            return Err(invalid(
                "windows",
                format!("must be between 1 and {MAX_RETENTION_WINDOWS}"),
            ));
        }

        let cohort_end = add_days(start_date, 6)?;
        let cohort_size = self.store.cohort_size(start_date, cohort_end).await?;

        let mut report = RetentionReport {
            start_date,
            cohort_size,
            retention: Vec::new(),
        };
        if cohort_size == 0 {
            return Ok(report);
        }

        for week in 1..=windows {
            let week_start = add_days(start_date, 7 * u64::from(week))?;
            let week_end = add_days(week_start, 6)?;
            let retained_users = self
                .store
                .retained_users(start_date, cohort_end, week_start, week_end)
                .await?;

            report.retention.push(RetentionWindow {
                week,
                week_start,
                retained_users,
                retention_rate: retention_rate(retained_users, cohort_size),
            });
        }

        Ok(report)
    }
}

fn check_range(from: NaiveDate, to: NaiveDate) -> Result<()> {
    if from > to {
        return Err(Error::InvalidRange { from, to });
    }
    Ok(())
}

fn invalid(field: &'static str, reason: String) -> Error {
    Error::Validation(CoreError::InvalidField { field, reason })
}

fn add_days(date: NaiveDate, days: u64) -> Result<NaiveDate> {
    date.checked_add_days(Days::new(days))
        .ok_or_else(|| invalid("start_date", "date out of range".to_string()))
}

fn log_fallback(query: &'static str, error: &Error) {
    counter!("analytics_fallback_total", "query" => query).increment(1);
    tracing::warn!(query, "ClickHouse query failed, falling back to SQLite: {}", error);
}

/// `retained / cohort` as a percentage with two decimals.
fn retention_rate(retained: u64, cohort: u64) -> f64 {
    let pct = retained as f64 / cohort as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}
