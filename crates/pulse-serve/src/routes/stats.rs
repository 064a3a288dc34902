//! Analytics endpoints.
//!
//! Thin wrappers over [`pulse_pipeline::AnalyticsEngine`]; parameter bounds and
//! range checks live in the engine so every caller gets the same rules.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::Json;
use chrono::NaiveDate;
use pulse_pipeline::{DailyActiveUsers, EventTypeCount, RetentionReport};
use serde::Deserialize;

use crate::cache::get_or_compute;
use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_TOP_EVENTS_LIMIT: u32 = 10;
const DEFAULT_RETENTION_WINDOWS: u32 = 3;

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct TopEventsParams {
    pub from: NaiveDate,
    pub to: NaiveDate,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    DEFAULT_TOP_EVENTS_LIMIT
}

#[derive(Debug, Deserialize)]
pub struct RetentionParams {
    pub start_date: NaiveDate,
    #[serde(default = "default_windows")]
    pub windows: u32,
}

fn default_windows() -> u32 {
    DEFAULT_RETENTION_WINDOWS
}

/// `GET /stats/dau?from=YYYY-MM-DD&to=YYYY-MM-DD`
pub async fn dau(
    State(state): State<AppState>,
    params: Result<Query<RangeParams>, QueryRejection>,
) -> Result<Json<Vec<DailyActiveUsers>>, ApiError> {
    let Query(params) = params?;
    let key = format!("dau:{}:{}", params.from, params.to);

    let rows = get_or_compute(state.cache.as_ref(), &key, || async {
        Ok(state.analytics.dau(params.from, params.to).await?)
    })
    .await?;

    Ok(Json(rows))
}

/// `GET /stats/top-events?from=&to=&limit=10`
pub async fn top_events(
    State(state): State<AppState>,
    params: Result<Query<TopEventsParams>, QueryRejection>,
) -> Result<Json<Vec<EventTypeCount>>, ApiError> {
    let Query(params) = params?;
    let key = format!("top_events:{}:{}:{}", params.from, params.to, params.limit);

    let rows = get_or_compute(state.cache.as_ref(), &key, || async {
        Ok(state
            .analytics
            .top_events(params.from, params.to, params.limit)
            .await?)
    })
    .await?;

    Ok(Json(rows))
}

/// `GET /stats/retention?start_date=&windows=3`
pub async fn retention(
    State(state): State<AppState>,
    params: Result<Query<RetentionParams>, QueryRejection>,
) -> Result<Json<RetentionReport>, ApiError> {
    let Query(params) = params?;
    let key = format!("retention:{}:{}", params.start_date, params.windows);

    let report = get_or_compute(state.cache.as_ref(), &key, || async {
        Ok(state
            .analytics
            .retention(params.start_date, params.windows)
            .await?)
    })
    .await?;

    Ok(Json(report))
}
