//! Health check and service index.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    ingest_mode: &'static str,
}

/// Health check endpoint.
///
/// Not rate limited. Use this for load balancer health checks.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        ingest_mode: state.ingest_mode.name(),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexResponse {
    service: &'static str,
    version: &'static str,
    endpoints: Vec<&'static str>,
}

pub async fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        service: "pulse",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: vec![
            "GET /health",
            "POST /events",
            "GET /stats/dau?from=&to=",
            "GET /stats/top-events?from=&to=&limit=",
            "GET /stats/retention?start_date=&windows=",
            "GET /stats/queue",
        ],
    })
}
