//! Event ingestion endpoint.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use pulse_core::{validate_batch, EventInput};
use pulse_pipeline::sync_best_effort;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::{AppState, IngestMode};

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub events: Vec<EventInput>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub total_received: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub message: String,
}

/// `POST /events`
///
/// Direct mode answers 201 with the store's counts and clears cached
/// analytics when rows were written. Queued mode answers 202; the counts are
/// zero because nothing has been written yet.
pub async fn ingest_events(
    State(state): State<AppState>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let Json(request) = payload?;
    let total_received = request.events.len();

    let records = validate_batch(&request.events).map_err(|e| match e {
        pulse_core::Error::InvalidEvents(details) => ApiError::Validation(details),
        other => ApiError::BadRequest(other.to_string()),
    })?;

    match &state.ingest_mode {
        IngestMode::Direct => {
            let outcome = state.ingestion.ingest(records.clone()).await?;
            if outcome.inserted > 0 {
                if let Some(cache) = &state.cache {
                    cache.invalidate_all();
                }
            }

            if let Some(mirror) = state.mirror.clone() {
                tokio::spawn(async move {
                    sync_best_effort(Some(&mirror), &records).await;
                });
            }

            Ok((
                StatusCode::CREATED,
                Json(IngestResponse {
                    total_received,
                    inserted: outcome.inserted,
                    duplicates: outcome.duplicates,
                    message: format!(
                        "Processed {} events: {} inserted, {} duplicates",
                        total_received, outcome.inserted, outcome.duplicates
                    ),
                }),
            ))
        }
        IngestMode::Queued(queue) => {
            let queued = queue.enqueue(&records).await?;
            Ok((
                StatusCode::ACCEPTED,
                Json(IngestResponse {
                    total_received,
                    inserted: 0,
                    duplicates: 0,
                    message: format!("{queued} events queued for processing"),
                }),
            ))
        }
    }
}
