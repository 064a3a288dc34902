//! Queue status endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::error::ApiError;
use crate::state::{AppState, IngestMode};

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub queue_size: u64,
    pub dead_letter_queue_size: u64,
}

/// `GET /stats/queue`
///
/// 404 when queueing is disabled, 503 when the queue cannot be read.
pub async fn queue_status(State(state): State<AppState>) -> Result<Json<QueueStatus>, ApiError> {
    let IngestMode::Queued(queue) = &state.ingest_mode else {
        return Err(ApiError::NotFound("queueing is not enabled".to_string()));
    };

    let unavailable = |e: pulse_pipeline::Error| {
        tracing::error!(error = %e, "failed to read queue status");
        ApiError::ServiceUnavailable("The event queue is unavailable".to_string())
    };

    let queue_size = queue.queue_size().await.map_err(unavailable)?;
    let dead_letter_queue_size = queue.dead_letter_size().await.map_err(unavailable)?;

    Ok(Json(QueueStatus {
        queue_size,
        dead_letter_queue_size,
    }))
}
