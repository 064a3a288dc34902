//! API error types and response formatting.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pulse_core::FieldError;
use serde::Serialize;

/// API error type that converts to appropriate HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// One or more submitted events failed validation.
    #[error("{} invalid field(s)", .0.len())]
    Validation(Vec<FieldError>),

    /// A backend the request depends on is unreachable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Pipeline error (storage, queue, analytics).
    #[error("pipeline error: {0}")]
    Pipeline(#[from] pulse_pipeline::Error),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

/// JSON error response body.
#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

impl ErrorResponse {
    fn new(error: &'static str, message: impl Into<String>) -> Self {
        Self {
            error,
            message: Some(message.into()),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use pulse_core::Error as CoreError;
        use pulse_pipeline::Error as PipelineError;

        let (status, body) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse::new("not_found", msg)),
            Self::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("bad_request", msg),
            ),
            Self::Validation(details)
            | Self::Pipeline(PipelineError::Validation(CoreError::InvalidEvents(details))) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: "validation_error",
                    message: Some(format!("{} invalid field(s)", details.len())),
                    details: Some(details),
                },
            ),
            Self::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new("service_unavailable", msg),
            ),
            Self::Pipeline(err) if err.is_client_error() => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("bad_request", err.to_string()),
            ),
            Self::Pipeline(PipelineError::QueueUnavailable(err)) => {
                tracing::error!(error = %err, "queue unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorResponse::new("service_unavailable", "The event queue is unavailable"),
                )
            }
            Self::Pipeline(err) => {
                tracing::error!(error = %err, "pipeline error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("internal_error", "An internal error occurred"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_validation_details_are_listed() {
        let err = ApiError::Pipeline(pulse_pipeline::Error::Validation(
            pulse_core::Error::InvalidEvents(vec![FieldError::new(2, "user_id", "field required")]),
        ));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["error"], "validation_error");
        assert_eq!(body["details"][0]["index"], 2);
        assert_eq!(body["details"][0]["field"], "user_id");
    }

    #[tokio::test]
    async fn test_invalid_range_is_bad_request() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let err = ApiError::from(pulse_pipeline::Error::InvalidRange {
            from: d,
            to: d.pred_opt().unwrap(),
        });
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_backend_failure_is_generic_500() {
        let err = ApiError::from(pulse_pipeline::Error::Task(failed_task().await));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["message"], "An internal error occurred");
    }

    async fn failed_task() -> tokio::task::JoinError {
        tokio::spawn(async { panic!("boom") }).await.unwrap_err()
    }
}
