//! API route definitions.

mod events;
mod health;
mod queue;
mod stats;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::rate_limit::rate_limit_middleware;
use crate::state::AppState;

/// Build the complete API router.
///
/// # Route Structure
///
/// ## Not rate limited
/// - `GET /health` - Health check
///
/// ## Rate limited
/// - `GET /` - Service index
/// - `POST /events` - Ingest a batch of 1-1000 events
/// - `GET /stats/dau` - Daily active users
/// - `GET /stats/top-events` - Most frequent event types
/// - `GET /stats/retention` - Weekly cohort retention
/// - `GET /stats/queue` - Queue and dead-letter depth
pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/health", get(health::health_check));

    let limited = Router::new()
        .route("/", get(health::index))
        .route("/events", post(events::ingest_events))
        .route("/stats/dau", get(stats::dau))
        .route("/stats/top-events", get(stats::top_events))
        .route("/stats/retention", get(stats::retention))
        .route("/stats/queue", get(queue::queue_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new().merge(public).merge(limited).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Config, IngestMode};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use pulse_pipeline::{AnalyticsEngine, EventQueue, EventStore, MemoryQueue, QueryBackend};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            cache_ttl: Duration::ZERO,
            ..Default::default()
        }
    }

    fn app_with(config: Config, mode: IngestMode) -> (Router, EventStore) {
        let store = EventStore::open_in_memory().unwrap();
        let analytics = AnalyticsEngine::new(store.clone(), QueryBackend::Direct);
        let state = AppState::new(config, store.clone(), mode, analytics, None);
        (router(state), store)
    }

    fn direct_app() -> (Router, EventStore) {
        app_with(test_config(), IngestMode::Direct)
    }

    fn event(id: &str, user: &str, event_type: &str, at: &str) -> Value {
        json!({
            "event_id": id,
            "occurred_at": at,
            "user_id": user,
            "event_type": event_type,
            "properties": {"source": "test"}
        })
    }

    fn new_event(user: &str, event_type: &str, at: &str) -> Value {
        event(&uuid::Uuid::new_v4().to_string(), user, event_type, at)
    }

    fn post_events(events: Vec<Value>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/events")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "events": events }).to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = direct_app();
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());

        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["ingest_mode"], "direct");
    }

    #[tokio::test]
    async fn test_index_is_rate_limited() {
        let (app, _) = direct_app();
        let response = app.oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "100");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "99");
    }

    #[tokio::test]
    async fn test_direct_ingest_is_idempotent() {
        let (app, store) = direct_app();
        let e = new_event("alice", "signup", "2024-02-01T10:00:00Z");

        let response = app.clone().oneshot(post_events(vec![e.clone()])).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["total_received"], 1);
        assert_eq!(body["inserted"], 1);
        assert_eq!(body["duplicates"], 0);

        let response = app.oneshot(post_events(vec![e])).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["inserted"], 0);
        assert_eq!(body["duplicates"], 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_events_return_field_details() {
        let (app, store) = direct_app();
        let good = new_event("alice", "signup", "2024-02-01T10:00:00Z");
        let bad = event("not-a-uuid", "  ", "signup", "2024-02-01T10:00:00Z");

        let response = app.oneshot(post_events(vec![good, bad])).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["error"], "validation_error");
        let details = body["details"].as_array().unwrap();
        assert_eq!(details.len(), 2);
        assert!(details.iter().all(|d| d["index"] == 1));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_and_malformed_bodies_are_bad_requests() {
        let (app, _) = direct_app();

        let response = app.clone().oneshot(post_events(vec![])).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .method("POST")
            .uri("/events")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_queued_ingest_accepts_and_reports_queue() {
        let queue = Arc::new(MemoryQueue::new());
        let (app, store) = app_with(test_config(), IngestMode::Queued(queue.clone()));

        let events = vec![
            new_event("a", "click", "2024-02-01T10:00:00Z"),
            new_event("b", "click", "2024-02-01T11:00:00Z"),
        ];
        let response = app.clone().oneshot(post_events(events)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["total_received"], 2);
        assert_eq!(body["inserted"], 0);
        assert_eq!(queue.queue_size().await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 0);

        let response = app.oneshot(get("/stats/queue")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["queue_size"], 2);
        assert_eq!(body["dead_letter_queue_size"], 0);
    }

    #[tokio::test]
    async fn test_queue_status_is_404_in_direct_mode() {
        let (app, _) = direct_app();
        let response = app.oneshot(get("/stats/queue")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_dau_and_top_events() {
        let (app, _) = direct_app();
        let events = vec![
            new_event("A", "page_view", "2024-02-01T10:00:00Z"),
            new_event("B", "page_view", "2024-02-01T11:00:00Z"),
            new_event("A", "click", "2024-02-02T10:00:00Z"),
        ];
        app.clone().oneshot(post_events(events)).await.unwrap();

        let response = app
            .clone()
            .oneshot(get("/stats/dau?from=2024-02-01&to=2024-02-02"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!([
                {"date": "2024-02-01", "unique_users": 2},
                {"date": "2024-02-02", "unique_users": 1}
            ])
        );

        let response = app
            .oneshot(get("/stats/top-events?from=2024-02-01&to=2024-02-02"))
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await,
            json!([
                {"event_type": "page_view", "count": 2},
                {"event_type": "click", "count": 1}
            ])
        );
    }

    #[tokio::test]
    async fn test_direct_ingest_refreshes_cached_answers() {
        let config = Config {
            cache_ttl: Duration::from_secs(300),
            ..Default::default()
        };
        let (app, _) = app_with(config, IngestMode::Direct);
        let uri = "/stats/dau?from=2024-02-01&to=2024-02-01";

        app.clone()
            .oneshot(post_events(vec![new_event("A", "view", "2024-02-01T10:00:00Z")]))
            .await
            .unwrap();
        let body = body_json(app.clone().oneshot(get(uri)).await.unwrap()).await;
        assert_eq!(body[0]["unique_users"], 1);

        app.clone()
            .oneshot(post_events(vec![new_event("B", "view", "2024-02-01T11:00:00Z")]))
            .await
            .unwrap();
        let body = body_json(app.oneshot(get(uri)).await.unwrap()).await;
        assert_eq!(body[0]["unique_users"], 2);
    }

    #[tokio::test]
    async fn test_stats_parameter_errors() {
        let (app, _) = direct_app();
        for uri in [
            "/stats/dau?from=2024-02-03&to=2024-02-01",
            "/stats/dau?from=yesterday&to=2024-02-01",
            "/stats/dau?from=2024-02-01",
            "/stats/top-events?from=2024-02-01&to=2024-02-01&limit=101",
            "/stats/retention?start_date=2024-02-01&windows=13",
        ] {
            let response = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_retention_default_windows() {
        let (app, _) = direct_app();
        app.clone()
            .oneshot(post_events(vec![
                new_event("a", "x", "2024-01-01T09:00:00Z"),
                new_event("b", "x", "2024-01-02T09:00:00Z"),
                new_event("a", "x", "2024-01-09T09:00:00Z"),
            ]))
            .await
            .unwrap();

        let response = app
            .oneshot(get("/stats/retention?start_date=2024-01-01"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["cohort_size"], 2);
        let windows = body["retention"].as_array().unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0]["week_start"], "2024-01-08");
        assert_eq!(windows[0]["retention_rate"], 50.0);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_excess_requests() {
        let config = Config {
            rate_limit: crate::rate_limit::RateLimitConfig {
                requests: 2,
                period: Duration::from_secs(60),
            },
            api_key: Some("k3y".to_string()),
            ..test_config()
        };
        let (app, _) = app_with(config, IngestMode::Direct);

        for _ in 0..2 {
            let response = app.clone().oneshot(get("/")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        let body = body_json(response).await;
        assert_eq!(body["detail"], "Rate limit exceeded");
        assert!(body["retry_after"].as_u64().unwrap() >= 1);

        // A valid API key has its own bucket, and health is never limited.
        let request = Request::builder()
            .uri("/")
            .header("x-api-key", "k3y")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.oneshot(get("/health")).await.unwrap().status(), StatusCode::OK);
    }
}
