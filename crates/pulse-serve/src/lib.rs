//! Pulse Serve - HTTP API for event ingestion and analytics
//!
//! This crate exposes the ingestion pipeline and the analytics engine over a
//! small JSON API. Events are either written straight to the store or pushed
//! onto the durable queue for `pulse-worker`, depending on configuration.
//!
//! # Rate Limiting
//!
//! Every endpoint except `/health` is rate limited per caller. Callers that
//! send the configured `X-API-Key` get their own bucket; everyone else is
//! bucketed by client IP.
//!
//! # Architecture
//!
//! - **AppState**: Shared application state (store, queue, analytics, configuration)
//! - **Rate limit**: Keyed limiter middleware
//! - **Cache**: Short-lived cache of analytics responses
//! - **Routes**: Endpoint handlers grouped by domain

pub mod cache;
mod error;
pub mod rate_limit;
mod routes;
mod state;

pub use self::cache::{get_or_compute, ResponseCache};
pub use self::error::ApiError;
pub use self::rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitState};
pub use self::routes::router;
pub use self::state::{AppState, Config, IngestMode};
