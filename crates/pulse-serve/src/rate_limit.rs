//! Per-caller rate limiting.
//!
//! Callers presenting the configured `X-API-Key` share an `api_key:` bucket;
//! everyone else is limited per client IP. Each bucket allows `requests`
//! requests at once and refills evenly over `period`.
//!
//! ## Response Headers
//!
//! Allowed responses carry `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
//! `X-RateLimit-Reset`. Rejected requests get `429 Too Many Requests` with a
//! `Retry-After` header as well.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::{Clock, DefaultClock};
use governor::middleware::StateInformationMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

use crate::state::AppState;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Rate limit settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed per period.
    pub requests: u32,
    /// Length of the period.
    pub period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 100,
            period: Duration::from_secs(60),
        }
    }
}

type KeyedLimiter = RateLimiter<
    String,
    DefaultKeyedStateStore<String>,
    DefaultClock,
    StateInformationMiddleware,
>;

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_secs: u64,
    },
    Limited {
        limit: u32,
        retry_after_secs: u64,
    },
}

/// Shared limiter state. Cheap to clone.
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<KeyedLimiter>,
    config: RateLimitConfig,
    api_key: Option<Arc<str>>,
}

impl std::fmt::Debug for RateLimitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitState")
            .field("config", &self.config)
            .field("api_key", &self.api_key.as_ref().map(|_| "<set>"))
            .finish()
    }
}

impl RateLimitState {
    pub fn new(config: RateLimitConfig, api_key: Option<String>) -> Self {
        let requests = NonZeroU32::new(config.requests.max(1)).unwrap_or(NonZeroU32::MIN);
        let replenish = config.period / requests.get();
        let quota = Quota::with_period(replenish)
            .unwrap_or_else(|| Quota::per_second(requests))
            .allow_burst(requests);

        let limiter = RateLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>();

        Self {
            limiter: Arc::new(limiter),
            config: RateLimitConfig {
                requests: requests.get(),
                period: config.period,
            },
            api_key: api_key.map(Arc::from),
        }
    }

    /// Forget buckets that have refilled completely. Returns how many remain.
    pub fn prune(&self) -> usize {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        self.limiter.len()
    }

    /// Prune every `every` until the last clone of this state is dropped.
    pub fn spawn_cleanup(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::downgrade(&self.limiter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.retain_recent();
                limiter.shrink_to_fit();
                tracing::debug!(buckets = limiter.len(), "pruned rate limit buckets");
            }
        })
    }

    /// Bucket key for a request: its API key if valid, otherwise its IP.
    pub fn bucket_for(&self, headers: &HeaderMap, client_ip: Option<SocketAddr>) -> String {
        if let (Some(expected), Some(given)) = (
            self.api_key.as_deref(),
            headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()),
        ) {
            if given == expected {
                return format!("api_key:{given}");
            }
        }
        match client_ip {
            Some(addr) => format!("ip:{}", addr.ip()),
            None => "ip:unknown".to_string(),
        }
    }

    /// Take one request from `bucket`.
    pub fn check(&self, bucket: &str) -> RateLimitResult {
        let limit = self.config.requests;
        match self.limiter.check_key(&bucket.to_string()) {
            Ok(snapshot) => {
                let remaining = snapshot.remaining_burst_capacity();
                let per_request = self.config.period / limit;
                let reset = per_request * (limit - remaining.min(limit));
                RateLimitResult::Allowed {
                    limit,
                    remaining,
                    reset_secs: ceil_secs(reset),
                }
            }
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                RateLimitResult::Limited {
                    limit,
                    retry_after_secs: ceil_secs(wait).max(1),
                }
            }
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Rate limiting middleware for Axum.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let bucket = state.rate_limit.bucket_for(req.headers(), client_ip);

    match state.rate_limit.check(&bucket) {
        RateLimitResult::Allowed {
            limit,
            remaining,
            reset_secs,
        } => {
            let mut response = next.run(req).await;
            add_rate_limit_headers(response.headers_mut(), limit, remaining, reset_secs);
            response
        }
        RateLimitResult::Limited {
            limit,
            retry_after_secs,
        } => {
            // Never log the key itself.
            let caller = if bucket.starts_with("api_key:") {
                "api_key"
            } else {
                bucket.as_str()
            };
            tracing::warn!(
                caller = %caller,
                path = %req.uri().path(),
                retry_after_secs,
                "Rate limit exceeded"
            );
            rate_limit_response(limit, retry_after_secs)
        }
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: u64) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

fn add_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_secs: u64) {
    set_header(headers, "x-ratelimit-limit", limit.into());
    set_header(headers, "x-ratelimit-remaining", remaining.into());
    set_header(headers, "x-ratelimit-reset", reset_secs);
}

fn rate_limit_response(limit: u32, retry_after_secs: u64) -> Response {
    let body = serde_json::json!({
        "detail": "Rate limit exceeded",
        "retry_after": retry_after_secs,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        headers.insert(header::RETRY_AFTER, v);
    }
    add_rate_limit_headers(headers, limit, 0, retry_after_secs);
    response
}
