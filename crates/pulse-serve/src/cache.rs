//! Short-lived cache of analytics answers, backed by moka.
//!
//! Keys are the endpoint name followed by every parameter that affects the
//! answer, e.g. `dau:2024-02-01:2024-02-07`. A direct-mode ingest that writes
//! new rows clears the whole cache. Queued events land through the worker,
//! which this process never sees, so in queued mode an answer may lag new
//! events by up to the TTL.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::ApiError;

/// Default cache capacity (number of entries).
pub const DEFAULT_CACHE_CAPACITY: u64 = 1000;

/// Analytics answers keyed by query, stored as JSON values.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Cache<String, Arc<Value>>,
}

impl ResponseCache {
    /// Create a cache whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(DEFAULT_CACHE_CAPACITY)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Drop every cached answer.
    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.entries.get(key).await?;
        match T::deserialize(value.as_ref()) {
            Ok(hit) => {
                tracing::debug!(key = %key, "cache hit");
                Some(hit)
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "dropping unreadable cache entry");
                self.entries.invalidate(key).await;
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(json) => self.entries.insert(key.to_string(), Arc::new(json)).await,
            Err(e) => tracing::warn!(key = %key, error = %e, "answer not cacheable"),
        }
    }
}

/// Answer from `cache` when possible, otherwise run `compute` and remember a
/// successful result. Without a cache every call computes.
pub async fn get_or_compute<T, F, Fut>(
    cache: Option<&ResponseCache>,
    key: &str,
    compute: F,
) -> Result<T, ApiError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let Some(cache) = cache else {
        return compute().await;
    };
    if let Some(hit) = cache.lookup(key).await {
        return Ok(hit);
    }

    let value = compute().await?;
    cache.store(key, &value).await;
    Ok(value)
}
