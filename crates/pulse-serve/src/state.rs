//! Application state and configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pulse_pipeline::{
    AnalyticalStore, AnalyticsEngine, ClickHouseConfig, EventQueue, EventStore, IngestionEngine,
    RedisQueue,
};

use crate::cache::ResponseCache;
use crate::rate_limit::{RateLimitConfig, RateLimitState};

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8000").
    pub bind_addr: String,

    /// SQLite database path.
    pub database_path: PathBuf,

    /// How long a write waits on a locked database.
    pub store_timeout: Duration,

    /// Whether POST /events enqueues instead of writing directly.
    pub use_queue: bool,

    /// Redis URL of the queue.
    pub redis_url: String,

    /// ClickHouse mirror settings, if a URL is configured.
    pub clickhouse: Option<ClickHouseConfig>,

    pub rate_limit: RateLimitConfig,

    /// API key granting its own rate limit bucket.
    pub api_key: Option<String>,

    /// TTL of cached analytics responses. Zero disables the cache.
    pub cache_ttl: Duration,

    /// Emit JSON log lines.
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            database_path: PathBuf::from("./data/events.db"),
            store_timeout: Duration::from_millis(5000),
            use_queue: false,
            redis_url: "redis://localhost:6379/0".to_string(),
            clickhouse: None,
            rate_limit: RateLimitConfig::default(),
            api_key: None,
            cache_ttl: Duration::from_secs(30),
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `PULSE_BIND_ADDR` (default: "0.0.0.0:8000")
    /// - `PULSE_DATABASE_PATH` (default: "./data/events.db")
    /// - `PULSE_STORE_TIMEOUT_MS` (default: 5000)
    /// - `PULSE_USE_QUEUE` (default: false)
    /// - `PULSE_REDIS_URL` (default: "redis://localhost:6379/0")
    /// - `CLICKHOUSE_URL` (enables the mirror), `CLICKHOUSE_DATABASE`, `CLICKHOUSE_TABLE`,
    ///   `CLICKHOUSE_TIMEOUT_SECS` (default: 10)
    /// - `PULSE_RATE_LIMIT_REQUESTS` (default: 100), `PULSE_RATE_LIMIT_PERIOD_SECS` (default: 60)
    /// - `PULSE_API_KEY`
    /// - `PULSE_CACHE_TTL_SECS` (default: 30, 0 disables)
    /// - `PULSE_LOG_JSON` (default: false)
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self::from_lookup(|name| std::env::var(name).ok())?;

        tracing::info!(
            bind_addr = %config.bind_addr,
            database = %config.database_path.display(),
            use_queue = config.use_queue,
            clickhouse = config.clickhouse.is_some(),
            rate_limit = config.rate_limit.requests,
            rate_limit_period_secs = config.rate_limit.period.as_secs(),
            "configuration loaded"
        );

        Ok(config)
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let clickhouse = match get("CLICKHOUSE_URL") {
            Some(url) => {
                let base = ClickHouseConfig::default();
                let timeout_secs: u64 =
                    parse_or(&get, "CLICKHOUSE_TIMEOUT_SECS", base.timeout.as_secs())?;
                Some(ClickHouseConfig {
                    url,
                    database: get("CLICKHOUSE_DATABASE").unwrap_or(base.database),
                    table: get("CLICKHOUSE_TABLE").unwrap_or(base.table),
                    timeout: Duration::from_secs(timeout_secs.max(1)),
                })
            }
            None => None,
        };

        let requests: u32 = parse_or(&get, "PULSE_RATE_LIMIT_REQUESTS", defaults.rate_limit.requests)?;
        if requests == 0 {
            anyhow::bail!("PULSE_RATE_LIMIT_REQUESTS must be at least 1");
        }
        let period_secs: u64 = parse_or(
            &get,
            "PULSE_RATE_LIMIT_PERIOD_SECS",
            defaults.rate_limit.period.as_secs(),
        )?;
        if period_secs == 0 {
            anyhow::bail!("PULSE_RATE_LIMIT_PERIOD_SECS must be at least 1");
        }

        Ok(Self {
            bind_addr: get("PULSE_BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_path: get("PULSE_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            store_timeout: Duration::from_millis(parse_or(&get, "PULSE_STORE_TIMEOUT_MS", 5000)?),
            use_queue: parse_bool(&get, "PULSE_USE_QUEUE")?,
            redis_url: get("PULSE_REDIS_URL").unwrap_or(defaults.redis_url),
            clickhouse,
            rate_limit: RateLimitConfig {
                requests,
                period: Duration::from_secs(period_secs),
            },
            api_key: get("PULSE_API_KEY"),
            cache_ttl: Duration::from_secs(parse_or(&get, "PULSE_CACHE_TTL_SECS", 30)?),
            log_json: parse_bool(&get, "PULSE_LOG_JSON")?,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value: '{raw}'")),
        None => Ok(default),
    }
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<bool> {
    match get(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{name} must be a boolean, got '{v}'"),
        },
    }
}

/// How accepted events reach the store.
#[derive(Clone)]
pub enum IngestMode {
    /// Written synchronously by the request handler.
    Direct,
    /// Pushed onto the durable queue for a worker.
    Queued(Arc<dyn EventQueue>),
}

impl IngestMode {
    pub fn name(&self) -> &'static str {
        match self {
            IngestMode::Direct => "direct",
            IngestMode::Queued(_) => "queued",
        }
    }
}

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub ingestion: IngestionEngine,
    pub analytics: Arc<AnalyticsEngine>,
    pub ingest_mode: IngestMode,
    /// Mirror written after direct ingests.
    pub mirror: Option<AnalyticalStore>,
    pub config: Arc<Config>,
    /// Analytics response cache, absent when the TTL is zero.
    pub cache: Option<ResponseCache>,
    pub rate_limit: RateLimitState,
}

impl AppState {
    /// Assemble state from already-connected components.
    pub fn new(
        config: Config,
        store: EventStore,
        ingest_mode: IngestMode,
        analytics: AnalyticsEngine,
        mirror: Option<AnalyticalStore>,
    ) -> Self {
        let cache = (!config.cache_ttl.is_zero()).then(|| ResponseCache::new(config.cache_ttl));
        let rate_limit = RateLimitState::new(config.rate_limit.clone(), config.api_key.clone());

        Self {
            ingestion: IngestionEngine::new(store),
            analytics: Arc::new(analytics),
            ingest_mode,
            mirror,
            config: Arc::new(config),
            cache,
            rate_limit,
        }
    }

    /// Open the store and connect the queue and mirror described by `config`.
    ///
    /// An enabled but unreachable queue is a startup error. An unreachable
    /// mirror only downgrades analytics to direct store queries. Idle rate
    /// limit buckets are pruned in the background once per limit period.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let store = EventStore::open(&config.database_path, config.store_timeout)
            .with_context(|| format!("Failed to open {}", config.database_path.display()))?;

        let ingest_mode = if config.use_queue {
            let queue = RedisQueue::connect(&config.redis_url)
                .await
                .context("Queueing is enabled but the Redis queue is unreachable")?;
            IngestMode::Queued(Arc::new(queue))
        } else {
            IngestMode::Direct
        };

        let mirror = config.clickhouse.clone().map(AnalyticalStore::new);
        let analytics = AnalyticsEngine::connect(store.clone(), mirror.clone()).await;

        let state = Self::new(config, store, ingest_mode, analytics, mirror);
        let every = state.config.rate_limit.period.max(Duration::from_secs(1));
        state.rate_limit.spawn_cleanup(every);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8000");
        assert_eq!(config.database_path, PathBuf::from("./data/events.db"));
        assert!(!config.use_queue);
        assert!(config.clickhouse.is_none());
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("PULSE_USE_QUEUE", "true"),
            ("CLICKHOUSE_URL", "http://ch:8123"),
            ("CLICKHOUSE_TABLE", "pulse_events"),
            ("CLICKHOUSE_TIMEOUT_SECS", "3"),
            ("PULSE_RATE_LIMIT_REQUESTS", "5"),
            ("PULSE_RATE_LIMIT_PERIOD_SECS", "10"),
            ("PULSE_API_KEY", "k"),
            ("PULSE_CACHE_TTL_SECS", "0"),
        ]))
        .unwrap();

        assert!(config.use_queue);
        let ch = config.clickhouse.unwrap();
        assert_eq!(ch.url, "http://ch:8123");
        assert_eq!(ch.database, "default");
        assert_eq!(ch.table, "pulse_events");
        assert_eq!(ch.timeout, Duration::from_secs(3));
        assert_eq!(config.rate_limit.requests, 5);
        assert_eq!(config.rate_limit.period, Duration::from_secs(10));
        assert_eq!(config.api_key.as_deref(), Some("k"));
        assert!(config.cache_ttl.is_zero());
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(Config::from_lookup(lookup(&[("PULSE_USE_QUEUE", "maybe")])).is_err());
        assert!(Config::from_lookup(lookup(&[("PULSE_STORE_TIMEOUT_MS", "soon")])).is_err());
        assert!(Config::from_lookup(lookup(&[("PULSE_RATE_LIMIT_REQUESTS", "0")])).is_err());
    }

    #[tokio::test]
    async fn test_connect_fails_fast_when_queue_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            database_path: dir.path().join("events.db"),
            use_queue: true,
            redis_url: "redis://127.0.0.1:1/0".to_string(),
            ..Default::default()
        };
        assert!(AppState::connect(config).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_direct_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            database_path: dir.path().join("events.db"),
            ..Default::default()
        };
        let state = AppState::connect(config).await.unwrap();
        assert_eq!(state.ingest_mode.name(), "direct");
        assert!(state.cache.is_some());
    }
}
