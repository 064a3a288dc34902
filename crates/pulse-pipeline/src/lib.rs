//! Pulse ingestion, queueing and analytics pipeline.
//!
//! # Modules
//!
//! - [`store`] - SQLite system of record (schema, idempotent inserts, aggregate queries)
//! - [`ingest`] - The idempotent ingestion engine
//! - [`queue`] - Durable queue trait with Redis and in-memory backends
//! - [`mirror`] - ClickHouse analytical mirror
//! - [`analytics`] - DAU, top events and retention with backend fallback
//! - [`worker`] - Queue-consuming batch processor
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   enqueue    ┌──────────────┐
//! │   Producer   │─────────────▶│ EventQueue   │  Redis lists (main + DLQ)
//! └──────┬───────┘              └──────┬───────┘
//!        │ direct                      │ dequeue
//!        │                             ▼
//!        │                      ┌──────────────┐
//!        │                      │BatchProcessor│  parse, retry, dead-letter
//!        │                      └──────┬───────┘
//!        ▼                             ▼
//! ┌─────────────────────────────────────────────┐
//! │              IngestionEngine                │
//! └──────────────────────┬──────────────────────┘
//!                        ▼
//! ┌──────────────┐  sync  ┌──────────────────┐
//! │  EventStore  │───────▶│ AnalyticalStore  │
//! │   (SQLite)   │        │   (ClickHouse)   │
//! └──────┬───────┘        └────────┬─────────┘
//!        └──────────┬──────────────┘
//!                   ▼
//!          ┌─────────────────┐
//!          │ AnalyticsEngine │
//!          └─────────────────┘
//! ```
//!
//! SQLite is the source of truth; ClickHouse is a derived, best-effort copy.

pub mod analytics;
pub mod error;
pub mod ingest;
pub mod mirror;
pub mod queue;
pub mod store;
pub mod worker;

pub use error::{Error, Result};

pub use analytics::{
    AnalyticsEngine, DailyActiveUsers, EventTypeCount, QueryBackend, RetentionReport,
    RetentionWindow,
};
pub use ingest::{IngestOutcome, IngestionEngine};
pub use mirror::{sync_best_effort, AnalyticalStore, ClickHouseConfig};
pub use queue::{EventQueue, MemoryQueue, RedisQueue};
pub use store::EventStore;
pub use worker::{BatchOutcome, BatchProcessor, BatchReport, WorkerConfig};
