//! Core types, validation, and shared utilities for the Pulse event pipeline.
//!
//! This crate provides:
//! - The immutable [`EventRecord`] and the lenient [`EventInput`] transport shape
//! - Batch and field validation shared by the HTTP API, the importer and the worker
//! - The [`QueueMessage`] envelope used on the durable queue
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
mod message;
pub mod metrics;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Maximum number of events accepted in a single ingestion batch.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Maximum length of `user_id` and `event_type`, in bytes, after trimming.
pub const MAX_FIELD_BYTES: usize = 255;

/// Number of failed parse attempts after which a queue message is dead-lettered.
pub const MAX_RETRIES: u32 = 3;

pub use error::{Error, Result};
pub use event::{validate_batch, EventInput, EventRecord, FieldError};
pub use message::QueueMessage;
