//! The durable event queue.
//!
//! A FIFO list of [`QueueMessage`] envelopes plus a companion dead-letter
//! list. Delivery is at-least-once: a message popped by a worker that then
//! crashes is lost from the queue, and a message that is re-pushed may be
//! processed twice. The ingestion engine's idempotency makes the latter safe.
//!
//! # Backends
//!
//! - [`RedisQueue`] - Redis lists, for production
//! - [`MemoryQueue`] - in-process, for tests and single-process setups

mod memory;
mod redis;

pub use self::memory::MemoryQueue;
pub use self::redis::{RedisQueue, DEAD_LETTER_KEY, QUEUE_KEY};

use crate::Result;
use async_trait::async_trait;
use pulse_core::{EventRecord, QueueMessage};
use std::time::Duration;

/// Producer and consumer operations on the durable queue.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Append each event, wrapped in a fresh envelope, to the tail.
    ///
    /// Returns the number of events enqueued.
    async fn enqueue(&self, events: &[EventRecord]) -> Result<usize>;

    /// Append an existing envelope to the tail of the main queue.
    async fn requeue(&self, message: &QueueMessage) -> Result<()>;

    /// Pop up to `batch_size` messages from the head.
    ///
    /// Each pop waits at most `timeout`. A partial batch is returned when a
    /// pop times out, and an empty one when nothing arrived at all.
    async fn dequeue(&self, batch_size: usize, timeout: Duration) -> Result<Vec<QueueMessage>>;

    /// Append a message to the dead-letter list.
    ///
    /// Best-effort: failures are logged, never returned.
    async fn send_to_dead_letter(&self, message: &QueueMessage);

    /// Current length of the main queue.
    async fn queue_size(&self) -> Result<u64>;

    /// Current length of the dead-letter list.
    async fn dead_letter_size(&self) -> Result<u64>;
}

/// Encode a batch of records into queue payloads.
pub(crate) fn encode_all(events: &[EventRecord]) -> Result<Vec<String>> {
    events
        .iter()
        .map(|event| Ok(QueueMessage::new(event)?.encode()?))
        .collect()
}
