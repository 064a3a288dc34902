//! In-process queue with the same semantics as the Redis backend.
//!
//! Items are kept in their encoded form so that encoding and lenient decoding
//! behave exactly as they do on the wire. Nothing survives a restart.

use super::{encode_all, EventQueue};
use crate::Result;
use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use pulse_core::{EventRecord, QueueMessage};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
pub struct MemoryQueue {
    queue: Mutex<VecDeque<String>>,
    dead_letter: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a raw item, as a foreign producer would.
    pub fn push_raw(&self, raw: impl Into<String>) {
        self.queue.lock().push_back(raw.into());
        self.notify.notify_one();
    }

    /// Snapshot of the dead-letter list, decoded.
    pub fn dead_letters(&self) -> Vec<QueueMessage> {
        self.dead_letter
            .lock()
            .iter()
            .map(|raw| QueueMessage::decode(raw))
            .collect()
    }

    fn push_all(&self, items: Vec<String>) {
        let mut queue = self.queue.lock();
        for item in items {
            queue.push_back(item);
            self.notify.notify_one();
        }
    }

    async fn pop_one(&self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(raw) = self.queue.lock().pop_front() {
                return Some(raw);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.queue.lock().pop_front();
            }
        }
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn enqueue(&self, events: &[EventRecord]) -> Result<usize> {
        let payloads = encode_all(events)?;
        self.push_all(payloads);
        counter!("queue_events_enqueued_total").increment(events.len() as u64);
        Ok(events.len())
    }

    async fn requeue(&self, message: &QueueMessage) -> Result<()> {
        self.push_raw(message.encode()?);
        Ok(())
    }

    async fn dequeue(&self, batch_size: usize, timeout: Duration) -> Result<Vec<QueueMessage>> {
        let mut messages = Vec::with_capacity(batch_size);
        while messages.len() < batch_size {
            match self.pop_one(timeout).await {
                Some(raw) => messages.push(QueueMessage::decode(&raw)),
                None => break,
            }
        }
        Ok(messages)
    }

    async fn send_to_dead_letter(&self, message: &QueueMessage) {
        match message.encode() {
            Ok(raw) => {
                self.dead_letter.lock().push_back(raw);
                counter!("queue_dead_letter_total").increment(1);
                tracing::warn!(
                    event_id = message.event_id_hint().unwrap_or("unknown"),
                    retry_count = message.retry_count,
                    "message moved to dead-letter queue"
                );
            }
            Err(e) => tracing::error!("Failed to encode dead-letter message: {}", e),
        }
    }

    async fn queue_size(&self) -> Result<u64> {
        Ok(self.queue.lock().len() as u64)
    }

    async fn dead_letter_size(&self) -> Result<u64> {
        Ok(self.dead_letter.lock().len() as u64)
    }
}
