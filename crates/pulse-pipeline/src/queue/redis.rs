//! Redis-backed queue: two lists, pushed at the tail and popped at the head.

use super::{encode_all, EventQueue};
use crate::Result;
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, RedisResult};
use async_trait::async_trait;
use metrics::counter;
use pulse_core::{EventRecord, QueueMessage};
use std::time::Duration;

/// Main queue list.
pub const QUEUE_KEY: &str = "event_queue";

/// Dead-letter list.
pub const DEAD_LETTER_KEY: &str = "event_dlq";

/// Queue over a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisQueue {
    conn: MultiplexedConnection,
}

impl RedisQueue {
    /// Connect to `url` and verify the server answers.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;

        tracing::info!("Connected to Redis queue at {}", redact(url));
        Ok(Self { conn })
    }

    async fn pop_one(&self, timeout: Duration) -> RedisResult<Option<String>> {
        let mut conn = self.conn.clone();
        if timeout.is_zero() {
            // BLPOP with 0 would block forever
            return conn.lpop(QUEUE_KEY, None).await;
        }
        let popped: Option<(String, String)> = ::redis::cmd("BLPOP")
            .arg(QUEUE_KEY)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, raw)| raw))
    }
}

#[async_trait]
impl EventQueue for RedisQueue {
    async fn enqueue(&self, events: &[EventRecord]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let payloads = encode_all(events)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(QUEUE_KEY, payloads).await?;

        counter!("queue_events_enqueued_total").increment(events.len() as u64);
        tracing::debug!(count = events.len(), "events enqueued");
        Ok(events.len())
    }

    async fn requeue(&self, message: &QueueMessage) -> Result<()> {
        let raw = message.encode()?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(QUEUE_KEY, raw).await?;
        Ok(())
    }

    async fn dequeue(&self, batch_size: usize, timeout: Duration) -> Result<Vec<QueueMessage>> {
        let mut messages = Vec::with_capacity(batch_size);
        while messages.len() < batch_size {
            match self.pop_one(timeout).await {
                Ok(Some(raw)) => messages.push(QueueMessage::decode(&raw)),
                Ok(None) => break,
                Err(e) if messages.is_empty() => return Err(e.into()),
                Err(e) => {
                    // Keep what was already popped; it is no longer on the list.
                    tracing::warn!(
                        popped = messages.len(),
                        "Queue error mid-batch, returning partial batch: {}",
                        e
                    );
                    break;
                }
            }
        }
        Ok(messages)
    }

    async fn send_to_dead_letter(&self, message: &QueueMessage) {
        let raw = match message.encode() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("Failed to encode dead-letter message: {}", e);
                return;
            }
        };
        let mut conn = self.conn.clone();
        let pushed: RedisResult<i64> = conn.rpush(DEAD_LETTER_KEY, raw).await;
        match pushed {
            Ok(_) => {
                counter!("queue_dead_letter_total").increment(1);
                tracing::warn!(
                    event_id = message.event_id_hint().unwrap_or("unknown"),
                    retry_count = message.retry_count,
                    "message moved to dead-letter queue"
                );
            }
            Err(e) => tracing::error!(
                event_id = message.event_id_hint().unwrap_or("unknown"),
                "Failed to push to dead-letter queue: {}",
                e
            ),
        }
    }

    async fn queue_size(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(QUEUE_KEY).await?)
    }

    async fn dead_letter_size(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(DEAD_LETTER_KEY).await?)
    }
}

/// Strip credentials from a connection URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
