//! The queue-consuming batch processor.
//!
//! Each iteration pops up to `batch_size` messages, parses them, ingests the
//! parsed events as one batch and mirrors them. Messages that fail to parse
//! are re-queued with an incremented retry count until they exhaust
//! [`pulse_core::MAX_RETRIES`], at which point they go to the dead-letter
//! list. A batch whose store write fails is dead-lettered as a whole.

use crate::ingest::IngestionEngine;
use crate::mirror::{sync_best_effort, AnalyticalStore};
use crate::queue::EventQueue;
use crate::Result;
use metrics::{counter, gauge};
use pulse_core::{EventRecord, QueueMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tunables for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum messages per batch.
    pub batch_size: usize,
    /// Per-pop wait when the queue is empty.
    pub dequeue_timeout: Duration,
    /// Sleep after an empty dequeue.
    pub idle_sleep: Duration,
    /// Sleep after the queue could not be reached.
    pub error_backoff: Duration,
    /// How often queue depth gauges are refreshed.
    pub depth_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            dequeue_timeout: Duration::from_secs(5),
            idle_sleep: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            depth_interval: Duration::from_secs(30),
        }
    }
}

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Nothing was dequeued.
    Empty,
    /// Parsed events were committed (possibly zero of them).
    Committed,
    /// The store write failed and the parsed messages were dead-lettered.
    PoisonBatch,
}

/// What happened to one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub parsed: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub mirrored: bool,
    pub outcome: BatchOutcome,
}

impl BatchReport {
    fn empty() -> Self {
        Self {
            received: 0,
            parsed: 0,
            inserted: 0,
            duplicates: 0,
            requeued: 0,
            dead_lettered: 0,
            mirrored: false,
            outcome: BatchOutcome::Empty,
        }
    }
}

/// Moves events from the queue into the store and mirror.
pub struct BatchProcessor {
    queue: Arc<dyn EventQueue>,
    engine: IngestionEngine,
    mirror: Option<AnalyticalStore>,
    config: WorkerConfig,
}

impl BatchProcessor {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        engine: IngestionEngine,
        mirror: Option<AnalyticalStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            engine,
            mirror,
            config,
        }
    }

    /// Handle one dequeued batch.
    ///
    /// Never fails: every message ends up committed, re-queued or
    /// dead-lettered, and the report says which.
    pub async fn process_batch(&self, messages: Vec<QueueMessage>) -> BatchReport {
        let mut report = BatchReport::empty();
        report.received = messages.len();
        if messages.is_empty() {
            return report;
        }

        let mut events: Vec<EventRecord> = Vec::with_capacity(messages.len());
        let mut parsed_messages: Vec<QueueMessage> = Vec::with_capacity(messages.len());

        for message in messages {
            match message.parse_event() {
                Ok(event) => {
                    events.push(event);
                    parsed_messages.push(message);
                }
                Err(e) => {
                    let retried = message.retried();
                    tracing::warn!(
                        event_id = message.event_id_hint().unwrap_or("unknown"),
                        retry_count = retried.retry_count,
                        "Failed to parse queued event: {}",
                        e
                    );
                    if self.retry_or_dead_letter(retried).await {
                        report.requeued += 1;
                    } else {
                        report.dead_lettered += 1;
                    }
                }
            }
        }

        report.parsed = events.len();
        counter!("worker_batches_total").increment(1);

        match self.engine.ingest(events.clone()).await {
            Ok(outcome) => {
                report.inserted = outcome.inserted;
                report.duplicates = outcome.duplicates;
                report.outcome = BatchOutcome::Committed;
                report.mirrored = sync_best_effort(self.mirror.as_ref(), &events).await;
            }
            Err(e) => {
                tracing::error!(
                    batch = parsed_messages.len(),
                    "Batch write failed, moving batch to dead-letter queue: {}",
                    e
                );
                counter!("worker_poison_batches_total").increment(1);
                for message in &parsed_messages {
                    self.queue.send_to_dead_letter(message).await;
                }
                report.dead_lettered += parsed_messages.len();
                report.outcome = BatchOutcome::PoisonBatch;
            }
        }

        report
    }

    /// Re-queue a message that failed to parse, or dead-letter it once its
    /// retries are spent. Returns `true` if it went back on the queue.
    async fn retry_or_dead_letter(&self, message: QueueMessage) -> bool {
        if message.is_exhausted() {
            self.queue.send_to_dead_letter(&message).await;
            return false;
        }
        match self.queue.requeue(&message).await {
            Ok(()) => {
                counter!("queue_messages_requeued_total").increment(1);
                true
            }
            Err(e) => {
                tracing::error!("Failed to requeue message, dead-lettering it: {}", e);
                self.queue.send_to_dead_letter(&message).await;
                false
            }
        }
    }

    /// Dequeue and process one batch.
    pub async fn run_once(&self) -> Result<BatchReport> {
        let messages = self
            .queue
            .dequeue(self.config.batch_size, self.config.dequeue_timeout)
            .await?;
        Ok(self.process_batch(messages).await)
    }

    /// Loop until `running` is cleared.
    ///
    /// The flag is checked between batches, so a batch in flight is always
    /// finished before returning.
    pub async fn run(&self, running: Arc<AtomicBool>) {
        tracing::info!(
            batch_size = self.config.batch_size,
            timeout_secs = self.config.dequeue_timeout.as_secs_f64(),
            mirror = self.mirror.is_some(),
            "Queue worker started"
        );

        let mut last_depth_report: Option<Instant> = None;

        while running.load(Ordering::SeqCst) {
            let depth_due = last_depth_report
                .map_or(true, |t| t.elapsed() >= self.config.depth_interval);
            if depth_due {
                self.report_depths().await;
                last_depth_report = Some(Instant::now());
            }

            match self.run_once().await {
                Ok(report) if report.outcome == BatchOutcome::Empty => {
                    tokio::time::sleep(self.config.idle_sleep).await;
                }
                Ok(report) => {
                    tracing::info!(
                        received = report.received,
                        inserted = report.inserted,
                        duplicates = report.duplicates,
                        requeued = report.requeued,
                        dead_lettered = report.dead_lettered,
                        "batch processed"
                    );
                }
                Err(e) => {
                    tracing::error!("Queue unavailable, backing off: {}", e);
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }

        tracing::info!("Queue worker stopped");
    }

    async fn report_depths(&self) {
        match self.queue.queue_size().await {
            Ok(n) => gauge!("queue_depth").set(n as f64),
            Err(e) => tracing::debug!("Failed to read queue depth: {}", e),
        }
        match self.queue.dead_letter_size().await {
            Ok(n) => gauge!("dead_letter_depth").set(n as f64),
            Err(e) => tracing::debug!("Failed to read dead-letter depth: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::ClickHouseConfig;
    use crate::queue::MemoryQueue;
    use crate::store::EventStore;
    use chrono::Utc;
    use pulse_core::MAX_RETRIES;
    use serde_json::Map;
    use uuid::Uuid;

    fn event(user: &str) -> EventRecord {
        EventRecord {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            user_id: user.into(),
            event_type: "click".into(),
            properties: Map::new(),
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            batch_size: 100,
            dequeue_timeout: Duration::from_millis(10),
            idle_sleep: Duration::from_millis(5),
            error_backoff: Duration::from_millis(5),
            depth_interval: Duration::from_secs(60),
        }
    }

    fn processor(queue: Arc<MemoryQueue>, store: EventStore) -> BatchProcessor {
        BatchProcessor::new(queue, IngestionEngine::new(store), None, fast_config())
    }

    #[tokio::test]
    async fn test_queued_events_reach_the_store() {
        let queue = Arc::new(MemoryQueue::new());
        let store = EventStore::open_in_memory().unwrap();
        let worker = processor(Arc::clone(&queue), store.clone());

        let events = vec![event("a"), event("b"), event("c")];
        queue.enqueue(&events).await.unwrap();
        // Redelivery of one event
        queue.enqueue(&events[..1]).await.unwrap();

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.outcome, BatchOutcome::Committed);
        assert_eq!((report.received, report.inserted, report.duplicates), (4, 3, 1));
        assert!(!report.mirrored);
        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(store.get(events[1].event_id).await.unwrap(), Some(events[1].clone()));
    }

    #[tokio::test]
    async fn test_empty_dequeue() {
        let queue = Arc::new(MemoryQueue::new());
        let worker = processor(queue, EventStore::open_in_memory().unwrap());

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.outcome, BatchOutcome::Empty);
        assert_eq!(report.received, 0);
    }

    #[tokio::test]
    async fn test_malformed_message_is_retried_then_dead_lettered_once() {
        let queue = Arc::new(MemoryQueue::new());
        let store = EventStore::open_in_memory().unwrap();
        let worker = processor(Arc::clone(&queue), store.clone());

        queue.push_raw(r#"{"payload": {"user_id": "no-id"}, "retry_count": 0}"#);
        queue.enqueue(&[event("good")]).await.unwrap();

        let mut attempts = 0;
        loop {
            let report = worker.run_once().await.unwrap();
            if report.outcome == BatchOutcome::Empty {
                break;
            }
            if report.requeued + report.dead_lettered > 0 {
                attempts += 1;
            }
        }

        assert_eq!(attempts, MAX_RETRIES);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(queue.queue_size().await.unwrap(), 0);

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, MAX_RETRIES);
        assert_eq!(dead[0].payload["user_id"], "no-id");
    }

    #[tokio::test]
    async fn test_bad_message_does_not_block_the_rest_of_the_batch() {
        let queue = Arc::new(MemoryQueue::new());
        let store = EventStore::open_in_memory().unwrap();
        let worker = processor(Arc::clone(&queue), store.clone());

        queue.enqueue(&[event("a")]).await.unwrap();
        queue.push_raw("{{{ not json");
        queue.enqueue(&[event("b")]).await.unwrap();

        let report = worker.run_once().await.unwrap();
        assert_eq!((report.received, report.parsed, report.requeued), (3, 2, 1));
        assert_eq!(report.inserted, 2);
        assert_eq!(queue.queue_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_dead_letters_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let store = EventStore::open(&path, Duration::from_millis(100)).unwrap();
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE events")
            .unwrap();

        let queue = Arc::new(MemoryQueue::new());
        let worker = processor(Arc::clone(&queue), store);
        queue.enqueue(&[event("a"), event("b")]).await.unwrap();
        queue.push_raw("garbage");

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.outcome, BatchOutcome::PoisonBatch);
        assert_eq!((report.dead_lettered, report.requeued), (2, 1));

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 2);
        assert!(dead.iter().all(|m| m.parse_event().is_ok()));
        // Only the unparseable message is left for a retry.
        assert_eq!(queue.queue_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mirror_failure_still_commits() {
        let queue = Arc::new(MemoryQueue::new());
        let store = EventStore::open_in_memory().unwrap();
        let mirror = AnalyticalStore::new(ClickHouseConfig {
            url: "http://127.0.0.1:9".into(),
            ..Default::default()
        });
        let worker = BatchProcessor::new(
            Arc::clone(&queue) as Arc<dyn EventQueue>,
            IngestionEngine::new(store.clone()),
            Some(mirror),
            fast_config(),
        );

        let events = vec![event("a"), event("b")];
        queue.enqueue(&events).await.unwrap();

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.outcome, BatchOutcome::Committed);
        assert!(!report.mirrored);
        assert_eq!(report.inserted, 2);
        assert_eq!(store.count().await.unwrap(), 2);
        assert!(queue.dead_letters().is_empty());
        assert_eq!(queue.queue_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stalled_mirror_does_not_wedge_the_worker() {
        let queue = Arc::new(MemoryQueue::new());
        let store = EventStore::open_in_memory().unwrap();
        let mirror = crate::mirror::tests::stalled_store(Duration::from_millis(200)).await;
        let worker = BatchProcessor::new(
            Arc::clone(&queue) as Arc<dyn EventQueue>,
            IngestionEngine::new(store.clone()),
            Some(mirror),
            fast_config(),
        );

        queue.enqueue(&[event("a")]).await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), worker.run_once())
            .await
            .expect("worker should give up on the mirror")
            .unwrap();
        assert_eq!(report.outcome, BatchOutcome::Committed);
        assert!(!report.mirrored);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_when_flag_cleared() {
        let queue = Arc::new(MemoryQueue::new());
        let store = EventStore::open_in_memory().unwrap();
        let worker = Arc::new(processor(Arc::clone(&queue), store.clone()));
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let worker = Arc::clone(&worker);
            let running = Arc::clone(&running);
            tokio::spawn(async move { worker.run(running).await })
        };

        queue.enqueue(&[event("a"), event("b")]).await.unwrap();
        for _ in 0..200 {
            if store.count().await.unwrap() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        running.store(false, Ordering::SeqCst);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }
}
