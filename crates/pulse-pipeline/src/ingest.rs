//! The ingestion engine.
//!
//! Both the synchronous API path and the queue worker hand validated batches
//! to [`IngestionEngine::ingest`]. Deduplication is delegated to the store's
//! primary key, so repeated delivery of the same event is harmless.

use crate::store::EventStore;
use crate::Result;
use metrics::counter;
use pulse_core::EventRecord;
use serde::Serialize;

/// Counts returned by one ingest call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// Rows newly written.
    pub inserted: usize,
    /// Rows whose `event_id` was already stored.
    pub duplicates: usize,
}

impl IngestOutcome {
    pub fn total(&self) -> usize {
        self.inserted + self.duplicates
    }
}

/// Idempotent batch writer over the [`EventStore`].
#[derive(Clone)]
pub struct IngestionEngine {
    store: EventStore,
}

impl IngestionEngine {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Persist `events`, skipping ids already stored.
    ///
    /// An empty batch returns `{0, 0}` without touching the store. A store
    /// failure surfaces as [`crate::Error::StorageUnavailable`].
    pub async fn ingest(&self, events: Vec<EventRecord>) -> Result<IngestOutcome> {
        if events.is_empty() {
            return Ok(IngestOutcome::default());
        }

        let submitted = events.len();
        let outcome = self.store.insert_batch(events).await.map_err(|e| {
            tracing::error!(submitted, "Failed to ingest batch: {}", e);
            e
        })?;

        counter!("ingest_events_total").increment(submitted as u64);
        counter!("ingest_events_inserted_total").increment(outcome.inserted as u64);
        counter!("ingest_events_duplicate_total").increment(outcome.duplicates as u64);

        tracing::info!(
            submitted,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            "events ingested"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;
    use uuid::Uuid;

    fn event(user: &str) -> EventRecord {
        EventRecord {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            user_id: user.to_string(),
            event_type: "click".to_string(),
            properties: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_ingest_twice_reports_duplicate() {
        let engine = IngestionEngine::new(EventStore::open_in_memory().unwrap());
        let e = event("alice");

        let first = engine.ingest(vec![e.clone()]).await.unwrap();
        assert_eq!(first, IngestOutcome { inserted: 1, duplicates: 0 });

        let second = engine.ingest(vec![e]).await.unwrap();
        assert_eq!(second, IngestOutcome { inserted: 0, duplicates: 1 });
        assert_eq!(second.total(), 1);
    }

    #[tokio::test]
    async fn test_ingest_empty_batch_does_not_touch_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let store = EventStore::open(&path, std::time::Duration::from_millis(100)).unwrap();

        // A missing table would fail any store access.
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE events")
            .unwrap();

        let engine = IngestionEngine::new(store);
        assert_eq!(engine.ingest(Vec::new()).await.unwrap(), IngestOutcome::default());
        assert!(matches!(
            engine.ingest(vec![event("bob")]).await,
            Err(crate::Error::StorageUnavailable(_))
        ));
    }
}
