//! The envelope carried on the durable queue.
//!
//! Every queued item is a JSON object `{"payload": <event>, "retry_count": n}`.
//! Decoding is lenient: older producers pushed the flat event object with an
//! inline `retry_count`, and anything that is not JSON at all is kept as a raw
//! string payload so that it can still be retried and dead-lettered.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::event::{EventInput, EventRecord};
use crate::MAX_RETRIES;

/// A queued event plus its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub payload: Value,
    #[serde(default)]
    pub retry_count: u32,
}

impl QueueMessage {
    /// Wrap a validated record in a fresh envelope.
    pub fn new(record: &EventRecord) -> Result<Self> {
        Ok(Self {
            payload: serde_json::to_value(record)?,
            retry_count: 0,
        })
    }

    /// Serialize to the wire form pushed onto the queue.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a raw queue item. Never fails.
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(mut map)) => {
                let retry_count = map
                    .remove("retry_count")
                    .and_then(|v| v.as_u64())
                    .map(|n| n.min(u32::MAX as u64) as u32)
                    .unwrap_or(0);
                let payload = match map.remove("payload") {
                    Some(payload) => payload,
                    None => Value::Object(map),
                };
                Self {
                    payload,
                    retry_count,
                }
            }
            _ => Self {
                payload: Value::String(raw.to_string()),
                retry_count: 0,
            },
        }
    }

    /// Turn the payload back into a validated event.
    pub fn parse_event(&self) -> Result<EventRecord> {
        let input: EventInput = serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        input.validate(0).map_err(|errors| {
            let detail = errors
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            Error::MalformedMessage(detail)
        })
    }

    /// The same payload with one more failed attempt recorded.
    pub fn retried(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            retry_count: self.retry_count.saturating_add(1),
        }
    }

    /// Whether the message has used up its attempts.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= MAX_RETRIES
    }

    /// Best-effort event id for log lines.
    pub fn event_id_hint(&self) -> Option<&str> {
        self.payload.get("event_id").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> EventRecord {
        let input: EventInput = serde_json::from_value(json!({
            "event_id": "0b6a3f52-6a4c-4b8e-9a1f-5d2f0e7c9a11",
            "occurred_at": "2024-03-05T08:15:00Z",
            "user_id": "u1",
            "event_type": "signup",
            "properties": {"plan": "pro"}
        }))
        .unwrap();
        input.validate(0).unwrap()
    }

    #[test]
    fn test_encoded_message_parses_back() {
        let msg = QueueMessage::new(&record()).unwrap();
        let decoded = QueueMessage::decode(&msg.encode().unwrap());
        assert_eq!(decoded.retry_count, 0);
        assert_eq!(decoded.parse_event().unwrap(), record());
        assert_eq!(
            decoded.event_id_hint(),
            Some("0b6a3f52-6a4c-4b8e-9a1f-5d2f0e7c9a11")
        );
    }

    #[test]
    fn test_decode_legacy_flat_payload() {
        let raw = json!({
            "event_id": "0b6a3f52-6a4c-4b8e-9a1f-5d2f0e7c9a11",
            "occurred_at": "2024-03-05T08:15:00Z",
            "user_id": "u1",
            "event_type": "signup",
            "retry_count": 2
        })
        .to_string();

        let msg = QueueMessage::decode(&raw);
        assert_eq!(msg.retry_count, 2);
        assert!(msg.payload.get("retry_count").is_none());
        assert_eq!(msg.parse_event().unwrap().event_type, "signup");
    }

    #[test]
    fn test_decode_garbage_keeps_raw_text() {
        let msg = QueueMessage::decode("definitely not json");
        assert_eq!(msg.payload, Value::String("definitely not json".to_string()));
        assert_eq!(msg.retry_count, 0);
        assert!(matches!(msg.parse_event(), Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_invalid_payload_is_malformed() {
        let msg = QueueMessage::decode(r#"{"payload": {"user_id": "u1"}, "retry_count": 1}"#);
        let err = msg.parse_event().unwrap_err();
        assert!(err.to_string().contains("event_id"));
    }

    #[test]
    fn test_retries_exhaust_at_limit() {
        let mut msg = QueueMessage::decode("garbage");
        for _ in 0..MAX_RETRIES - 1 {
            msg = msg.retried();
            assert!(!msg.is_exhausted());
        }
        msg = msg.retried();
        assert!(msg.is_exhausted());
        assert_eq!(msg.retry_count, MAX_RETRIES);
    }
}
