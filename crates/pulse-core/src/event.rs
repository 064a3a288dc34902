//! Event records and their validation.
//!
//! Two shapes exist for an event:
//!
//! - [`EventInput`] is what producers send. Every field is optional so that a
//!   missing or malformed field can be reported by name instead of failing
//!   the whole payload.
//! - [`EventRecord`] is the validated, immutable unit the pipeline stores.
//!   Text fields are trimmed and the timestamp is normalized to UTC at
//!   microsecond precision.

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::{MAX_BATCH_SIZE, MAX_FIELD_BYTES};

/// A validated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Caller-supplied idempotency key.
    pub event_id: Uuid,
    /// Logical time of the event, used for all windowing.
    pub occurred_at: DateTime<Utc>,
    pub user_id: String,
    pub event_type: String,
    /// Opaque key/value payload.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// An event as received from a producer, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventInput {
    pub event_id: Option<String>,
    pub occurred_at: Option<String>,
    pub user_id: Option<String>,
    pub event_type: Option<String>,
    pub properties: Option<Value>,
}

/// A validation failure for one field of one event in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Position of the event in the submitted batch.
    pub index: usize,
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(index: usize, field: &'static str, message: impl Into<String>) -> Self {
        Self {
            index,
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "events[{}].{}: {}", self.index, self.field, self.message)
    }
}

impl EventInput {
    /// Validate this input, producing an [`EventRecord`].
    ///
    /// `index` is the event's position in its batch and is only used to label
    /// the returned errors. All field problems are reported, not just the first.
    pub fn validate(&self, index: usize) -> std::result::Result<EventRecord, Vec<FieldError>> {
        let mut errors = Vec::new();

        let event_id = match self.event_id.as_deref().map(str::trim) {
            None | Some("") => {
                errors.push(FieldError::new(index, "event_id", "field required"));
                None
            }
            Some(raw) => match Uuid::parse_str(raw) {
                Ok(id) => Some(id),
                Err(e) => {
                    errors.push(FieldError::new(index, "event_id", format!("invalid UUID: {e}")));
                    None
                }
            },
        };

        let occurred_at = match self.occurred_at.as_deref().map(str::trim) {
            None | Some("") => {
                errors.push(FieldError::new(index, "occurred_at", "field required"));
                None
            }
            Some(raw) => match parse_timestamp(raw) {
                Some(ts) => Some(ts),
                None => {
                    errors.push(FieldError::new(
                        index,
                        "occurred_at",
                        format!("invalid ISO-8601 timestamp: '{raw}'"),
                    ));
                    None
                }
            },
        };

        let user_id = clean_text(self.user_id.as_deref())
            .map_err(|msg| errors.push(FieldError::new(index, "user_id", msg)))
            .ok();
        let event_type = clean_text(self.event_type.as_deref())
            .map_err(|msg| errors.push(FieldError::new(index, "event_type", msg)))
            .ok();

        let properties = match &self.properties {
            None | Some(Value::Null) => Some(Map::new()),
            Some(Value::Object(map)) => Some(map.clone()),
            Some(_) => {
                errors.push(FieldError::new(index, "properties", "must be a JSON object"));
                None
            }
        };

        match (event_id, occurred_at, user_id, event_type, properties) {
            (Some(event_id), Some(occurred_at), Some(user_id), Some(event_type), Some(properties))
                if errors.is_empty() =>
            {
                Ok(EventRecord {
                    event_id,
                    occurred_at,
                    user_id,
                    event_type,
                    properties,
                })
            }
            _ => Err(errors),
        }
    }
}

impl From<&EventRecord> for EventInput {
    fn from(record: &EventRecord) -> Self {
        Self {
            event_id: Some(record.event_id.to_string()),
            occurred_at: Some(record.occurred_at.to_rfc3339()),
            user_id: Some(record.user_id.clone()),
            event_type: Some(record.event_type.clone()),
            properties: Some(Value::Object(record.properties.clone())),
        }
    }
}

/// Validate a producer batch.
///
/// The batch must hold between 1 and [`MAX_BATCH_SIZE`] events. Every event is
/// validated and all field errors are returned together.
pub fn validate_batch(inputs: &[EventInput]) -> Result<Vec<EventRecord>> {
    if inputs.is_empty() {
        return Err(Error::InvalidBatch("batch must contain at least 1 event".to_string()));
    }
    if inputs.len() > MAX_BATCH_SIZE {
        return Err(Error::InvalidBatch(format!(
            "batch size {} exceeds the maximum of {}",
            inputs.len(),
            MAX_BATCH_SIZE
        )));
    }

    let mut records = Vec::with_capacity(inputs.len());
    let mut errors = Vec::new();
    for (index, input) in inputs.iter().enumerate() {
        match input.validate(index) {
            Ok(record) => records.push(record),
            Err(mut errs) => errors.append(&mut errs),
        }
    }

    if errors.is_empty() {
        Ok(records)
    } else {
        Err(Error::InvalidEvents(errors))
    }
}

/// Trim a required text field and enforce its length bounds.
fn clean_text(value: Option<&str>) -> std::result::Result<String, String> {
    let Some(value) = value else {
        return Err("field required".to_string());
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("field cannot be empty or whitespace".to_string());
    }
    if trimmed.len() > MAX_FIELD_BYTES {
        return Err(format!(
            "must be at most {} bytes, got {}",
            MAX_FIELD_BYTES,
            trimmed.len()
        ));
    }
    Ok(trimmed.to_string())
}

/// Parse an RFC 3339 timestamp. Timestamps without an offset are taken as UTC.
/// Anything finer than a microsecond is dropped.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let ts = match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(_) => ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())?
            .and_utc(),
    };
    Some(ts.trunc_subsecs(6))
}
