//! Error types shared across the Pulse crates.

use thiserror::Error;

use crate::event::FieldError;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while validating or decoding events.
#[derive(Error, Debug)]
pub enum Error {
    /// A single field failed validation.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// The batch as a whole is unacceptable (empty or oversized).
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// One or more events in a batch failed validation.
    #[error("{} invalid field(s) in batch", .0.len())]
    InvalidEvents(Vec<FieldError>),

    /// A dequeued message could not be turned back into an event.
    #[error("malformed queue message: {0}")]
    MalformedMessage(String),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_field_display() {
        let err = Error::InvalidField {
            field: "user_id",
            reason: "must not be empty".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("user_id"));
        assert!(msg.contains("must not be empty"));
    }

    #[test]
    fn test_invalid_events_display_counts_fields() {
        let err = Error::InvalidEvents(vec![
            FieldError::new(0, "event_id", "missing"),
            FieldError::new(3, "user_id", "missing"),
        ]);
        assert_eq!(err.to_string(), "2 invalid field(s) in batch");
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }
}
