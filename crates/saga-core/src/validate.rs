//! Event shape validation and normalization before append.

use chrono::Utc;
use serde::de::IgnoredAny;
use thiserror::Error;

use crate::model::{NewEvent, truncate_to_millis};

/// Maximum length of any identifier or metadata field, in bytes.
pub const MAX_FIELD_BYTES: usize = 256;

/// Maximum payload size, in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Reasons an event is rejected before it reaches the journal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EventValidationError {
    /// A required field is blank.
    #[error("{field} is required")]
    MissingField {
        /// Name of the blank field.
        field: &'static str,
    },

    /// A field exceeds [`MAX_FIELD_BYTES`].
    #[error("{field} exceeds {max} bytes")]
    FieldTooLong {
        /// Name of the oversized field.
        field: &'static str,
        /// The limit.
        max: usize,
    },

    /// The payload exceeds [`MAX_PAYLOAD_BYTES`].
    #[error("payload is {size} bytes, max {max}")]
    PayloadTooLarge {
        /// Actual size.
        size: usize,
        /// The limit.
        max: usize,
    },

    /// The payload is not a JSON document.
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(String),

    /// A domain rule was violated.
    #[error("{0}")]
    Rule(String),
}

/// Enforces shape rules and fills defaults before the journal hashes an
/// event.
pub trait EventValidator: Send + Sync {
    /// Returns the normalized event or the reason it was rejected.
    ///
    /// The returned event must carry a timestamp.
    fn validate_for_append(&self, event: NewEvent) -> Result<NewEvent, EventValidationError>;
}

/// Field-level validation shared by every event type.
#[derive(Debug, Clone, Default)]
pub struct DefaultEventValidator {
    _private: (),
}

impl DefaultEventValidator {
    /// Creates the validator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

fn normalize_field(
    value: &mut String,
    field: &'static str,
    required: bool,
) -> Result<(), EventValidationError> {
    let trimmed = value.trim();
    if trimmed.len() != value.len() {
        *value = trimmed.to_string();
    }
    if required && value.is_empty() {
        return Err(EventValidationError::MissingField { field });
    }
    if value.len() > MAX_FIELD_BYTES {
        return Err(EventValidationError::FieldTooLong {
            field,
            max: MAX_FIELD_BYTES,
        });
    }
    Ok(())
}

impl EventValidator for DefaultEventValidator {
    fn validate_for_append(&self, mut event: NewEvent) -> Result<NewEvent, EventValidationError> {
        normalize_field(&mut event.campaign_id, "campaign_id", true)?;
        normalize_field(&mut event.event_type, "event_type", true)?;
        normalize_field(&mut event.actor_type, "actor_type", true)?;
        normalize_field(&mut event.actor_id, "actor_id", false)?;
        normalize_field(&mut event.session_id, "session_id", false)?;
        normalize_field(&mut event.request_id, "request_id", false)?;
        normalize_field(&mut event.invocation_id, "invocation_id", false)?;
        normalize_field(&mut event.entity_type, "entity_type", false)?;
        normalize_field(&mut event.entity_id, "entity_id", false)?;
        normalize_field(&mut event.system_id, "system_id", false)?;
        normalize_field(&mut event.system_version, "system_version", false)?;
        normalize_field(&mut event.correlation_id, "correlation_id", false)?;
        normalize_field(&mut event.causation_id, "causation_id", false)?;

        if !event.entity_type.is_empty() && event.entity_id.is_empty() {
            return Err(EventValidationError::Rule(
                "entity_id is required when entity_type is set".to_string(),
            ));
        }

        if event.payload_json.iter().all(u8::is_ascii_whitespace) {
            event.payload_json = b"{}".to_vec();
        }
        if event.payload_json.len() > MAX_PAYLOAD_BYTES {
            return Err(EventValidationError::PayloadTooLarge {
                size: event.payload_json.len(),
                max: MAX_PAYLOAD_BYTES,
            });
        }
        serde_json::from_slice::<IgnoredAny>(&event.payload_json)
            .map_err(|e| EventValidationError::InvalidPayload(e.to_string()))?;

        event.timestamp = Some(truncate_to_millis(event.timestamp.unwrap_or_else(Utc::now)));
        Ok(event)
    }
}
