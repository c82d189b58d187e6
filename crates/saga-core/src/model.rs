//! Journal and outbox data model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// An event submitted for append.
///
/// Everything the journal derives (sequence, hashes, signature) is absent
/// here; the validator fills in a missing timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewEvent {
    pub campaign_id: String,
    pub event_type: String,
    /// `None` lets the validator default it to "now".
    pub timestamp: Option<DateTime<Utc>>,
    pub session_id: String,
    pub request_id: String,
    pub invocation_id: String,
    pub actor_type: String,
    pub actor_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub system_id: String,
    pub system_version: String,
    pub correlation_id: String,
    pub causation_id: String,
    /// Domain-defined JSON document, hashed as raw bytes.
    pub payload_json: Vec<u8>,
}

impl NewEvent {
    /// Creates an event with the required fields set and everything else
    /// blank.
    #[must_use]
    pub fn new(
        campaign_id: impl Into<String>,
        event_type: impl Into<String>,
        actor_type: impl Into<String>,
        payload_json: Vec<u8>,
    ) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            event_type: event_type.into(),
            actor_type: actor_type.into(),
            payload_json,
            ..Self::default()
        }
    }

    /// Sets the event timestamp (builder pattern).
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the session id (builder pattern).
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Sets the acting principal (builder pattern).
    #[must_use]
    pub fn with_actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = actor_id.into();
        self
    }

    /// Sets the entity the event is about (builder pattern).
    #[must_use]
    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = entity_type.into();
        self.entity_id = entity_id.into();
        self
    }

    /// Sets the request id (builder pattern).
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// An event as stored in the journal. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub campaign_id: String,
    /// 1-based, dense per campaign.
    pub seq: u64,
    pub event_type: String,
    /// Millisecond precision.
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub request_id: String,
    pub invocation_id: String,
    pub actor_type: String,
    pub actor_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub system_id: String,
    pub system_version: String,
    pub correlation_id: String,
    pub causation_id: String,
    #[serde(skip)]
    pub payload_json: Vec<u8>,
    /// Content hash over every field above except `seq`.
    pub hash: String,
    /// Chain hash of `seq - 1`, empty for the first event.
    pub prev_hash: String,
    pub chain_hash: String,
    pub signature: String,
    pub signature_key_id: String,
}

impl Event {
    /// Builds an unsequenced, unhashed event from a validated submission.
    #[must_use]
    pub fn from_new(event: NewEvent) -> Self {
        let timestamp = truncate_to_millis(event.timestamp.unwrap_or_else(Utc::now));
        Self {
            campaign_id: event.campaign_id,
            seq: 0,
            event_type: event.event_type,
            timestamp,
            session_id: event.session_id,
            request_id: event.request_id,
            invocation_id: event.invocation_id,
            actor_type: event.actor_type,
            actor_id: event.actor_id,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            system_id: event.system_id,
            system_version: event.system_version,
            correlation_id: event.correlation_id,
            causation_id: event.causation_id,
            payload_json: event.payload_json,
            hash: String::new(),
            prev_hash: String::new(),
            chain_hash: String::new(),
            signature: String::new(),
            signature_key_id: String::new(),
        }
    }
}

/// Truncates a timestamp to whole milliseconds.
#[must_use]
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(ts.timestamp_millis())
}

/// Converts Unix milliseconds to a UTC timestamp, clamping out-of-range
/// values to the epoch.
#[must_use]
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}

/// Processing status of a projection-apply outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Failed,
    Dead,
}

impl OutboxStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Pending, Self::Processing, Self::Failed, Self::Dead];

    /// The persisted string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown outbox status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown outbox status: {0:?}")]
pub struct UnknownOutboxStatus(pub String);

impl FromStr for OutboxStatus {
    type Err = UnknownOutboxStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(UnknownOutboxStatus(other.to_string())),
        }
    }
}

/// A projection-apply work item for one journal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboxRow {
    pub campaign_id: String,
    pub seq: u64,
    pub event_type: String,
    pub status: OutboxStatus,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    /// Empty unless a prior attempt failed.
    pub last_error: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_drops_sub_millisecond_precision() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let truncated = truncate_to_millis(ts);
        assert_eq!(truncated.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(truncate_to_millis(truncated), truncated);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in OutboxStatus::ALL {
            assert_eq!(status.as_str().parse::<OutboxStatus>(), Ok(status));
        }
        assert!("done".parse::<OutboxStatus>().is_err());
        assert!("Pending".parse::<OutboxStatus>().is_err());
    }

    #[test]
    fn from_new_defaults_missing_timestamp() {
        let event = Event::from_new(NewEvent::new("c", "t", "user", b"{}".to_vec()));
        assert_eq!(event.seq, 0);
        assert_eq!(event.timestamp.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
