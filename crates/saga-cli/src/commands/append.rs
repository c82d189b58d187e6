//! `saga append` - append one event from a JSON document.
//!
//! ```json
//! {
//!   "campaign_id": "camp-1",
//!   "event_type": "character.created",
//!   "actor_type": "user",
//!   "actor_id": "u-7",
//!   "payload": {"name": "Mira"}
//! }
//! ```

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use saga_core::NewEvent;
use saga_core::config::SagaConfig;
use saga_core::context::CallContext;
use serde::Deserialize;
use serde_json::value::RawValue;

use super::events::EventView;
use super::{Access, open_store, print_json};

/// JSON shape accepted by `saga append`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppendRequest {
    pub campaign_id: String,
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub invocation_id: String,
    pub actor_type: String,
    #[serde(default)]
    pub actor_id: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: String,
    #[serde(default)]
    pub system_id: String,
    #[serde(default)]
    pub system_version: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub causation_id: String,
    /// Stored byte for byte as written; absent means `{}`.
    #[serde(default)]
    pub payload: Option<Box<RawValue>>,
}

impl AppendRequest {
    pub fn into_new_event(self) -> NewEvent {
        let payload_json = self
            .payload
            .map(|raw| raw.get().as_bytes().to_vec())
            .unwrap_or_default();
        NewEvent {
            campaign_id: self.campaign_id,
            event_type: self.event_type,
            timestamp: self.timestamp,
            session_id: self.session_id,
            request_id: self.request_id,
            invocation_id: self.invocation_id,
            actor_type: self.actor_type,
            actor_id: self.actor_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            system_id: self.system_id,
            system_version: self.system_version,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            payload_json,
        }
    }
}

fn read_request(file: &Path) -> Result<AppendRequest> {
    let content = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read event from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?
    };
    serde_json::from_str(&content).context("event JSON is malformed")
}

pub fn run(config: &SagaConfig, file: &Path) -> Result<()> {
    let event = read_request(file)?.into_new_event();
    let store = open_store(config, Access::Signed)?;
    let stored = store
        .append_event(&CallContext::background(), event)
        .context("append failed")?;
    print_json(&EventView::new(&stored))
}
