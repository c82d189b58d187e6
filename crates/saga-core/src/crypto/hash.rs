//! BLAKE3 content and chain hashing.

use subtle::ConstantTimeEq;

use crate::model::Event;

/// Length of a hex-encoded BLAKE3 hash.
pub const HASH_HEX_LEN: usize = 64;

/// Domain separator for event content hashes.
const CONTENT_DOMAIN: &[u8] = b"saga-event-content-v1";

/// Domain separator for chain hashes.
const CHAIN_DOMAIN: &[u8] = b"saga-event-chain-v1";

/// Hasher for journal events.
///
/// All outputs are lower-case hex strings so that the genesis `prev_hash`
/// can be the empty string.
pub struct EventHasher;

impl EventHasher {
    /// Computes the content hash of an event.
    ///
    /// Covers the campaign id, every metadata field, the millisecond timestamp
    /// and the raw payload bytes. `seq`, `hash`, `prev_hash`, `chain_hash` and
    /// the signature fields are excluded, so resubmitting identical content
    /// produces the same hash regardless of where it would land.
    #[must_use]
    pub fn content_hash(event: &Event) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(CONTENT_DOMAIN);
        for field in [
            &event.campaign_id,
            &event.event_type,
            &event.session_id,
            &event.request_id,
            &event.invocation_id,
            &event.actor_type,
            &event.actor_id,
            &event.entity_type,
            &event.entity_id,
            &event.system_id,
            &event.system_version,
            &event.correlation_id,
            &event.causation_id,
        ] {
            update_prefixed(&mut hasher, field.as_bytes());
        }
        hasher.update(&event.timestamp.timestamp_millis().to_le_bytes());
        update_prefixed(&mut hasher, &event.payload_json);
        hasher.finalize().to_hex().to_string()
    }

    /// Combines the previous chain hash (empty for the first event) with this
    /// event's content hash.
    #[must_use]
    pub fn chain_hash(prev_chain_hash: &str, content_hash: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(CHAIN_DOMAIN);
        update_prefixed(&mut hasher, prev_chain_hash.as_bytes());
        update_prefixed(&mut hasher, content_hash.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Hashes raw bytes without any domain separation.
    #[must_use]
    pub fn hash_bytes(content: &[u8]) -> String {
        blake3::hash(content).to_hex().to_string()
    }
}

/// Constant-time comparison of two hash strings.
#[must_use]
pub fn hashes_equal(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn update_prefixed(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
