//! Append path: validate, hash, allocate, chain, sign, insert, enqueue.

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior, params};
use tracing::{debug, info};

use super::{Store, query_event_by_hash, sequence};
use crate::context::CallContext;
use crate::crypto::{ChainSigner, EventHasher};
use crate::error::{IntegrityFailure, StoreError};
use crate::model::{Event, NewEvent};
use crate::outbox;
use crate::validate::EventValidator;

const INSERT_EVENT_SQL: &str = "INSERT INTO events (
        campaign_id, seq, event_type, timestamp_ms, session_id, request_id, invocation_id,
        actor_type, actor_id, entity_type, entity_id, system_id, system_version,
        correlation_id, causation_id, payload_json, event_hash, prev_hash, chain_hash,
        signature, signature_key_id
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
              ?18, ?19, ?20, ?21)";

impl Store {
    /// Appends one event and returns it as stored.
    ///
    /// Resubmitting an event whose content hash is already stored returns
    /// the stored event unchanged and allocates nothing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] without a signer or validator,
    /// [`StoreError::InvalidEvent`] if validation fails, and database or
    /// signer errors otherwise. Nothing is persisted on error.
    pub fn append_event(&self, ctx: &CallContext, event: NewEvent) -> Result<Event, StoreError> {
        ctx.check()?;
        let signer = self.signer()?;
        let mut event = self.prepare_event(event)?;

        let mut conn = self.lock()?;
        match append_chain(
            &mut conn,
            signer,
            std::slice::from_mut(&mut event),
            self.outbox.enabled,
        ) {
            Ok(()) => {
                info!(
                    campaign_id = %event.campaign_id,
                    seq = event.seq,
                    event_type = %event.event_type,
                    "event appended"
                );
                Ok(event)
            },
            Err(err) if is_duplicate_hash(&err) => {
                let existing = query_event_by_hash(&conn, &event.hash)?.ok_or(err)?;
                debug!(
                    campaign_id = %existing.campaign_id,
                    seq = existing.seq,
                    hash = %existing.hash,
                    "duplicate append, returning stored event"
                );
                Ok(existing)
            },
            Err(err) => Err(err),
        }
    }

    /// Appends events to one campaign atomically, with contiguous
    /// sequences in input order.
    ///
    /// Retrying a batch whose every event is already stored returns the
    /// stored events.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for an empty batch, a batch that
    /// spans campaigns, a batch that repeats an event, or a batch that
    /// partially overlaps stored history. On any error nothing is persisted.
    pub fn batch_append_events(
        &self,
        ctx: &CallContext,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, StoreError> {
        ctx.check()?;
        let signer = self.signer()?;
        if events.is_empty() {
            return Err(StoreError::validation("batch must contain at least one event"));
        }

        let mut prepared = events
            .into_iter()
            .map(|event| self.prepare_event(event))
            .collect::<Result<Vec<_>, _>>()?;

        let campaign_id = prepared[0].campaign_id.clone();
        if let Some(other) = prepared.iter().find(|e| e.campaign_id != campaign_id) {
            return Err(StoreError::validation(format!(
                "batch spans campaigns {campaign_id} and {}",
                other.campaign_id
            )));
        }
        let mut seen = HashSet::with_capacity(prepared.len());
        if let Some(dup) = prepared.iter().find(|e| !seen.insert(e.hash.as_str())) {
            return Err(StoreError::validation(format!(
                "batch contains event {} twice",
                dup.hash
            )));
        }

        let mut conn = self.lock()?;
        match append_chain(&mut conn, signer, &mut prepared, self.outbox.enabled) {
            Ok(()) => {
                info!(
                    campaign_id = %campaign_id,
                    first_seq = prepared[0].seq,
                    count = prepared.len(),
                    "event batch appended"
                );
                Ok(prepared)
            },
            Err(err) if is_duplicate_hash(&err) => {
                let mut existing = Vec::with_capacity(prepared.len());
                for event in &prepared {
                    match query_event_by_hash(&conn, &event.hash)? {
                        Some(stored) => existing.push(stored),
                        None => {
                            return Err(StoreError::validation(format!(
                                "batch partially overlaps stored events in campaign {campaign_id}"
                            )));
                        },
                    }
                }
                debug!(campaign_id = %campaign_id, count = existing.len(), "duplicate batch, returning stored events");
                Ok(existing)
            },
            Err(err) => Err(err),
        }
    }

    fn validator(&self) -> Result<&dyn EventValidator, StoreError> {
        self.validator
            .as_deref()
            .ok_or_else(|| StoreError::Config("store has no event validator".to_string()))
    }

    /// Validates and content-hashes a submission. The content hash does not
    /// cover `seq`, so it is fixed before a sequence is allocated.
    fn prepare_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        let normalized = self.validator()?.validate_for_append(event)?;
        let mut event = Event::from_new(normalized);
        event.hash = EventHasher::content_hash(&event);
        Ok(event)
    }
}

/// Sequences, chains, signs and inserts `events` (all one campaign) in a
/// single `BEGIN IMMEDIATE` transaction. Dropping the transaction on error
/// rolls back.
fn append_chain(
    conn: &mut Connection,
    signer: &dyn ChainSigner,
    events: &mut [Event],
    enqueue: bool,
) -> Result<(), StoreError> {
    let Some(first) = events.first() else {
        return Ok(());
    };
    let campaign_id = first.campaign_id.clone();

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let first_seq = sequence::allocate(&tx, &campaign_id, events.len() as u64)?;
    let mut prev_hash = previous_chain_hash(&tx, &campaign_id, first_seq)?;
    let now_ms = Utc::now().timestamp_millis();

    {
        let mut insert = tx.prepare_cached(INSERT_EVENT_SQL)?;
        for (offset, event) in (0_u64..).zip(events.iter_mut()) {
            event.seq = first_seq + offset;
            event.prev_hash = prev_hash;
            event.chain_hash = EventHasher::chain_hash(&event.prev_hash, &event.hash);
            let (signature, key_id) =
                signer.sign_chain_hash(&event.campaign_id, &event.chain_hash)?;
            event.signature = signature;
            event.signature_key_id = key_id;

            insert.execute(params![
                event.campaign_id,
                event.seq as i64,
                event.event_type,
                event.timestamp.timestamp_millis(),
                event.session_id,
                event.request_id,
                event.invocation_id,
                event.actor_type,
                event.actor_id,
                event.entity_type,
                event.entity_id,
                event.system_id,
                event.system_version,
                event.correlation_id,
                event.causation_id,
                event.payload_json,
                event.hash,
                event.prev_hash,
                event.chain_hash,
                event.signature,
                event.signature_key_id,
            ])?;

            if enqueue {
                outbox::enqueue(&tx, event, now_ms)?;
            }
            prev_hash = event.chain_hash.clone();
        }
    }

    tx.commit()?;
    Ok(())
}

fn previous_chain_hash(conn: &Connection, campaign_id: &str, first_seq: u64) -> Result<String, StoreError> {
    if first_seq <= 1 {
        return Ok(String::new());
    }
    let prev_seq = first_seq - 1;
    super::query_event_by_seq(conn, campaign_id, prev_seq)?
        .map(|event| event.chain_hash)
        .ok_or_else(|| StoreError::Integrity {
            campaign_id: campaign_id.to_string(),
            seq: prev_seq,
            failure: IntegrityFailure::SequenceGap { expected: prev_seq },
        })
}

/// A unique-index violation on `event_hash`, i.e. the content is already
/// stored. Primary-key conflicts on `(campaign_id, seq)` are not duplicates.
fn is_duplicate_hash(err: &StoreError) -> bool {
    match err {
        StoreError::Database(rusqlite::Error::SqliteFailure(code, Some(message))) => {
            code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                && message.contains("events.event_hash")
        },
        _ => false,
    }
}
