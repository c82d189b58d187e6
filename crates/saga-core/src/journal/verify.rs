//! Journal integrity verification.
//!
//! Re-derives every stored event's content hash, chain hash and signature in
//! sequence order, then checks the campaign's sequence counter. Pages of
//! [`VERIFY_PAGE_SIZE`] rows are read under separate lock holds so appends
//! are not blocked for the whole walk.

use rusqlite::{OptionalExtension, params};
use tracing::{error, info};

use super::{Store, query_events_after, require_campaign};
use crate::context::CallContext;
use crate::crypto::{ChainSigner, EventHasher, hashes_equal};
use crate::error::{IntegrityFailure, StoreError};
use crate::model::Event;

/// Rows read per verification page.
pub const VERIFY_PAGE_SIZE: usize = 200;

/// Outcome of a full-journal verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub campaigns: usize,
    pub events: u64,
}

impl Store {
    /// Verifies every campaign in the journal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Integrity`] at the first broken link, naming
    /// the campaign and sequence.
    pub fn verify_event_integrity(&self, ctx: &CallContext) -> Result<IntegrityReport, StoreError> {
        ctx.check()?;
        self.signer()?;

        let mut report = IntegrityReport::default();
        for campaign_id in self.list_campaign_ids()? {
            report.events += self.verify_campaign_integrity(ctx, &campaign_id)?;
            report.campaigns += 1;
        }
        info!(
            campaigns = report.campaigns,
            events = report.events,
            "journal integrity verified"
        );
        Ok(report)
    }

    /// Verifies one campaign and returns the number of events checked.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Integrity`] at the first broken link, or
    /// [`StoreError::Config`] without a signer.
    pub fn verify_campaign_integrity(
        &self,
        ctx: &CallContext,
        campaign_id: &str,
    ) -> Result<u64, StoreError> {
        let campaign_id = require_campaign(campaign_id)?;
        let signer = self.signer()?;

        let result = self.walk_campaign(ctx, signer, campaign_id);
        if let Err(StoreError::Integrity {
            campaign_id,
            seq,
            failure,
        }) = &result
        {
            error!(campaign_id = %campaign_id, seq, failure = %failure, "journal integrity check failed");
        }
        result
    }

    fn walk_campaign(
        &self,
        ctx: &CallContext,
        signer: &dyn ChainSigner,
        campaign_id: &str,
    ) -> Result<u64, StoreError> {
        let mut expected_seq = 1_u64;
        let mut prev_chain_hash = String::new();

        loop {
            ctx.check()?;
            let page = {
                let conn = self.lock()?;
                query_events_after(&conn, campaign_id, expected_seq - 1, VERIFY_PAGE_SIZE)?
            };
            let page_len = page.len();

            for event in &page {
                verify_event(signer, event, expected_seq, &prev_chain_hash).map_err(|failure| {
                    StoreError::Integrity {
                        campaign_id: campaign_id.to_string(),
                        seq: expected_seq,
                        failure,
                    }
                })?;
                prev_chain_hash.clone_from(&event.chain_hash);
                expected_seq += 1;
            }

            if page_len < VERIFY_PAGE_SIZE {
                break;
            }
        }

        self.check_counter(campaign_id)?;
        Ok(expected_seq - 1)
    }

    /// The counter must point one past the highest stored sequence. Both are
    /// read in one statement so a concurrent append cannot split them.
    fn check_counter(&self, campaign_id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let (next_seq, max_seq): (Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT
                     (SELECT next_seq FROM event_seq WHERE campaign_id = ?1),
                     (SELECT MAX(seq) FROM events WHERE campaign_id = ?1)",
                params![campaign_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .unwrap_or((None, None));

        let next_seq = next_seq.map_or(0, |n| n as u64);
        let max_seq = max_seq.map_or(0, |n| n as u64);
        if next_seq == max_seq + 1 {
            return Ok(());
        }
        Err(StoreError::Integrity {
            campaign_id: campaign_id.to_string(),
            seq: max_seq,
            failure: IntegrityFailure::CounterMismatch { next_seq },
        })
    }
}

fn verify_event(
    signer: &dyn ChainSigner,
    event: &Event,
    expected_seq: u64,
    prev_chain_hash: &str,
) -> Result<(), IntegrityFailure> {
    if event.seq != expected_seq {
        return Err(IntegrityFailure::SequenceGap {
            expected: expected_seq,
        });
    }
    if !hashes_equal(&event.prev_hash, prev_chain_hash) {
        return Err(IntegrityFailure::PrevHashMismatch);
    }
    if !hashes_equal(&EventHasher::content_hash(event), &event.hash) {
        return Err(IntegrityFailure::HashMismatch);
    }
    if !hashes_equal(
        &EventHasher::chain_hash(&event.prev_hash, &event.hash),
        &event.chain_hash,
    ) {
        return Err(IntegrityFailure::ChainHashMismatch);
    }
    signer
        .verify_chain_hash(
            &event.campaign_id,
            &event.chain_hash,
            &event.signature,
            &event.signature_key_id,
        )
        .map_err(|err| IntegrityFailure::SignatureInvalid {
            details: err.to_string(),
        })
}
