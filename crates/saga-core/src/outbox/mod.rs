//! Projection-apply outbox.
//!
//! Every append enqueues one row per event in the append transaction. Workers
//! claim due rows, load the event, hand it to a [`ProjectionApplier`] and
//! delete the row on success. Failures are retried with exponential backoff
//! until [`OUTBOX_DEAD_LETTER_THRESHOLD`] attempts, after which the row is
//! dead-lettered until an operator requeues it.
//!
//! Claims and completions are conditional updates keyed on the observed
//! status and attempt count, so racing workers (in this process or another
//! one sharing the database file) never both own a row. A claim older than
//! the staleness window is orphaned and may be reclaimed; the abandoned run
//! counts as a failed attempt, so an event that keeps killing its worker is
//! eventually dead-lettered.

// SQLite returns i64 for sequences, counts and timestamps; all are
// non-negative by schema constraint.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap, clippy::cast_possible_truncation)]

mod backoff;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::error::Error as StdError;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use backoff::{OUTBOX_MAX_BACKOFF, outbox_retry_backoff};

use crate::context::CallContext;
use crate::error::StoreError;
use crate::journal::{Store, query_event_by_seq};
use crate::model::{Event, OutboxRow, OutboxStatus, from_millis};

/// Attempts after which a failing row is dead-lettered.
pub const OUTBOX_DEAD_LETTER_THRESHOLD: u32 = 8;

/// Default age after which a `processing` claim is considered orphaned.
pub const DEFAULT_PROCESSING_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Prefix of `last_error` when the row's event could not be loaded.
pub const LOAD_EVENT_ERROR_PREFIX: &str = "load event";

/// `last_error` recorded by the shadow worker.
pub const SHADOW_WORKER_ERROR: &str = "shadow worker: projection apply disabled";

/// `last_error` recorded when an orphaned claim spends the last attempt.
pub const STALE_CLAIM_ERROR: &str = "stale claim: worker did not finish";

/// Error type returned by a [`ProjectionApplier`].
pub type ApplyError = Box<dyn StdError + Send + Sync>;

/// Applies one journal event to the projections.
///
/// Delivery is at-least-once: a worker that dies after a successful apply but
/// before deleting the row leaves the event to be applied again, so
/// implementations must be idempotent per `(campaign_id, seq)`.
///
/// Implemented for any `Fn(&CallContext, &Event) -> Result<(), ApplyError>`.
pub trait ProjectionApplier: Send + Sync {
    /// Applies `event`. An error is recorded on the outbox row and retried.
    fn apply(&self, ctx: &CallContext, event: &Event) -> Result<(), ApplyError>;
}

impl<F> ProjectionApplier for F
where
    F: Fn(&CallContext, &Event) -> Result<(), ApplyError> + Send + Sync,
{
    fn apply(&self, ctx: &CallContext, event: &Event) -> Result<(), ApplyError> {
        self(ctx, event)
    }
}

/// Outbox behavior of a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxSettings {
    /// Enqueue a row for every appended event.
    pub enabled: bool,
    /// Age after which a `processing` claim may be reclaimed.
    pub processing_stale_after: Duration,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            processing_stale_after: DEFAULT_PROCESSING_STALE_AFTER,
        }
    }
}

/// Per-status counts plus the oldest not-yet-dead row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxSummary {
    pub pending_count: u64,
    pub processing_count: u64,
    pub failed_count: u64,
    pub dead_count: u64,
    pub oldest: Option<OldestOutboxItem>,
}

impl OutboxSummary {
    /// Sum of all status counts.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.pending_count + self.processing_count + self.failed_count + self.dead_count
    }
}

/// The non-dead row with the earliest `next_attempt_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OldestOutboxItem {
    pub campaign_id: String,
    pub seq: u64,
    pub status: OutboxStatus,
    pub next_attempt_at: DateTime<Utc>,
}

/// A row this worker owns: the values its conditional updates key on.
#[derive(Debug, Clone)]
struct ClaimedRow {
    campaign_id: String,
    seq: u64,
    prior_status: OutboxStatus,
    attempt_count: u32,
    /// `updated_at_ms` written by the claim; a reclaim overwrites it.
    claimed_at_ms: i64,
}

const OUTBOX_COLUMNS: &str = "campaign_id, seq, event_type, status, attempt_count, \
     next_attempt_at_ms, last_error, updated_at_ms";

/// Inserts the pending row for a just-appended event, leaving an existing
/// row untouched. Runs inside the append transaction.
pub(crate) fn enqueue(conn: &Connection, event: &Event, now_ms: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO projection_apply_outbox
             (campaign_id, seq, event_type, status, attempt_count, next_attempt_at_ms,
              last_error, updated_at_ms)
         VALUES (?1, ?2, ?3, 'pending', 0, ?4, '', ?4)
         ON CONFLICT(campaign_id, seq) DO NOTHING",
        params![event.campaign_id, event.seq as i64, event.event_type, now_ms],
    )?;
    Ok(())
}

impl Store {
    /// Claims up to `limit` due rows (plus stale `processing` claims) in
    /// oldest-due order and applies each event with `apply`.
    ///
    /// Returns the number of rows attempted. Individual apply failures are
    /// recorded on their rows, not returned. Cancellation between rows
    /// stops early and releases the unprocessed claims.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] when `apply` is `None`,
    /// [`StoreError::Validation`] for `limit == 0`, and database errors.
    pub fn process_projection_apply_outbox(
        &self,
        ctx: &CallContext,
        now: DateTime<Utc>,
        limit: usize,
        apply: Option<&dyn ProjectionApplier>,
    ) -> Result<usize, StoreError> {
        ctx.check()?;
        let apply = apply.ok_or_else(|| {
            StoreError::Config("projection applier is required to process the outbox".to_string())
        })?;
        require_limit(limit)?;

        let now_ms = now.timestamp_millis();
        let claimed = self.claim_due_rows(now_ms, limit)?;
        let mut attempted = 0;

        for (index, row) in claimed.iter().enumerate() {
            if ctx.check().is_err() {
                self.release_claims(&claimed[index..])?;
                debug!(attempted, released = claimed.len() - index, "outbox processing canceled");
                break;
            }
            attempted += 1;

            let loaded = {
                let conn = self.lock()?;
                query_event_by_seq(&conn, &row.campaign_id, row.seq)
            };
            let outcome = match loaded {
                Ok(Some(event)) => apply.apply(ctx, &event).map_err(|err| err.to_string()),
                Ok(None) => Err(format!(
                    "{LOAD_EVENT_ERROR_PREFIX}: event {}/{} not found",
                    row.campaign_id, row.seq
                )),
                Err(err) => Err(format!("{LOAD_EVENT_ERROR_PREFIX}: {err}")),
            };

            match outcome {
                Ok(()) => self.complete_row(row)?,
                Err(message) => self.fail_row(row, now_ms, &message)?,
            }
        }

        Ok(attempted)
    }

    /// Claims due rows like [`Self::process_projection_apply_outbox`] but
    /// never applies; every claimed row is recorded as failed with
    /// [`SHADOW_WORKER_ERROR`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for `limit == 0`, and database
    /// errors.
    pub fn process_projection_apply_outbox_shadow(
        &self,
        ctx: &CallContext,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        ctx.check()?;
        require_limit(limit)?;

        let now_ms = now.timestamp_millis();
        let claimed = self.claim_due_rows(now_ms, limit)?;
        let mut attempted = 0;

        for (index, row) in claimed.iter().enumerate() {
            if ctx.check().is_err() {
                self.release_claims(&claimed[index..])?;
                break;
            }
            attempted += 1;
            self.fail_row(row, now_ms, SHADOW_WORKER_ERROR)?;
        }

        Ok(attempted)
    }

    /// Counts rows per status and finds the oldest non-dead row, from one
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns database errors.
    pub fn get_projection_apply_outbox_summary(
        &self,
        ctx: &CallContext,
    ) -> Result<OutboxSummary, StoreError> {
        ctx.check()?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut summary = OutboxSummary::default();
        {
            let mut stmt = tx.prepare(
                "SELECT status, COUNT(*) FROM projection_apply_outbox GROUP BY status",
            )?;
            let counts = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (status, count) in counts {
                let count = count as u64;
                match status.parse::<OutboxStatus>() {
                    Ok(OutboxStatus::Pending) => summary.pending_count = count,
                    Ok(OutboxStatus::Processing) => summary.processing_count = count,
                    Ok(OutboxStatus::Failed) => summary.failed_count = count,
                    Ok(OutboxStatus::Dead) => summary.dead_count = count,
                    Err(err) => warn!(error = %err, count, "ignoring outbox rows with unknown status"),
                }
            }
        }

        summary.oldest = tx
            .query_row(
                "SELECT campaign_id, seq, status, next_attempt_at_ms
                 FROM projection_apply_outbox
                 WHERE status IN ('pending', 'processing', 'failed')
                 ORDER BY next_attempt_at_ms ASC, campaign_id ASC, seq ASC
                 LIMIT 1",
                [],
                |row| {
                    Ok(OldestOutboxItem {
                        campaign_id: row.get(0)?,
                        seq: row.get::<_, i64>(1)? as u64,
                        status: parse_status(row, 2)?,
                        next_attempt_at: from_millis(row.get(3)?),
                    })
                },
            )
            .optional()?;
        tx.commit()?;

        Ok(summary)
    }

    /// Lists up to `limit` rows ordered by `next_attempt_at`, optionally
    /// filtered by status. A blank filter means all statuses and a zero
    /// `limit` yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for an unknown status.
    pub fn list_projection_apply_outbox_rows(
        &self,
        ctx: &CallContext,
        status_filter: &str,
        limit: usize,
    ) -> Result<Vec<OutboxRow>, StoreError> {
        ctx.check()?;
        let status_filter = status_filter.trim();
        let status = if status_filter.is_empty() {
            None
        } else {
            Some(
                status_filter
                    .parse::<OutboxStatus>()
                    .map_err(|err| StoreError::validation(err.to_string()))?,
            )
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock()?;
        let rows = if let Some(status) = status {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM projection_apply_outbox
                 WHERE status = ?1
                 ORDER BY next_attempt_at_ms ASC, campaign_id ASC, seq ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![status.as_str(), limit as i64], row_to_outbox)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM projection_apply_outbox
                 ORDER BY next_attempt_at_ms ASC, campaign_id ASC, seq ASC
                 LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], row_to_outbox)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        Ok(rows)
    }

    /// Moves one dead row back to `pending` with a fresh attempt budget.
    /// Returns `false` if the row does not exist or is not dead.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for a blank campaign or `seq == 0`.
    pub fn requeue_projection_apply_outbox_row(
        &self,
        ctx: &CallContext,
        campaign_id: &str,
        seq: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        ctx.check()?;
        let campaign_id = campaign_id.trim();
        if campaign_id.is_empty() {
            return Err(StoreError::validation("campaign id is required"));
        }
        if seq == 0 {
            return Err(StoreError::validation("seq must be positive"));
        }

        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE projection_apply_outbox
             SET status = 'pending', attempt_count = 0, next_attempt_at_ms = ?3,
                 last_error = '', updated_at_ms = ?3
             WHERE campaign_id = ?1 AND seq = ?2 AND status = 'dead'",
            params![campaign_id, seq as i64, now.timestamp_millis()],
        )?;
        if changed == 1 {
            info!(campaign_id, seq, "dead outbox row requeued");
        }
        Ok(changed == 1)
    }

    /// Requeues up to `limit` dead rows, oldest `next_attempt_at` first.
    /// Returns how many were requeued.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for `limit == 0`.
    pub fn requeue_projection_apply_outbox_dead_rows(
        &self,
        ctx: &CallContext,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        ctx.check()?;
        require_limit(limit)?;

        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE projection_apply_outbox
             SET status = 'pending', attempt_count = 0, next_attempt_at_ms = ?2,
                 last_error = '', updated_at_ms = ?2
             WHERE status = 'dead' AND rowid IN (
                 SELECT rowid FROM projection_apply_outbox
                 WHERE status = 'dead'
                 ORDER BY next_attempt_at_ms ASC, campaign_id ASC, seq ASC
                 LIMIT ?1
             )",
            params![limit as i64, now.timestamp_millis()],
        )?;
        if changed > 0 {
            info!(count = changed, "dead outbox rows requeued");
        }
        Ok(changed)
    }

    /// Claims due rows, retrying past rows lost to a racing worker until
    /// `limit` are owned or nothing due remains.
    fn claim_due_rows(&self, now_ms: i64, limit: usize) -> Result<Vec<ClaimedRow>, StoreError> {
        let stale_ms = i64::try_from(self.outbox_settings().processing_stale_after.as_millis())
            .unwrap_or(i64::MAX);
        let stale_before_ms = now_ms.saturating_sub(stale_ms);

        let conn = self.lock()?;
        let mut claimed: Vec<ClaimedRow> = Vec::with_capacity(limit);
        let mut seen = HashSet::new();

        while claimed.len() < limit {
            let wanted = limit - claimed.len();
            let candidates = select_due(&conn, now_ms, stale_before_ms, wanted + seen.len())?;
            let fresh: Vec<ClaimedRow> = candidates
                .into_iter()
                .filter(|row| !seen.contains(&(row.campaign_id.clone(), row.seq)))
                .collect();
            if fresh.is_empty() {
                break;
            }

            for mut row in fresh {
                seen.insert((row.campaign_id.clone(), row.seq));
                if claimed.len() == limit {
                    break;
                }
                let stale = row.prior_status == OutboxStatus::Processing;
                let attempts = if stale {
                    row.attempt_count.saturating_add(1)
                } else {
                    row.attempt_count
                };
                if stale && attempts >= OUTBOX_DEAD_LETTER_THRESHOLD {
                    dead_letter_stale(&conn, &row, attempts, now_ms, stale_before_ms)?;
                    continue;
                }

                let won = conn.execute(
                    "UPDATE projection_apply_outbox
                     SET status = 'processing', attempt_count = ?7, updated_at_ms = ?1
                     WHERE campaign_id = ?2 AND seq = ?3 AND status = ?4 AND attempt_count = ?5
                       AND ((status IN ('pending', 'failed') AND next_attempt_at_ms <= ?1)
                            OR (status = 'processing' AND updated_at_ms <= ?6))",
                    params![
                        now_ms,
                        row.campaign_id,
                        row.seq as i64,
                        row.prior_status.as_str(),
                        row.attempt_count,
                        stale_before_ms,
                        attempts,
                    ],
                )? == 1;
                if won {
                    row.attempt_count = attempts;
                    row.claimed_at_ms = now_ms;
                    if row.prior_status == OutboxStatus::Processing {
                        warn!(campaign_id = %row.campaign_id, seq = row.seq, "reclaimed stale outbox claim");
                    }
                    claimed.push(row);
                } else {
                    debug!(campaign_id = %row.campaign_id, seq = row.seq, "outbox row claimed by another worker");
                }
            }
        }

        Ok(claimed)
    }

    /// Deletes a row after a successful apply, if this worker still owns it.
    fn complete_row(&self, row: &ClaimedRow) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM projection_apply_outbox
             WHERE campaign_id = ?1 AND seq = ?2 AND status = 'processing'
               AND attempt_count = ?3 AND updated_at_ms = ?4",
            params![row.campaign_id, row.seq as i64, row.attempt_count, row.claimed_at_ms],
        )?;
        if changed == 1 {
            debug!(campaign_id = %row.campaign_id, seq = row.seq, "projection applied");
        } else {
            debug!(campaign_id = %row.campaign_id, seq = row.seq, "outbox row lost before completion");
        }
        Ok(())
    }

    /// Records a failed attempt: retry with backoff, or dead-letter once the
    /// attempt budget is spent.
    fn fail_row(&self, row: &ClaimedRow, now_ms: i64, message: &str) -> Result<(), StoreError> {
        let attempts = row.attempt_count.saturating_add(1);
        let (status, next_attempt_ms) = if attempts >= OUTBOX_DEAD_LETTER_THRESHOLD {
            (OutboxStatus::Dead, now_ms)
        } else {
            let backoff_ms = outbox_retry_backoff(attempts).as_millis() as i64;
            (OutboxStatus::Failed, now_ms.saturating_add(backoff_ms))
        };

        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE projection_apply_outbox
             SET status = ?1, attempt_count = ?2, next_attempt_at_ms = ?3,
                 last_error = ?4, updated_at_ms = ?5
             WHERE campaign_id = ?6 AND seq = ?7 AND status = 'processing'
               AND attempt_count = ?8 AND updated_at_ms = ?9",
            params![
                status.as_str(),
                attempts,
                next_attempt_ms,
                message,
                now_ms,
                row.campaign_id,
                row.seq as i64,
                row.attempt_count,
                row.claimed_at_ms,
            ],
        )?;

        if changed != 1 {
            debug!(campaign_id = %row.campaign_id, seq = row.seq, "outbox row lost before failure was recorded");
        } else if status == OutboxStatus::Dead {
            warn!(
                campaign_id = %row.campaign_id,
                seq = row.seq,
                attempts,
                error = message,
                "outbox row dead-lettered"
            );
        } else {
            warn!(
                campaign_id = %row.campaign_id,
                seq = row.seq,
                attempts,
                error = message,
                "projection apply failed, will retry"
            );
        }
        Ok(())
    }

    /// Returns unprocessed claims to their prior status. A reclaimed orphan
    /// goes back as `failed`, still due.
    fn release_claims(&self, rows: &[ClaimedRow]) -> Result<(), StoreError> {
        let conn = self.lock()?;
        for row in rows {
            let status = match row.prior_status {
                OutboxStatus::Processing => OutboxStatus::Failed,
                prior => prior,
            };
            conn.execute(
                "UPDATE projection_apply_outbox
                 SET status = ?1
                 WHERE campaign_id = ?2 AND seq = ?3 AND status = 'processing'
                   AND attempt_count = ?4 AND updated_at_ms = ?5",
                params![
                    status.as_str(),
                    row.campaign_id,
                    row.seq as i64,
                    row.attempt_count,
                    row.claimed_at_ms,
                ],
            )?;
        }
        Ok(())
    }
}

/// Dead-letters an orphaned claim whose abandoned run spent the last
/// attempt, without handing it to a worker.
fn dead_letter_stale(
    conn: &Connection,
    row: &ClaimedRow,
    attempts: u32,
    now_ms: i64,
    stale_before_ms: i64,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE projection_apply_outbox
         SET status = 'dead', attempt_count = ?1, next_attempt_at_ms = ?2,
             last_error = ?3, updated_at_ms = ?2
         WHERE campaign_id = ?4 AND seq = ?5 AND status = 'processing'
           AND attempt_count = ?6 AND updated_at_ms <= ?7",
        params![
            attempts,
            now_ms,
            STALE_CLAIM_ERROR,
            row.campaign_id,
            row.seq as i64,
            row.attempt_count,
            stale_before_ms,
        ],
    )?;
    if changed == 1 {
        warn!(
            campaign_id = %row.campaign_id,
            seq = row.seq,
            attempts,
            "stale outbox claim dead-lettered"
        );
    }
    Ok(())
}

fn select_due(
    conn: &Connection,
    now_ms: i64,
    stale_before_ms: i64,
    limit: usize,
) -> Result<Vec<ClaimedRow>, StoreError> {
    let mut stmt = conn.prepare_cached(
        "SELECT campaign_id, seq, status, attempt_count
         FROM projection_apply_outbox
         WHERE (status IN ('pending', 'failed') AND next_attempt_at_ms <= ?1)
            OR (status = 'processing' AND updated_at_ms <= ?2)
         ORDER BY next_attempt_at_ms ASC, campaign_id ASC, seq ASC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![now_ms, stale_before_ms, limit as i64], |row| {
            Ok(ClaimedRow {
                campaign_id: row.get(0)?,
                seq: row.get::<_, i64>(1)? as u64,
                prior_status: parse_status(row, 2)?,
                attempt_count: row.get(3)?,
                claimed_at_ms: 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn require_limit(limit: usize) -> Result<(), StoreError> {
    if limit == 0 {
        return Err(StoreError::validation("limit must be positive"));
    }
    Ok(())
}

fn parse_status(row: &Row<'_>, index: usize) -> rusqlite::Result<OutboxStatus> {
    let raw: String = row.get(index)?;
    raw.parse().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn row_to_outbox(row: &Row<'_>) -> rusqlite::Result<OutboxRow> {
    Ok(OutboxRow {
        campaign_id: row.get(0)?,
        seq: row.get::<_, i64>(1)? as u64,
        event_type: row.get(2)?,
        status: parse_status(row, 3)?,
        attempt_count: row.get(4)?,
        next_attempt_at: from_millis(row.get(5)?),
        last_error: row.get(6)?,
        updated_at: from_millis(row.get(7)?),
    })
}
