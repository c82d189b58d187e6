//! `SQLite`-backed campaign journal.
//!
//! The journal stores one append-only, hash-chained, signed event sequence
//! per campaign. [`Store`] owns the connection and the injected signer and
//! validator; every append runs in a single `BEGIN IMMEDIATE` transaction
//! that allocates sequences, chains, signs, inserts and (when enabled)
//! enqueues the projection-apply outbox row.
//!
//! Several `Store`s may open the same database file. `SQLite`'s writer lock
//! serializes their appends; WAL mode keeps reads concurrent.

// SQLite returns i64 for sequences, counts and timestamps; all are
// non-negative by schema constraint.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

mod append;
mod sequence;
mod verify;


use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params, params_from_iter};
use tracing::debug;

pub use verify::{IntegrityReport, VERIFY_PAGE_SIZE};

use crate::context::CallContext;
use crate::crypto::ChainSigner;
use crate::error::StoreError;
use crate::model::{Event, from_millis};
use crate::outbox::OutboxSettings;
use crate::pagination::{Page, PageRequest, plan_page};
use crate::validate::EventValidator;

/// Schema SQL embedded at compile time.
pub(crate) const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How long a connection waits on another writer before `SQLITE_BUSY`.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_COLUMNS: &str = "campaign_id, seq, event_type, timestamp_ms, session_id, request_id, \
     invocation_id, actor_type, actor_id, entity_type, entity_id, system_id, system_version, \
     correlation_id, causation_id, payload_json, event_hash, prev_hash, chain_hash, signature, \
     signature_key_id";

/// Durable event journal and projection-apply outbox.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    signer: Option<Arc<dyn ChainSigner>>,
    validator: Option<Arc<dyn EventValidator>>,
    outbox: OutboxSettings,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("has_signer", &self.signer.is_some())
            .field("has_validator", &self.validator.is_some())
            .field("outbox", &self.outbox)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Store`].
///
/// A store without a signer or validator can read and report on the outbox
/// but rejects appends and verification with [`StoreError::Config`].
#[derive(Default)]
pub struct StoreBuilder {
    conn: Option<Connection>,
    path: Option<PathBuf>,
    signer: Option<Arc<dyn ChainSigner>>,
    validator: Option<Arc<dyn EventValidator>>,
    outbox: OutboxSettings,
    busy_timeout: Option<Duration>,
}

impl StoreBuilder {
    /// Opens or creates the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(mut self, path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        self.conn = Some(conn);
        self.path = Some(path.to_path_buf());
        Ok(self)
    }

    /// Uses a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if `SQLite` cannot allocate the database.
    pub fn in_memory(mut self) -> Result<Self, StoreError> {
        self.conn = Some(Connection::open_in_memory()?);
        self.path = None;
        Ok(self)
    }

    /// Uses an already-open connection.
    #[must_use]
    pub fn connection(mut self, conn: Connection) -> Self {
        self.conn = Some(conn);
        self.path = None;
        self
    }

    #[must_use]
    pub fn signer(mut self, signer: Arc<dyn ChainSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn EventValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Overrides the outbox settings (enabled, staleness window).
    #[must_use]
    pub fn outbox_settings(mut self, settings: OutboxSettings) -> Self {
        self.outbox = settings;
        self
    }

    /// Overrides [`DEFAULT_BUSY_TIMEOUT`].
    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = Some(timeout);
        self
    }

    /// Applies the schema and returns the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if no database was opened, or a
    /// database error if the schema cannot be applied.
    pub fn build(self) -> Result<Store, StoreError> {
        let conn = self
            .conn
            .ok_or_else(|| StoreError::Config("store has no database connection".to_string()))?;
        conn.busy_timeout(self.busy_timeout.unwrap_or(DEFAULT_BUSY_TIMEOUT))?;
        initialize_connection(&conn)?;

        debug!(path = ?self.path, outbox_enabled = self.outbox.enabled, "journal store opened");

        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
            path: self.path,
            signer: self.signer,
            validator: self.validator,
            outbox: self.outbox,
        })
    }
}

/// Execute schema (includes PRAGMA statements).
fn initialize_connection(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

impl Store {
    /// Starts building a store.
    #[must_use]
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// Opens or creates a read/report store at `path` (no signer or
    /// validator).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::builder().open(path)?.build()
    }

    /// Creates an in-memory read/report store.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::builder().in_memory()?.build()
    }

    /// Path of the database file, `None` when in memory.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub const fn outbox_settings(&self) -> &OutboxSettings {
        &self.outbox
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub(crate) fn signer(&self) -> Result<&dyn ChainSigner, StoreError> {
        self.signer
            .as_deref()
            .ok_or_else(|| StoreError::Config("store has no event signer".to_string()))
    }

    /// Looks up an event by its content hash.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no event has that hash.
    pub fn get_event_by_hash(&self, ctx: &CallContext, hash: &str) -> Result<Event, StoreError> {
        ctx.check()?;
        let hash = hash.trim();
        if hash.is_empty() {
            return Err(StoreError::validation("event hash is required"));
        }
        let conn = self.lock()?;
        query_event_by_hash(&conn, hash)?
            .ok_or_else(|| StoreError::not_found(format!("event with hash {hash}")))
    }

    /// Looks up the event at `seq` in `campaign_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for a blank campaign or `seq == 0`,
    /// and [`StoreError::NotFound`] if there is no such event.
    pub fn get_event_by_seq(
        &self,
        ctx: &CallContext,
        campaign_id: &str,
        seq: u64,
    ) -> Result<Event, StoreError> {
        ctx.check()?;
        let campaign_id = require_campaign(campaign_id)?;
        if seq == 0 {
            return Err(StoreError::validation("seq must be positive"));
        }
        let conn = self.lock()?;
        query_event_by_seq(&conn, campaign_id, seq)?
            .ok_or_else(|| StoreError::not_found(format!("event {campaign_id}/{seq}")))
    }

    /// Highest stored sequence for `campaign_id`, 0 if it has no events.
    ///
    /// # Errors
    ///
    /// Returns an error on a blank campaign or database failure.
    pub fn get_latest_event_seq(&self, ctx: &CallContext, campaign_id: &str) -> Result<u64, StoreError> {
        ctx.check()?;
        let campaign_id = require_campaign(campaign_id)?;
        let conn = self.lock()?;
        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(seq) FROM events WHERE campaign_id = ?1",
            params![campaign_id],
            |row| row.get(0),
        )?;
        Ok(latest.map_or(0, |seq| seq as u64))
    }

    /// Lists up to `limit` events of `campaign_id` with `seq > after_seq`,
    /// ascending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for a blank campaign or
    /// `limit == 0`.
    pub fn list_events(
        &self,
        ctx: &CallContext,
        campaign_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        ctx.check()?;
        let campaign_id = require_campaign(campaign_id)?;
        require_limit(limit)?;
        let conn = self.lock()?;
        query_events_after(&conn, campaign_id, after_seq, limit)
    }

    /// Like [`Self::list_events`], restricted to one session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for a blank campaign or session,
    /// or `limit == 0`.
    pub fn list_events_by_session(
        &self,
        ctx: &CallContext,
        campaign_id: &str,
        session_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        ctx.check()?;
        let campaign_id = require_campaign(campaign_id)?;
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(StoreError::validation("session id is required"));
        }
        require_limit(limit)?;

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE campaign_id = ?1 AND session_id = ?2 AND seq > ?3
             ORDER BY seq ASC
             LIMIT ?4"
        ))?;
        let events = stmt
            .query_map(
                params![campaign_id, session_id, after_seq as i64, limit as i64],
                row_to_event,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Returns one cursor page of a campaign's events, with the filtered
    /// total count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if the request cannot be planned.
    pub fn list_events_page(
        &self,
        ctx: &CallContext,
        request: &PageRequest,
    ) -> Result<Page<Event>, StoreError> {
        ctx.check()?;
        let plan = plan_page(request)?;

        let mut conn = self.lock()?;
        // Count and page read from one snapshot.
        let tx = conn.transaction()?;
        let total: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM events WHERE {}", plan.count_where_clause),
            params_from_iter(plan.count_params.iter()),
            |row| row.get(0),
        )?;

        let mut page_params = plan.params.clone();
        page_params.push(Value::Integer(plan.limit as i64));
        let rows = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE {} ORDER BY {} LIMIT ?",
                plan.where_clause, plan.order_by
            ))?;
            let rows = stmt
                .query_map(params_from_iter(page_params.iter()), row_to_event)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        tx.commit()?;

        Ok(plan.finish(rows, total as u64))
    }

    /// Every campaign that has a sequence counter, sorted.
    pub(crate) fn list_campaign_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT campaign_id FROM event_seq
             UNION
             SELECT DISTINCT campaign_id FROM events
             ORDER BY campaign_id ASC",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}

fn require_campaign(campaign_id: &str) -> Result<&str, StoreError> {
    let campaign_id = campaign_id.trim();
    if campaign_id.is_empty() {
        return Err(StoreError::validation("campaign id is required"));
    }
    Ok(campaign_id)
}

fn require_limit(limit: usize) -> Result<(), StoreError> {
    if limit == 0 {
        return Err(StoreError::validation("limit must be positive"));
    }
    Ok(())
}

pub(crate) fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        campaign_id: row.get(0)?,
        seq: row.get::<_, i64>(1)? as u64,
        event_type: row.get(2)?,
        timestamp: from_millis(row.get(3)?),
        session_id: row.get(4)?,
        request_id: row.get(5)?,
        invocation_id: row.get(6)?,
        actor_type: row.get(7)?,
        actor_id: row.get(8)?,
        entity_type: row.get(9)?,
        entity_id: row.get(10)?,
        system_id: row.get(11)?,
        system_version: row.get(12)?,
        correlation_id: row.get(13)?,
        causation_id: row.get(14)?,
        payload_json: row.get(15)?,
        hash: row.get(16)?,
        prev_hash: row.get(17)?,
        chain_hash: row.get(18)?,
        signature: row.get(19)?,
        signature_key_id: row.get(20)?,
    })
}

pub(crate) fn query_event_by_seq(
    conn: &Connection,
    campaign_id: &str,
    seq: u64,
) -> Result<Option<Event>, StoreError> {
    let event = conn
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE campaign_id = ?1 AND seq = ?2"),
            params![campaign_id, seq as i64],
            row_to_event,
        )
        .optional()?;
    Ok(event)
}

fn query_event_by_hash(conn: &Connection, hash: &str) -> Result<Option<Event>, StoreError> {
    let event = conn
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_hash = ?1"),
            params![hash],
            row_to_event,
        )
        .optional()?;
    Ok(event)
}

fn query_events_after(
    conn: &Connection,
    campaign_id: &str,
    after_seq: u64,
    limit: usize,
) -> Result<Vec<Event>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM events
         WHERE campaign_id = ?1 AND seq > ?2
         ORDER BY seq ASC
         LIMIT ?3"
    ))?;
    let events = stmt
        .query_map(params![campaign_id, after_seq as i64, limit as i64], row_to_event)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}
