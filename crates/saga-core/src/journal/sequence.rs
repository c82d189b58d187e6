//! Per-campaign sequence allocator.
//!
//! Must run inside a write transaction (`BEGIN IMMEDIATE`): the read of
//! `next_seq` and its increment are serialized by `SQLite`'s writer lock, so
//! two appenders can never observe the same value.

use rusqlite::{Connection, params};

use crate::error::StoreError;

/// Reserves `count` contiguous sequences for `campaign_id` and returns the
/// first one. A campaign's first allocation starts at 1.
pub(super) fn allocate(conn: &Connection, campaign_id: &str, count: u64) -> Result<u64, StoreError> {
    let count = i64::try_from(count)
        .map_err(|_| StoreError::validation(format!("cannot allocate {count} sequences")))?;

    conn.execute(
        "INSERT INTO event_seq (campaign_id, next_seq) VALUES (?1, 1)
         ON CONFLICT(campaign_id) DO NOTHING",
        params![campaign_id],
    )?;
    let first: i64 = conn.query_row(
        "SELECT next_seq FROM event_seq WHERE campaign_id = ?1",
        params![campaign_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE event_seq SET next_seq = next_seq + ?2 WHERE campaign_id = ?1",
        params![campaign_id, count],
    )?;

    u64::try_from(first)
        .map_err(|_| StoreError::validation(format!("corrupt next_seq {first} for {campaign_id}")))
}

/// The next sequence that would be allocated, or `None` if the campaign has
/// never been appended to.
pub(super) fn peek(conn: &Connection, campaign_id: &str) -> Result<Option<u64>, StoreError> {
    use rusqlite::OptionalExtension;

    let next: Option<i64> = conn
        .query_row(
            "SELECT next_seq FROM event_seq WHERE campaign_id = ?1",
            params![campaign_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(next.and_then(|n| u64::try_from(n).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(super::super::SCHEMA_SQL).unwrap();
        conn
    }

    #[test]
    fn first_allocation_starts_at_one() {
        let conn = conn();
        assert_eq!(peek(&conn, "camp").unwrap(), None);
        assert_eq!(allocate(&conn, "camp", 1).unwrap(), 1);
        assert_eq!(allocate(&conn, "camp", 1).unwrap(), 2);
        assert_eq!(peek(&conn, "camp").unwrap(), Some(3));
    }

    #[test]
    fn ranges_are_contiguous_and_per_campaign() {
        let conn = conn();
        assert_eq!(allocate(&conn, "a", 3).unwrap(), 1);
        assert_eq!(allocate(&conn, "a", 2).unwrap(), 4);
        assert_eq!(allocate(&conn, "b", 1).unwrap(), 1);
        assert_eq!(peek(&conn, "a").unwrap(), Some(6));
    }
}
