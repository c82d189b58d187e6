//! Tests for the projection-apply outbox.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Duration as ChronoDuration;
use rusqlite::params;

use super::*;
use crate::crypto::Ed25519Keyring;
use crate::model::{NewEvent, truncate_to_millis};
use crate::validate::DefaultEventValidator;

fn memory_store() -> Store {
    Store::builder()
        .signer(Arc::new(Ed25519Keyring::from_seed("k1", &[3; 32])))
        .validator(Arc::new(DefaultEventValidator::new()))
        .in_memory()
        .expect("failed to open in-memory store")
        .build()
        .expect("failed to build store")
}

fn ctx() -> CallContext {
    CallContext::background()
}

fn append(store: &Store, campaign_id: &str, n: u32) -> Event {
    store
        .append_event(
            &ctx(),
            NewEvent::new(
                campaign_id,
                "scene.started",
                "user",
                format!(r#"{{"n":{n}}}"#).into_bytes(),
            ),
        )
        .expect("failed to append event")
}

/// A time safely after every enqueue in the test.
fn later() -> DateTime<Utc> {
    truncate_to_millis(Utc::now() + ChronoDuration::seconds(1))
}

fn ok_applier(_: &CallContext, _: &Event) -> Result<(), ApplyError> {
    Ok(())
}

fn failing_applier(_: &CallContext, _: &Event) -> Result<(), ApplyError> {
    Err("projection store unavailable".into())
}

fn row(store: &Store, campaign_id: &str, seq: u64) -> Option<OutboxRow> {
    store
        .list_projection_apply_outbox_rows(&ctx(), "", 100)
        .unwrap()
        .into_iter()
        .find(|r| r.campaign_id == campaign_id && r.seq == seq)
}

#[test]
fn append_enqueues_pending_row() {
    let store = memory_store();
    let event = append(&store, "camp", 1);

    let pending = row(&store, "camp", 1).expect("row should be enqueued");
    assert_eq!(pending.status, OutboxStatus::Pending);
    assert_eq!(pending.attempt_count, 0);
    assert_eq!(pending.event_type, event.event_type);
    assert_eq!(pending.last_error, "");

    let summary = store.get_projection_apply_outbox_summary(&ctx()).unwrap();
    assert_eq!(summary.pending_count, 1);
    assert_eq!(summary.total(), 1);
    let oldest = summary.oldest.unwrap();
    assert_eq!((oldest.campaign_id.as_str(), oldest.seq), ("camp", 1));
}

#[test]
fn successful_apply_deletes_row() {
    let store = memory_store();
    append(&store, "camp", 1);
    append(&store, "camp", 2);

    let seen = AtomicUsize::new(0);
    let applier = |_: &CallContext, event: &Event| -> Result<(), ApplyError> {
        assert_eq!(event.campaign_id, "camp");
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    };

    let attempted = store
        .process_projection_apply_outbox(&ctx(), later(), 10, Some(&applier))
        .unwrap();
    assert_eq!(attempted, 2);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(
        store.get_projection_apply_outbox_summary(&ctx()).unwrap(),
        OutboxSummary::default()
    );
}

#[test]
fn processing_respects_limit_in_due_order() {
    let store = memory_store();
    for n in 1..=3 {
        append(&store, "camp", n);
    }

    let order = std::sync::Mutex::new(Vec::new());
    let applier = |_: &CallContext, event: &Event| -> Result<(), ApplyError> {
        order.lock().unwrap().push(event.seq);
        Ok(())
    };
    let attempted = store
        .process_projection_apply_outbox(&ctx(), later(), 2, Some(&applier))
        .unwrap();

    assert_eq!(attempted, 2);
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    assert!(row(&store, "camp", 3).is_some());
}

#[test]
fn failure_schedules_retry_with_backoff() {
    let store = memory_store();
    append(&store, "camp", 1);
    let now = later();

    let attempted = store
        .process_projection_apply_outbox(&ctx(), now, 10, Some(&failing_applier))
        .unwrap();
    assert_eq!(attempted, 1);

    let failed = row(&store, "camp", 1).unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.attempt_count, 1);
    assert_eq!(failed.last_error, "projection store unavailable");
    assert_eq!(failed.next_attempt_at, now + ChronoDuration::seconds(1));

    // Not yet due.
    assert_eq!(
        store
            .process_projection_apply_outbox(&ctx(), now, 10, Some(&ok_applier))
            .unwrap(),
        0
    );
    // Due once the backoff elapses; success clears it.
    assert_eq!(
        store
            .process_projection_apply_outbox(
                &ctx(),
                now + ChronoDuration::seconds(1),
                10,
                Some(&ok_applier)
            )
            .unwrap(),
        1
    );
    assert!(row(&store, "camp", 1).is_none());
}

#[test]
fn eight_failures_dead_letter_the_row() {
    let store = memory_store();
    append(&store, "camp", 1);

    let mut now = later();
    for attempt in 1..=OUTBOX_DEAD_LETTER_THRESHOLD {
        let attempted = store
            .process_projection_apply_outbox(&ctx(), now, 10, Some(&failing_applier))
            .unwrap();
        assert_eq!(attempted, 1, "attempt {attempt} should claim the row");
        now += ChronoDuration::minutes(10);
    }

    let dead = row(&store, "camp", 1).unwrap();
    assert_eq!(dead.status, OutboxStatus::Dead);
    assert_eq!(dead.attempt_count, OUTBOX_DEAD_LETTER_THRESHOLD);
    assert_eq!(dead.last_error, "projection store unavailable");

    // Dead rows are never claimed.
    assert_eq!(
        store
            .process_projection_apply_outbox(&ctx(), now, 10, Some(&ok_applier))
            .unwrap(),
        0
    );
    let summary = store.get_projection_apply_outbox_summary(&ctx()).unwrap();
    assert_eq!(summary.dead_count, 1);
    assert!(summary.oldest.is_none());
}

#[test]
fn requeue_revives_only_dead_rows() {
    let store = memory_store();
    append(&store, "camp", 1);
    append(&store, "camp", 2);
    store
        .lock()
        .unwrap()
        .execute(
            "UPDATE projection_apply_outbox
             SET status = 'dead', attempt_count = 8, last_error = 'boom'
             WHERE seq = 1",
            [],
        )
        .unwrap();

    let now = later();
    assert!(store.requeue_projection_apply_outbox_row(&ctx(), "camp", 1, now).unwrap());
    let revived = row(&store, "camp", 1).unwrap();
    assert_eq!(revived.status, OutboxStatus::Pending);
    assert_eq!(revived.attempt_count, 0);
    assert_eq!(revived.last_error, "");
    assert_eq!(revived.next_attempt_at, now);

    // Pending and missing rows are left alone.
    assert!(!store.requeue_projection_apply_outbox_row(&ctx(), "camp", 2, now).unwrap());
    assert!(!store.requeue_projection_apply_outbox_row(&ctx(), "camp", 9, now).unwrap());

    assert!(matches!(
        store.requeue_projection_apply_outbox_row(&ctx(), "", 1, now),
        Err(StoreError::Validation(_))
    ));
    assert!(matches!(
        store.requeue_projection_apply_outbox_row(&ctx(), "camp", 0, now),
        Err(StoreError::Validation(_))
    ));
}

#[test]
fn bulk_requeue_takes_oldest_dead_rows() {
    let store = memory_store();
    for n in 1..=3 {
        append(&store, "camp", n);
    }
    {
        let conn = store.lock().unwrap();
        for (seq, next_attempt_ms) in [(1_i64, 3_000_i64), (2, 1_000), (3, 2_000)] {
            conn.execute(
                "UPDATE projection_apply_outbox
                 SET status = 'dead', attempt_count = 8, next_attempt_at_ms = ?2
                 WHERE seq = ?1",
                params![seq, next_attempt_ms],
            )
            .unwrap();
        }
    }

    let requeued = store
        .requeue_projection_apply_outbox_dead_rows(&ctx(), 2, later())
        .unwrap();
    assert_eq!(requeued, 2);
    assert_eq!(row(&store, "camp", 2).unwrap().status, OutboxStatus::Pending);
    assert_eq!(row(&store, "camp", 3).unwrap().status, OutboxStatus::Pending);
    assert_eq!(row(&store, "camp", 1).unwrap().status, OutboxStatus::Dead);

    assert!(matches!(
        store.requeue_projection_apply_outbox_dead_rows(&ctx(), 0, later()),
        Err(StoreError::Validation(_))
    ));
}

#[test]
fn stale_claims_are_reclaimed() {
    let store = memory_store();
    append(&store, "camp", 1);
    append(&store, "camp", 2);
    let now = later();
    let stale_ms = (now - ChronoDuration::minutes(10)).timestamp_millis();
    let fresh_ms = (now - ChronoDuration::minutes(1)).timestamp_millis();
    {
        let conn = store.lock().unwrap();
        conn.execute(
            "UPDATE projection_apply_outbox SET status = 'processing', updated_at_ms = ?1 WHERE seq = 1",
            params![stale_ms],
        )
        .unwrap();
        conn.execute(
            "UPDATE projection_apply_outbox SET status = 'processing', updated_at_ms = ?1 WHERE seq = 2",
            params![fresh_ms],
        )
        .unwrap();
    }

    let attempted = store
        .process_projection_apply_outbox(&ctx(), now, 10, Some(&ok_applier))
        .unwrap();
    assert_eq!(attempted, 1);
    assert!(row(&store, "camp", 1).is_none());
    assert_eq!(row(&store, "camp", 2).unwrap().status, OutboxStatus::Processing);
}

#[test]
fn stale_reclaim_counts_the_abandoned_attempt() {
    let store = memory_store();
    append(&store, "camp", 1);
    let now = later();
    let stale_ms = (now - ChronoDuration::minutes(10)).timestamp_millis();
    store
        .lock()
        .unwrap()
        .execute(
            "UPDATE projection_apply_outbox
             SET status = 'processing', attempt_count = 2, updated_at_ms = ?1",
            params![stale_ms],
        )
        .unwrap();

    store
        .process_projection_apply_outbox(&ctx(), now, 10, Some(&failing_applier))
        .unwrap();

    // One attempt for the crashed worker, one for this failure.
    let failed = row(&store, "camp", 1).unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.attempt_count, 4);
}

#[test]
fn stale_claim_on_last_attempt_is_dead_lettered() {
    let store = memory_store();
    append(&store, "camp", 1);
    let now = later();
    let stale_ms = (now - ChronoDuration::minutes(10)).timestamp_millis();
    store
        .lock()
        .unwrap()
        .execute(
            "UPDATE projection_apply_outbox
             SET status = 'processing', attempt_count = ?1, updated_at_ms = ?2",
            params![OUTBOX_DEAD_LETTER_THRESHOLD - 1, stale_ms],
        )
        .unwrap();

    let applied = AtomicUsize::new(0);
    let counting = |_: &CallContext, _: &Event| -> Result<(), ApplyError> {
        applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    };
    let attempted = store
        .process_projection_apply_outbox(&ctx(), now, 10, Some(&counting))
        .unwrap();
    assert_eq!(attempted, 0);
    assert_eq!(applied.load(Ordering::SeqCst), 0);

    let dead = row(&store, "camp", 1).unwrap();
    assert_eq!(dead.status, OutboxStatus::Dead);
    assert_eq!(dead.attempt_count, OUTBOX_DEAD_LETTER_THRESHOLD);
    assert_eq!(dead.last_error, STALE_CLAIM_ERROR);
}

#[test]
fn summary_oldest_skips_dead_rows_and_includes_claims() {
    let store = memory_store();
    for n in 1..=3 {
        append(&store, "camp", n);
    }
    let base = later().timestamp_millis();
    {
        let conn = store.lock().unwrap();
        conn.execute(
            "UPDATE projection_apply_outbox
             SET status = 'dead', attempt_count = 8, next_attempt_at_ms = ?1 WHERE seq = 1",
            params![base - 30_000],
        )
        .unwrap();
        conn.execute(
            "UPDATE projection_apply_outbox SET next_attempt_at_ms = ?1 WHERE seq = 2",
            params![base - 10_000],
        )
        .unwrap();
        conn.execute(
            "UPDATE projection_apply_outbox
             SET status = 'processing', next_attempt_at_ms = ?1, updated_at_ms = ?2 WHERE seq = 3",
            params![base - 20_000, base],
        )
        .unwrap();
    }

    let summary = store.get_projection_apply_outbox_summary(&ctx()).unwrap();
    assert_eq!(summary.pending_count, 1);
    assert_eq!(summary.processing_count, 1);
    assert_eq!(summary.failed_count, 0);
    assert_eq!(summary.dead_count, 1);

    let oldest = summary.oldest.expect("a live row should be reported");
    assert_eq!(oldest.seq, 3);
    assert_eq!(oldest.status, OutboxStatus::Processing);
    assert_eq!(oldest.next_attempt_at.timestamp_millis(), base - 20_000);
}

#[test]
fn missing_event_is_recorded_as_load_failure() {
    let store = memory_store();
    append(&store, "camp", 1);
    store
        .lock()
        .unwrap()
        .execute("DELETE FROM events WHERE seq = 1", [])
        .unwrap();

    store
        .process_projection_apply_outbox(&ctx(), later(), 10, Some(&ok_applier))
        .unwrap();
    let failed = row(&store, "camp", 1).unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert!(failed.last_error.starts_with(LOAD_EVENT_ERROR_PREFIX));
}

#[test]
fn processing_requires_an_applier_and_positive_limit() {
    let store = memory_store();
    append(&store, "camp", 1);

    assert!(matches!(
        store.process_projection_apply_outbox(&ctx(), later(), 10, None),
        Err(StoreError::Config(_))
    ));
    assert!(matches!(
        store.process_projection_apply_outbox(&ctx(), later(), 0, Some(&ok_applier)),
        Err(StoreError::Validation(_))
    ));
    assert_eq!(row(&store, "camp", 1).unwrap().status, OutboxStatus::Pending);
}

#[test]
fn shadow_worker_records_failures_without_applying() {
    let store = memory_store();
    append(&store, "camp", 1);
    let now = later();

    let attempted = store
        .process_projection_apply_outbox_shadow(&ctx(), now, 10)
        .unwrap();
    assert_eq!(attempted, 1);

    let failed = row(&store, "camp", 1).unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.attempt_count, 1);
    assert_eq!(failed.last_error, SHADOW_WORKER_ERROR);
}

#[test]
fn cancellation_stops_between_rows() {
    let store = memory_store();
    for n in 1..=3 {
        append(&store, "camp", n);
    }
    let ctx = ctx();
    let applier = |ctx: &CallContext, _: &Event| -> Result<(), ApplyError> {
        ctx.token().cancel();
        Ok(())
    };

    let attempted = store
        .process_projection_apply_outbox(&ctx, later(), 10, Some(&applier))
        .unwrap();
    assert_eq!(attempted, 1);

    // Unprocessed claims are released, not left processing.
    let background = CallContext::background();
    let rows = store
        .list_projection_apply_outbox_rows(&background, "pending", 10)
        .unwrap();
    assert_eq!(rows.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![2, 3]);
}

#[test]
fn listing_filters_by_status() {
    let store = memory_store();
    append(&store, "camp", 1);
    append(&store, "camp", 2);
    store
        .process_projection_apply_outbox_shadow(&ctx(), later(), 1)
        .unwrap();

    let failed = store
        .list_projection_apply_outbox_rows(&ctx(), "failed", 10)
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].seq, 1);
    assert_eq!(
        store
            .list_projection_apply_outbox_rows(&ctx(), " pending ", 10)
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        store
            .list_projection_apply_outbox_rows(&ctx(), "", 10)
            .unwrap()
            .len(),
        2
    );

    assert!(matches!(
        store.list_projection_apply_outbox_rows(&ctx(), "done", 10),
        Err(StoreError::Validation(_))
    ));
    assert!(
        store
            .list_projection_apply_outbox_rows(&ctx(), "", 0)
            .unwrap()
            .is_empty()
    );
    assert!(matches!(
        store.list_projection_apply_outbox_rows(&ctx(), "done", 0),
        Err(StoreError::Validation(_))
    ));
}
