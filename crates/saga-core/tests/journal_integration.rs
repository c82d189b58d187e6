//! Integration tests for the campaign journal against an on-disk database.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use saga_core::context::CallContext;
use saga_core::crypto::Ed25519Keyring;
use saga_core::pagination::{CursorDir, PageCursor, PageRequest};
use saga_core::validate::DefaultEventValidator;
use saga_core::{IntegrityFailure, NewEvent, Store, StoreError};
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> Store {
    Store::builder()
        .open(dir.path().join("saga.db"))
        .expect("failed to open store")
        .signer(Arc::new(Ed25519Keyring::from_seed("k1", &[42; 32])))
        .validator(Arc::new(DefaultEventValidator::new()))
        .build()
        .expect("failed to build store")
}

fn new_event(campaign_id: &str, n: u32) -> NewEvent {
    NewEvent::new(
        campaign_id,
        "roll.resolved",
        "gm",
        format!(r#"{{"roll":{n}}}"#).into_bytes(),
    )
    .with_actor_id("gm-1")
    .with_timestamp(
        Utc.timestamp_millis_opt(1_710_000_000_000 + i64::from(n))
            .unwrap(),
    )
}

#[test]
fn camp_x_scenario() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let ctx = CallContext::background();

    let appended: Vec<_> = (1..=5)
        .map(|n| store.append_event(&ctx, new_event("camp-x", n)).unwrap())
        .collect();

    assert_eq!(store.get_latest_event_seq(&ctx, "camp-x").unwrap(), 5);

    let tail = store.list_events(&ctx, "camp-x", 3, 10).unwrap();
    assert_eq!(tail, appended[3..].to_vec());

    store.verify_event_integrity(&ctx).unwrap();
}

#[test]
fn ten_event_pagination() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let ctx = CallContext::background();
    for n in 1..=10 {
        store.append_event(&ctx, new_event("camp", n)).unwrap();
    }

    let first = store
        .list_events_page(
            &ctx,
            &PageRequest {
                page_size: 3,
                ..PageRequest::new("camp")
            },
        )
        .unwrap();
    assert_eq!(first.items.len(), 3);
    assert_eq!(first.total_count, 10);
    assert!(first.has_next_page);
    assert!(!first.has_prev_page);

    let newest_first = store
        .list_events_page(
            &ctx,
            &PageRequest {
                page_size: 3,
                descending: true,
                ..PageRequest::new("camp")
            },
        )
        .unwrap();
    assert_eq!(newest_first.items[0].seq, 10);

    let reverse = store
        .list_events_page(
            &ctx,
            &PageRequest {
                page_size: 3,
                cursor: Some(PageCursor {
                    seq: 8,
                    dir: CursorDir::Backward,
                }),
                cursor_reverse: true,
                ..PageRequest::new("camp")
            },
        )
        .unwrap();
    let seqs: Vec<u64> = reverse.items.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![5, 6, 7]);
}

#[test]
fn tampering_any_stored_column_is_detected() {
    let columns = [
        ("event_type", "'forged.type'"),
        ("actor_id", "'intruder'"),
        ("timestamp_ms", "timestamp_ms + 1"),
        ("prev_hash", "'00'"),
        ("chain_hash", "'00'"),
        ("signature", "'00'"),
    ];

    for (column, value) in columns {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let ctx = CallContext::background();
        for n in 1..=4 {
            store.append_event(&ctx, new_event("camp-t", n)).unwrap();
        }
        drop(store);

        let conn = rusqlite::Connection::open(dir.path().join("saga.db")).unwrap();
        conn.execute(
            &format!("UPDATE events SET {column} = {value} WHERE campaign_id = 'camp-t' AND seq = 3"),
            [],
        )
        .unwrap();
        drop(conn);

        let store = open_store(&dir);
        let err = store.verify_event_integrity(&ctx).unwrap_err();
        match err {
            StoreError::Integrity {
                campaign_id, seq, ..
            } => {
                assert_eq!(campaign_id, "camp-t", "column {column}");
                assert_eq!(seq, 3, "column {column}");
            },
            other => panic!("column {column}: expected integrity error, got {other:?}"),
        }
    }
}

#[test]
fn tampered_link_reports_prev_hash_mismatch() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let ctx = CallContext::background();
    for n in 1..=2 {
        store.append_event(&ctx, new_event("camp", n)).unwrap();
    }
    drop(store);

    let conn = rusqlite::Connection::open(dir.path().join("saga.db")).unwrap();
    conn.execute("UPDATE events SET prev_hash = 'ab' WHERE seq = 2", [])
        .unwrap();
    drop(conn);

    let err = open_store(&dir)
        .verify_campaign_integrity(&ctx, "camp")
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::Integrity {
            seq: 2,
            failure: IntegrityFailure::PrevHashMismatch,
            ..
        }
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn sequential_appends_form_a_dense_chain(count in 1u32..40) {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let ctx = CallContext::background();

        let events: Vec<_> = (0..count)
            .map(|n| store.append_event(&ctx, new_event("camp-p", n)).unwrap())
            .collect();

        for (index, event) in events.iter().enumerate() {
            prop_assert_eq!(event.seq, index as u64 + 1);
            if index == 0 {
                prop_assert_eq!(event.prev_hash.as_str(), "");
            } else {
                prop_assert_eq!(&event.prev_hash, &events[index - 1].chain_hash);
            }
        }
        prop_assert_eq!(
            store.verify_campaign_integrity(&ctx, "camp-p").unwrap(),
            u64::from(count)
        );
    }
}
