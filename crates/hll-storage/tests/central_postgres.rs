//! Central store against a live Postgres.
//!
//! Runs only when `HLL_TEST_DATABASE_URL` is set; otherwise every test
//! returns early.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use assert_matches::assert_matches;
use chrono::{Duration, TimeZone, Utc};
use futures::TryStreamExt;
use hll_core::{EventRange, LogEvent, SessionId};
use hll_settings::CentralSettings;
use hll_storage::backfill::{BackfillMigrator, BackfillOptions};
use hll_storage::central::MonthKey;
use hll_storage::{CentralStore, StorageBackend, StorageError, read_events};

use common::{event, events, legacy_store, meta, t0};

const DATABASE_URL_ENV: &str = "HLL_TEST_DATABASE_URL";

async fn store() -> Option<CentralStore> {
    let url = std::env::var(DATABASE_URL_ENV).ok()?;
    let settings = CentralSettings {
        url: Some(url),
        pool_max_size: 4,
        read_page_size: 3,
        ..CentralSettings::default()
    };
    Some(CentralStore::connect(&settings).await.unwrap())
}

static NEXT: AtomicI64 = AtomicI64::new(0);

/// Ids derived from the clock so reruns against one database never collide.
fn fresh_id() -> i64 {
    let micros = Utc::now().timestamp_micros() % 1_000_000_000_000;
    1_000_000_000 + micros * 16 + NEXT.fetch_add(1, Ordering::Relaxed) % 16
}

#[tokio::test]
async fn lifecycle_and_conflict() {
    let Some(store) = store().await else { return };
    let raw = fresh_id();
    let id = SessionId::new(raw);

    store.create_session(&meta(raw)).await.unwrap();
    assert_matches!(
        store.create_session(&meta(raw)).await,
        Err(StorageError::AlreadyExists(_))
    );
    store.append_events(id, &events(1..=3)).await.unwrap();
    store.close_session(id, t0() + Duration::hours(1)).await.unwrap();

    let read: Vec<LogEvent> = read_events(Arc::new(store.clone()), id, EventRange::all())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(read, events(1..=3));
    assert_matches!(
        store.append_events(id, &[event(2)]).await,
        Err(StorageError::Conflict { .. })
    );
    store.delete_session(id).await.unwrap();
}

#[tokio::test]
async fn events_spanning_months_create_partitions() {
    let Some(store) = store().await else { return };
    let raw = fresh_id();
    let id = SessionId::new(raw);
    store.create_session(&meta(raw)).await.unwrap();

    let mut batch = events(1..=2);
    batch[1].event_time = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 1).unwrap();
    store.append_events(id, &batch).await.unwrap();

    assert!(store.partitions().is_known(MonthKey::new(2024, 3).unwrap()));
    assert!(store.partitions().is_known(MonthKey::new(2024, 4).unwrap()));
    let stats = store.session_stats(id).await.unwrap();
    assert_eq!(stats.event_count, 2);
    assert_eq!(stats.last_seq, Some(2));
    store.delete_session(id).await.unwrap();
}

#[tokio::test]
async fn deleted_id_is_retired() {
    let Some(store) = store().await else { return };
    let raw = fresh_id();
    let id = SessionId::new(raw);
    store.create_session(&meta(raw)).await.unwrap();
    store.append_events(id, &events(1..=2)).await.unwrap();
    store.delete_session(id).await.unwrap();

    assert!(store.get_session(id).await.unwrap().is_none());
    assert_matches!(
        store.create_session(&meta(raw)).await,
        Err(StorageError::AlreadyExists(_))
    );
    assert_matches!(
        store.session_stats(id).await,
        Err(StorageError::UnknownSession(_))
    );
}

#[tokio::test]
async fn backfill_from_sqlite() {
    let Some(store) = store().await else { return };
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(legacy_store(dir.path(), "sessions.db"));
    let raw = fresh_id();
    let id = SessionId::new(raw);
    source.create_session(&meta(raw)).await.unwrap();
    source.append_events(id, &events(1..=12)).await.unwrap();

    let destination: Arc<dyn StorageBackend> = Arc::new(store.clone());
    let options = BackfillOptions {
        range: hll_core::SessionIdRange {
            start: Some(id),
            end: Some(id),
        },
        batch_size: 5,
        checksums: true,
        checkpoint_path: dir.path().join("cp.json"),
        ..BackfillOptions::default()
    };
    let report = BackfillMigrator::new(source, Arc::clone(&destination), options)
        .run()
        .await
        .unwrap();
    assert!(report.is_parity());
    assert_eq!(report.events_copied(), 12);
    assert_eq!(destination.session_stats(id).await.unwrap().event_count, 12);
    store.delete_session(id).await.unwrap();
}
