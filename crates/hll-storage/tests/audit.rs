//! Consistency audit across two live backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use hll_core::logging::capture_logs;
use hll_core::{SessionId, StorageMode};
use hll_settings::ReplicationSettings;
use hll_storage::{
    AuditConfig, BackendKind, ConsistencyAuditor, DualWriteCoordinator, Mismatch, ModeController,
    StorageBackend,
};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use common::{StaticConnector, TestBackend, event, events, legacy_store, meta};

struct Fixture {
    _dir: tempfile::TempDir,
    legacy: Arc<TestBackend>,
    central: Arc<TestBackend>,
    storage: Arc<DualWriteCoordinator>,
}

async fn dual() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let legacy = TestBackend::new(
        Arc::new(legacy_store(dir.path(), "sessions.db")),
        BackendKind::Legacy,
    );
    let central = TestBackend::central(dir.path());
    let controller = Arc::new(ModeController::new(
        Arc::clone(&legacy) as Arc<dyn StorageBackend>,
        Some(StaticConnector::new(Arc::clone(&central) as Arc<dyn StorageBackend>)),
    ));
    let storage = Arc::new(DualWriteCoordinator::new(
        controller,
        &ReplicationSettings {
            max_retries: 0,
            ..ReplicationSettings::default()
        },
    ));
    storage.transition(StorageMode::Dual).await.unwrap();
    Fixture {
        _dir: dir,
        legacy,
        central,
        storage,
    }
}

fn config(tolerance: u64, confirmations: u32, checksums: bool) -> AuditConfig {
    AuditConfig {
        interval: Duration::from_millis(10),
        count_tolerance: tolerance,
        confirmations,
        checksums,
    }
}

#[tokio::test]
async fn replicated_sessions_audit_clean() {
    let f = dual().await;
    for id in 1..=3 {
        f.storage.create_session(&meta(id)).await.unwrap();
        f.storage
            .append_events(SessionId::new(id), events(1..=5))
            .await
            .unwrap();
    }
    assert!(f.storage.drain().await);

    let auditor = ConsistencyAuditor::for_coordinator(&f.storage, config(0, 1, true));
    let report = auditor.audit_once().await.unwrap();
    assert!(!report.skipped);
    assert_eq!(report.sessions_checked, 3);
    assert!(report.is_clean());
}

#[tokio::test]
async fn count_gap_alerts_after_confirmations() {
    let (logs, _guard) = capture_logs();
    let f = dual().await;
    let id = SessionId::new(42);
    f.storage.create_session(&meta(42)).await.unwrap();
    assert!(f.storage.drain().await);
    // bypass replication so only legacy has the events
    f.legacy.append_events(id, &events(1..=10)).await.unwrap();

    let auditor = ConsistencyAuditor::for_coordinator(&f.storage, config(2, 2, false));
    let first = auditor.audit_once().await.unwrap();
    assert_eq!(first.suspects.len(), 1);
    assert!(first.alerts.is_empty());
    assert_eq!(
        first.suspects[0].mismatch,
        Mismatch::Count {
            legacy: 10,
            central: 0
        }
    );

    let second = auditor.audit_once().await.unwrap();
    assert_eq!(second.alerts.len(), 1);
    assert_eq!(second.alerts[0].session_id, id);
    assert!(logs.has_event(Level::ERROR, "backends inconsistent"));
}

#[tokio::test]
async fn gap_within_tolerance_is_ignored() {
    let f = dual().await;
    let id = SessionId::new(5);
    f.storage.create_session(&meta(5)).await.unwrap();
    assert!(f.storage.drain().await);
    f.legacy.append_events(id, &events(1..=2)).await.unwrap();

    let auditor = ConsistencyAuditor::for_coordinator(&f.storage, config(2, 1, false));
    assert!(auditor.audit_once().await.unwrap().is_clean());
}

#[tokio::test]
async fn differing_content_fails_checksum() {
    let f = dual().await;
    let id = SessionId::new(6);
    f.storage.create_session(&meta(6)).await.unwrap();
    assert!(f.storage.drain().await);

    let mut altered = event(1);
    altered.payload.message = Some("edited".into());
    f.legacy.append_events(id, &[event(1)]).await.unwrap();
    f.central.append_events(id, &[altered]).await.unwrap();

    let auditor = ConsistencyAuditor::for_coordinator(&f.storage, config(0, 1, true));
    let report = auditor.audit_once().await.unwrap();
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts[0].mismatch.label(), "checksum");
}

#[tokio::test]
async fn session_missing_from_central_is_reported() {
    let f = dual().await;
    f.legacy.create_session(&meta(77)).await.unwrap();

    let auditor = ConsistencyAuditor::for_coordinator(&f.storage, config(0, 1, false));
    let report = auditor.audit_once().await.unwrap();
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(
        report.alerts[0].mismatch,
        Mismatch::Missing {
            backend: BackendKind::Central
        }
    );
}

#[tokio::test]
async fn divergences_are_collected_once() {
    let f = dual().await;
    let id = SessionId::new(8);
    f.storage.create_session(&meta(8)).await.unwrap();
    assert!(f.storage.drain().await);
    f.central.set_unreachable(true);
    f.storage.append_events(id, events(1..=1)).await.unwrap();
    assert!(f.storage.drain().await);
    f.central.set_unreachable(false);

    let auditor = ConsistencyAuditor::for_coordinator(&f.storage, config(5, 3, false));
    let first = auditor.audit_once().await.unwrap();
    assert_eq!(first.divergences.len(), 1);
    assert_eq!(first.divergences[0].session_id, id);
    let second = auditor.audit_once().await.unwrap();
    assert!(second.divergences.is_empty());
}

#[tokio::test]
async fn run_stops_on_cancel() {
    let f = dual().await;
    let auditor = Arc::new(ConsistencyAuditor::for_coordinator(
        &f.storage,
        config(0, 1, false),
    ));
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let auditor = Arc::clone(&auditor);
        let cancel = cancel.clone();
        async move { auditor.run(cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
