//! Mode resolution and transitions against real and failing connectors.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use hll_core::StorageMode;
use hll_core::logging::capture_logs;
use hll_storage::{BackendKind, ModeController, ModeSources, StorageBackend, StorageError};
use tracing::Level;

use common::{StaticConnector, TestBackend, legacy_store};

fn legacy(dir: &tempfile::TempDir) -> Arc<dyn StorageBackend> {
    Arc::new(legacy_store(dir.path(), "sessions.db"))
}

fn env(mode: &str) -> ModeSources {
    ModeSources {
        env: Some(mode.to_string()),
        ..ModeSources::default()
    }
}

#[tokio::test]
async fn start_without_connection_string_falls_back_to_legacy() {
    let (logs, _guard) = capture_logs();
    let dir = tempfile::tempdir().unwrap();
    let controller = ModeController::start(legacy(&dir), None, &env("dual")).await;
    assert_eq!(controller.mode(), StorageMode::Legacy);
    assert!(logs.has_event(Level::WARN, "forcing legacy storage mode"));
}

#[tokio::test]
async fn start_with_unreachable_central_falls_back_to_legacy() {
    let dir = tempfile::tempdir().unwrap();
    let controller =
        ModeController::start(legacy(&dir), Some(StaticConnector::failing()), &env("central"))
            .await;
    assert_eq!(controller.mode(), StorageMode::Legacy);
    assert!(controller.snapshot().secondary().is_none());
}

#[tokio::test]
async fn start_honors_priority_order() {
    let dir = tempfile::tempdir().unwrap();
    let central = TestBackend::central(dir.path());
    let sources = ModeSources {
        runtime_override: Some("dual".into()),
        env: Some("central".into()),
        persisted: Some(StorageMode::Legacy),
    };
    let controller = ModeController::start(
        legacy(&dir),
        Some(StaticConnector::new(central as Arc<dyn StorageBackend>)),
        &sources,
    )
    .await;
    assert_eq!(controller.mode(), StorageMode::Dual);
    let state = controller.snapshot();
    assert_eq!(state.primary().kind(), BackendKind::Legacy);
    assert_eq!(state.secondary().map(|b| b.kind()), Some(BackendKind::Central));
}

#[tokio::test]
async fn dual_requires_reachable_central() {
    let dir = tempfile::tempdir().unwrap();
    let central = TestBackend::central(dir.path());
    central.set_unreachable(true);
    let controller = ModeController::new(
        legacy(&dir),
        Some(StaticConnector::new(Arc::clone(&central) as Arc<dyn StorageBackend>)),
    );

    assert_matches!(
        controller.transition(StorageMode::Dual).await,
        Err(StorageError::ModeTransitionRejected {
            from: StorageMode::Legacy,
            to: StorageMode::Dual,
            ..
        })
    );
    assert_eq!(controller.mode(), StorageMode::Legacy);

    central.set_unreachable(false);
    assert_eq!(
        controller.transition(StorageMode::Dual).await.unwrap(),
        StorageMode::Dual
    );
}

#[tokio::test]
async fn legacy_cannot_jump_to_central() {
    let dir = tempfile::tempdir().unwrap();
    let central = TestBackend::central(dir.path());
    let controller = ModeController::new(
        legacy(&dir),
        Some(StaticConnector::new(central as Arc<dyn StorageBackend>)),
    );
    assert_matches!(
        controller.transition(StorageMode::Central).await,
        Err(StorageError::ModeTransitionRejected { .. })
    );
    assert_eq!(controller.mode(), StorageMode::Legacy);
}

#[tokio::test]
async fn full_migration_path() {
    let dir = tempfile::tempdir().unwrap();
    let central = TestBackend::central(dir.path());
    let controller = ModeController::new(
        legacy(&dir),
        Some(StaticConnector::new(central as Arc<dyn StorageBackend>)),
    );
    controller.transition(StorageMode::Dual).await.unwrap();
    controller.transition(StorageMode::Central).await.unwrap();

    let state = controller.snapshot();
    assert_eq!(state.mode(), StorageMode::Central);
    assert_eq!(state.primary().kind(), BackendKind::Central);
    assert!(state.secondary().is_none());

    // no way back once legacy is retired
    assert_matches!(
        controller.transition(StorageMode::Dual).await,
        Err(StorageError::ModeTransitionRejected { .. })
    );
}

#[tokio::test]
async fn snapshot_is_stable_across_transition() {
    let dir = tempfile::tempdir().unwrap();
    let central = TestBackend::central(dir.path());
    let controller = ModeController::new(
        legacy(&dir),
        Some(StaticConnector::new(central as Arc<dyn StorageBackend>)),
    );
    let before = controller.snapshot();
    controller.transition(StorageMode::Dual).await.unwrap();
    assert_eq!(before.mode(), StorageMode::Legacy);
    assert_eq!(controller.snapshot().mode(), StorageMode::Dual);
}

#[tokio::test]
async fn reload_rejects_invalid_change_and_keeps_mode() {
    let (logs, _guard) = capture_logs();
    let dir = tempfile::tempdir().unwrap();
    let controller = ModeController::new(legacy(&dir), None);
    assert!(controller.reload(&env("dual")).await.is_err());
    assert_eq!(controller.mode(), StorageMode::Legacy);
    assert!(logs.has_event(Level::WARN, "mode reload rejected"));
}
