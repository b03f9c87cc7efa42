//! Wiring of the storage subsystem from [`StorageSettings`].

use std::sync::Arc;

use hll_settings::StorageSettings;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{AuditConfig, ConsistencyAuditor};
use crate::backend::StorageBackend;
use crate::central::{PgConnector, pool::connection_url};
use crate::coordinator::DualWriteCoordinator;
use crate::errors::Result;
use crate::legacy::LegacyStore;
use crate::mode::{CentralConnector, ModeController, ModeSources};

/// Running storage subsystem: coordinator plus the background auditor.
pub struct StorageService {
    coordinator: Arc<DualWriteCoordinator>,
    auditor: Option<Arc<ConsistencyAuditor>>,
    cancel: CancellationToken,
    audit_task: Mutex<Option<JoinHandle<()>>>,
}

impl StorageService {
    /// Open the legacy store, resolve the mode from `HLL_STORAGE_MODE` and
    /// the settings file, and start. Only a legacy store failure is fatal;
    /// an unreachable central store leaves the service in legacy mode.
    pub async fn open(settings: &StorageSettings) -> Result<Self> {
        let legacy: Arc<dyn StorageBackend> = Arc::new(LegacyStore::open(&settings.legacy)?);
        let connector: Option<Arc<dyn CentralConnector>> = connection_url(&settings.central)
            .ok()
            .map(|_| {
                Arc::new(PgConnector::new(settings.central.clone())) as Arc<dyn CentralConnector>
            });
        let sources = ModeSources::from_env(settings.mode);
        Ok(Self::start(legacy, connector, &sources, settings).await)
    }

    /// Start over explicit backends.
    pub async fn start(
        legacy: Arc<dyn StorageBackend>,
        connector: Option<Arc<dyn CentralConnector>>,
        sources: &ModeSources,
        settings: &StorageSettings,
    ) -> Self {
        let controller = Arc::new(ModeController::start(legacy, connector, sources).await);
        let coordinator = Arc::new(DualWriteCoordinator::new(controller, &settings.replication));
        let cancel = CancellationToken::new();

        let (auditor, audit_task) = if settings.audit.enabled {
            let auditor = Arc::new(ConsistencyAuditor::for_coordinator(
                &coordinator,
                AuditConfig::from(&settings.audit),
            ));
            let task = tokio::spawn({
                let auditor = Arc::clone(&auditor);
                let cancel = cancel.child_token();
                async move { auditor.run(cancel).await }
            });
            (Some(auditor), Some(task))
        } else {
            (None, None)
        };

        info!(
            mode = %coordinator.mode(),
            audit = settings.audit.enabled,
            "storage service started"
        );
        Self {
            coordinator,
            auditor,
            cancel,
            audit_task: Mutex::new(audit_task),
        }
    }

    /// Caller-facing storage API.
    pub fn coordinator(&self) -> &Arc<DualWriteCoordinator> {
        &self.coordinator
    }

    /// Background auditor, when enabled.
    pub fn auditor(&self) -> Option<&Arc<ConsistencyAuditor>> {
        self.auditor.as_ref()
    }

    /// Stop the auditor and wait for queued secondary writes. Returns
    /// `false` if the replication backlog did not drain in time.
    pub async fn shutdown(&self) -> bool {
        self.cancel.cancel();
        let task = self.audit_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "auditor task failed");
            }
        }
        let drained = self.coordinator.drain().await;
        info!(drained, mode = %self.coordinator.mode(), "storage service stopped");
        drained
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use hll_core::StorageMode;
    use hll_settings::{AuditSettings, LegacySettings};

    fn settings(dir: &tempfile::TempDir, audit: bool) -> StorageSettings {
        StorageSettings {
            legacy: LegacySettings {
                path: dir.path().join("sessions.db").to_string_lossy().into_owned(),
                ..LegacySettings::default()
            },
            audit: AuditSettings {
                enabled: audit,
                interval_secs: 1,
                ..AuditSettings::default()
            },
            ..StorageSettings::default()
        }
    }

    #[tokio::test]
    async fn legacy_mode_without_auditor() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(&dir, false);
        settings.mode = Some(StorageMode::Legacy);
        let service = StorageService::start(
            Arc::new(LegacyStore::open(&settings.legacy).unwrap()),
            None,
            &ModeSources {
                persisted: settings.mode,
                ..ModeSources::default()
            },
            &settings,
        )
        .await;
        assert_eq!(service.coordinator().mode(), StorageMode::Legacy);
        assert!(service.auditor().is_none());
        assert!(service.shutdown().await);
    }

    #[tokio::test]
    async fn shutdown_stops_auditor() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir, true);
        let service = StorageService::start(
            Arc::new(LegacyStore::open(&settings.legacy).unwrap()),
            None,
            &ModeSources::default(),
            &settings,
        )
        .await;
        assert!(service.auditor().is_some());
        assert!(service.shutdown().await);
        assert!(service.audit_task.lock().is_none());
    }

    #[tokio::test]
    async fn dual_request_without_url_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir, false);
        let service = StorageService::start(
            Arc::new(LegacyStore::open(&settings.legacy).unwrap()),
            None,
            &ModeSources::default().with_override("dual"),
            &settings,
        )
        .await;
        assert_eq!(service.coordinator().mode(), StorageMode::Legacy);
    }
}
