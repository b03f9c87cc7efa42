//! Mode Controller: which backend(s) serve storage calls.
//!
//! The active configuration is an immutable [`BackendState`] behind an
//! `Arc`. Every coordinator call takes a snapshot at its start and keeps it
//! until it finishes, so a mode change only affects later operations and no
//! caller ever observes a half-applied change. Changes are serialized by a
//! single transition lock and go through [`ModeController::transition`] (or
//! [`ModeController::reload`], which uses the same validation).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use hll_core::StorageMode;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend::StorageBackend;
use crate::errors::{Result, StorageError};

/// Environment variable consulted for the storage mode.
pub const STORAGE_MODE_ENV: &str = "HLL_STORAGE_MODE";

/// Produces a connected central backend.
#[async_trait]
pub trait CentralConnector: Send + Sync {
    /// Open a connection to the central store.
    async fn connect(&self) -> Result<Arc<dyn StorageBackend>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// BackendState
// ─────────────────────────────────────────────────────────────────────────────

/// Backends enabled for one mode.
#[derive(Clone)]
pub struct BackendState {
    mode: StorageMode,
    primary: Arc<dyn StorageBackend>,
    secondary: Option<Arc<dyn StorageBackend>>,
}

impl BackendState {
    /// Legacy store only.
    #[must_use]
    pub fn legacy_only(legacy: Arc<dyn StorageBackend>) -> Self {
        Self {
            mode: StorageMode::Legacy,
            primary: legacy,
            secondary: None,
        }
    }

    /// Legacy primary, central secondary.
    #[must_use]
    pub fn dual(legacy: Arc<dyn StorageBackend>, central: Arc<dyn StorageBackend>) -> Self {
        Self {
            mode: StorageMode::Dual,
            primary: legacy,
            secondary: Some(central),
        }
    }

    /// Central store only.
    #[must_use]
    pub fn central_only(central: Arc<dyn StorageBackend>) -> Self {
        Self {
            mode: StorageMode::Central,
            primary: central,
            secondary: None,
        }
    }

    /// Mode this state implements.
    #[must_use]
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Source of truth: receives writes first and serves every read.
    #[must_use]
    pub fn primary(&self) -> &Arc<dyn StorageBackend> {
        &self.primary
    }

    /// Replication target, only in dual mode.
    #[must_use]
    pub fn secondary(&self) -> Option<&Arc<dyn StorageBackend>> {
        self.secondary.as_ref()
    }
}

impl fmt::Debug for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendState")
            .field("mode", &self.mode)
            .field("primary", &self.primary.kind())
            .field("secondary", &self.secondary.as_ref().map(|s| s.kind()))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sources
// ─────────────────────────────────────────────────────────────────────────────

/// Inputs to mode resolution, highest priority first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModeSources {
    /// Explicit operator override.
    pub runtime_override: Option<String>,
    /// Value of `HLL_STORAGE_MODE`.
    pub env: Option<String>,
    /// Mode stored in the settings file.
    pub persisted: Option<StorageMode>,
}

impl ModeSources {
    /// Read the environment, keeping `persisted` as the fallback.
    #[must_use]
    pub fn from_env(persisted: Option<StorageMode>) -> Self {
        Self {
            runtime_override: None,
            env: std::env::var(STORAGE_MODE_ENV).ok(),
            persisted,
        }
    }

    /// Set the runtime override.
    #[must_use]
    pub fn with_override(mut self, mode: impl Into<String>) -> Self {
        self.runtime_override = Some(mode.into());
        self
    }

    /// Effective mode. Blank values are treated as unset; unparseable ones
    /// are logged and skipped.
    pub fn resolve(&self) -> StorageMode {
        let layered = [
            ("runtime override", self.runtime_override.as_deref()),
            ("environment", self.env.as_deref()),
        ];
        for (source, raw) in layered {
            let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
                continue;
            };
            match raw.parse::<StorageMode>() {
                Ok(mode) => return mode,
                Err(e) => warn!(source, value = raw, error = %e, "ignoring invalid storage mode"),
            }
        }
        self.persisted.unwrap_or_default()
    }
}

/// Whether an operator may move directly from `from` to `to`.
#[must_use]
pub fn transition_allowed(from: StorageMode, to: StorageMode) -> bool {
    use StorageMode::{Central, Dual, Legacy};
    from == to || matches!((from, to), (Legacy, Dual) | (Dual, Central) | (Dual, Legacy))
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the active [`BackendState`].
pub struct ModeController {
    state: RwLock<Arc<BackendState>>,
    // Held for the whole of a transition; caches the connected central store.
    transition: Mutex<Option<Arc<dyn StorageBackend>>>,
    legacy: Arc<dyn StorageBackend>,
    connector: Option<Arc<dyn CentralConnector>>,
}

impl ModeController {
    /// Controller fixed at legacy mode until a transition.
    #[must_use]
    pub fn new(
        legacy: Arc<dyn StorageBackend>,
        connector: Option<Arc<dyn CentralConnector>>,
    ) -> Self {
        Self {
            state: RwLock::new(Arc::new(BackendState::legacy_only(Arc::clone(&legacy)))),
            transition: Mutex::new(None),
            legacy,
            connector,
        }
    }

    /// Resolve `sources` and enter that mode. If the central store is needed
    /// but cannot be reached, logs a warning and stays in legacy mode.
    pub async fn start(
        legacy: Arc<dyn StorageBackend>,
        connector: Option<Arc<dyn CentralConnector>>,
        sources: &ModeSources,
    ) -> Self {
        let controller = Self::new(legacy, connector);
        let target = sources.resolve();
        if target != StorageMode::Legacy {
            let mut cached = controller.transition.lock().await;
            if let Err(e) = controller.apply(&mut cached, StorageMode::Legacy, target).await {
                warn!(requested = %target, error = %e, "forcing legacy storage mode");
            }
        }
        controller
    }

    /// Current state. Hold the snapshot for the duration of one operation.
    pub fn snapshot(&self) -> Arc<BackendState> {
        Arc::clone(&self.state.read())
    }

    /// Current mode.
    pub fn mode(&self) -> StorageMode {
        self.state.read().mode()
    }

    /// Operator-triggered mode change. Fails closed: on rejection the
    /// current state is untouched. Does not wait for in-flight writes; a
    /// serving process goes through the coordinator's `transition`.
    pub async fn transition(&self, target: StorageMode) -> Result<StorageMode> {
        let mut cached = self.transition.lock().await;
        let from = self.mode();
        if from == target {
            return Ok(target);
        }
        if !transition_allowed(from, target) {
            return Err(StorageError::ModeTransitionRejected {
                from,
                to: target,
                reason: "only legacy -> dual, dual -> central and dual -> legacy are allowed"
                    .into(),
            });
        }
        self.apply(&mut cached, from, target).await
    }

    /// Re-resolve after a configuration reload. A rejected change keeps the
    /// current mode and is logged.
    pub async fn reload(&self, sources: &ModeSources) -> Result<StorageMode> {
        let target = sources.resolve();
        let result = self.transition(target).await;
        if let Err(e) = &result {
            warn!(current = %self.mode(), requested = %target, error = %e, "mode reload rejected");
        }
        result
    }

    async fn apply(
        &self,
        cached: &mut Option<Arc<dyn StorageBackend>>,
        from: StorageMode,
        target: StorageMode,
    ) -> Result<StorageMode> {
        let state = match target {
            StorageMode::Legacy => BackendState::legacy_only(Arc::clone(&self.legacy)),
            StorageMode::Dual | StorageMode::Central => {
                let central = self.connect_central(cached).await.map_err(|reason| {
                    StorageError::ModeTransitionRejected {
                        from,
                        to: target,
                        reason,
                    }
                })?;
                if target == StorageMode::Dual {
                    BackendState::dual(Arc::clone(&self.legacy), central)
                } else {
                    BackendState::central_only(central)
                }
            }
        };
        *self.state.write() = Arc::new(state);
        info!(from = %from, to = %target, "storage mode changed");
        Ok(target)
    }

    async fn connect_central(
        &self,
        cached: &mut Option<Arc<dyn StorageBackend>>,
    ) -> std::result::Result<Arc<dyn StorageBackend>, String> {
        let Some(connector) = &self.connector else {
            return Err("central connection string is not set".into());
        };
        if let Some(central) = cached.as_ref() {
            if central.ping().await.is_ok() {
                return Ok(Arc::clone(central));
            }
        }
        let central = connector
            .connect()
            .await
            .map_err(|e| format!("central store unreachable: {e}"))?;
        central
            .ping()
            .await
            .map_err(|e| format!("central store did not answer ping: {e}"))?;
        *cached = Some(Arc::clone(&central));
        Ok(central)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::legacy::{ConnectionConfig, LegacyStore};
    use assert_matches::assert_matches;
    use hll_core::logging::capture_logs;

    fn sources(over: Option<&str>, env: Option<&str>, persisted: Option<StorageMode>) -> ModeSources {
        ModeSources {
            runtime_override: over.map(str::to_string),
            env: env.map(str::to_string),
            persisted,
        }
    }

    #[test]
    fn resolve_priority() {
        assert_eq!(sources(None, None, None).resolve(), StorageMode::Legacy);
        assert_eq!(
            sources(None, None, Some(StorageMode::Dual)).resolve(),
            StorageMode::Dual
        );
        assert_eq!(
            sources(None, Some("central"), Some(StorageMode::Dual)).resolve(),
            StorageMode::Central
        );
        assert_eq!(
            sources(Some("legacy"), Some("central"), Some(StorageMode::Dual)).resolve(),
            StorageMode::Legacy
        );
    }

    #[test]
    fn resolve_skips_invalid_and_blank() {
        let (logs, _guard) = capture_logs();
        assert_eq!(
            sources(Some("mysql"), Some("  "), Some(StorageMode::Dual)).resolve(),
            StorageMode::Dual
        );
        assert!(logs.has_event(tracing::Level::WARN, "ignoring invalid storage mode"));
    }

    #[test]
    fn allowed_transitions() {
        use StorageMode::{Central, Dual, Legacy};
        assert!(transition_allowed(Legacy, Dual));
        assert!(transition_allowed(Dual, Central));
        assert!(transition_allowed(Dual, Legacy));
        assert!(transition_allowed(Central, Central));
        assert!(!transition_allowed(Legacy, Central));
        assert!(!transition_allowed(Central, Dual));
        assert!(!transition_allowed(Central, Legacy));
    }

    fn legacy(dir: &tempfile::TempDir) -> Arc<dyn StorageBackend> {
        Arc::new(
            LegacyStore::open_path(&dir.path().join("sessions.db"), &ConnectionConfig::default())
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn start_without_connector_forces_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let controller =
            ModeController::start(legacy(&dir), None, &sources(Some("dual"), None, None)).await;
        assert_eq!(controller.mode(), StorageMode::Legacy);
        assert!(controller.snapshot().secondary().is_none());
    }

    #[tokio::test]
    async fn transition_without_connector_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = ModeController::new(legacy(&dir), None);
        assert_matches!(
            controller.transition(StorageMode::Dual).await,
            Err(StorageError::ModeTransitionRejected { from: StorageMode::Legacy, to: StorageMode::Dual, reason })
                if reason.contains("not set")
        );
        assert_eq!(controller.mode(), StorageMode::Legacy);
        assert_eq!(
            controller.transition(StorageMode::Legacy).await.unwrap(),
            StorageMode::Legacy
        );
    }
}
