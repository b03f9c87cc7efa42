//! Consistency Auditor: periodic comparison of the two backends in dual mode.
//!
//! Each run compares per-session event counts (and, when enabled, content
//! checksums) between the legacy and central stores. Replication is
//! asynchronous, so a count may lag by up to `count_tolerance` events, and a
//! mismatch must persist for `confirmations` consecutive runs before it
//! alerts. Alerts are log events and counters only; traffic is never halted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use hll_core::{SessionId, SessionIdRange, StorageMode};
use hll_settings::AuditSettings;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{StorageBackend, session_checksum};
use crate::coordinator::{DivergenceLog, DivergenceRecord, DualWriteCoordinator};
use crate::errors::{BackendKind, Result, StorageError};
use crate::metrics::{AUDIT_MISMATCHES_TOTAL, AUDIT_RUNS_TOTAL};
use crate::mode::ModeController;

/// Auditor tunables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditConfig {
    /// Time between runs.
    pub interval: Duration,
    /// Allowed absolute difference in event counts.
    pub count_tolerance: u64,
    /// Consecutive runs a mismatch must persist before it alerts.
    pub confirmations: u32,
    /// Compare content checksums when counts agree.
    pub checksums: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self::from(&AuditSettings::default())
    }
}

impl From<&AuditSettings> for AuditConfig {
    fn from(settings: &AuditSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            count_tolerance: settings.count_tolerance,
            confirmations: settings.confirmations.max(1),
            checksums: settings.checksums,
        }
    }
}

/// How a session differs between backends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mismatch {
    /// Event counts differ by more than the tolerance.
    Count {
        /// Events in the legacy store.
        legacy: u64,
        /// Events in the central store.
        central: u64,
    },
    /// Counts agree, content does not.
    Checksum {
        /// Legacy checksum.
        legacy: String,
        /// Central checksum.
        central: String,
    },
    /// The session exists in only one backend.
    Missing {
        /// Backend lacking the session.
        backend: BackendKind,
    },
}

impl Mismatch {
    /// Metric label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Count { .. } => "count",
            Self::Checksum { .. } => "checksum",
            Self::Missing { .. } => "missing",
        }
    }
}

/// A session whose backends disagree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMismatch {
    /// Affected session.
    pub session_id: SessionId,
    /// What differs.
    pub mismatch: Mismatch,
    /// Consecutive runs this session has mismatched, this one included.
    pub streak: u32,
}

/// Outcome of one audit run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    /// The run did nothing because the mode was not dual.
    pub skipped: bool,
    /// Sessions compared.
    pub sessions_checked: usize,
    /// Mismatches not yet confirmed.
    pub suspects: Vec<SessionMismatch>,
    /// Confirmed mismatches that alerted.
    pub alerts: Vec<SessionMismatch>,
    /// Divergence records collected since the previous run.
    pub divergences: Vec<DivergenceRecord>,
}

impl AuditReport {
    /// Whether nothing disagreed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.suspects.is_empty() && self.alerts.is_empty() && self.divergences.is_empty()
    }
}

/// Compares the backends while in dual mode.
pub struct ConsistencyAuditor {
    controller: Arc<ModeController>,
    divergences: Arc<DivergenceLog>,
    config: AuditConfig,
    streaks: Mutex<HashMap<SessionId, u32>>,
}

impl ConsistencyAuditor {
    /// Auditor over `controller`, draining `divergences` on every run.
    #[must_use]
    pub fn new(
        controller: Arc<ModeController>,
        divergences: Arc<DivergenceLog>,
        config: AuditConfig,
    ) -> Self {
        Self {
            controller,
            divergences,
            config,
            streaks: Mutex::new(HashMap::new()),
        }
    }

    /// Auditor sharing the coordinator's controller and divergence log.
    #[must_use]
    pub fn for_coordinator(coordinator: &DualWriteCoordinator, config: AuditConfig) -> Self {
        Self::new(
            Arc::clone(coordinator.controller()),
            Arc::clone(coordinator.divergences()),
            config,
        )
    }

    /// Run one comparison.
    pub async fn audit_once(&self) -> Result<AuditReport> {
        let state = self.controller.snapshot();
        let (StorageMode::Dual, Some(central)) = (state.mode(), state.secondary()) else {
            self.streaks.lock().clear();
            return Ok(AuditReport {
                skipped: true,
                ..AuditReport::default()
            });
        };
        let legacy = state.primary();

        let divergences = self.divergences.drain();
        if !divergences.is_empty() {
            info!(count = divergences.len(), "divergences since last audit");
        }

        let legacy_ids: Vec<SessionId> = legacy
            .list_sessions(SessionIdRange::all())
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let central_ids: HashSet<SessionId> = central
            .list_sessions(SessionIdRange::all())
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();

        let mut found = Vec::new();
        let mut checked = 0;
        for id in &legacy_ids {
            checked += 1;
            if !central_ids.contains(id) {
                found.push((
                    *id,
                    Mismatch::Missing {
                        backend: BackendKind::Central,
                    },
                ));
                continue;
            }
            match self.compare(legacy, central, *id).await {
                Ok(Some(mismatch)) => found.push((*id, mismatch)),
                Ok(None) => {}
                // deleted between listing and comparing
                Err(StorageError::UnknownSession(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let legacy_set: HashSet<SessionId> = legacy_ids.into_iter().collect();
        for id in central_ids.difference(&legacy_set) {
            checked += 1;
            found.push((
                *id,
                Mismatch::Missing {
                    backend: BackendKind::Legacy,
                },
            ));
        }

        let report = self.confirm(found, checked, divergences);
        metrics::counter!(AUDIT_RUNS_TOTAL).increment(1);
        debug!(
            checked = report.sessions_checked,
            suspects = report.suspects.len(),
            alerts = report.alerts.len(),
            "audit run complete"
        );
        Ok(report)
    }

    /// Audit every `interval` until `cancel` fires. Failed runs are logged.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.audit_once().await {
                        warn!(error = %e, "audit run failed");
                    }
                }
            }
        }
        info!("auditor stopped");
    }

    async fn compare(
        &self,
        legacy: &Arc<dyn StorageBackend>,
        central: &Arc<dyn StorageBackend>,
        id: SessionId,
    ) -> Result<Option<Mismatch>> {
        let l = legacy.session_stats(id).await?;
        let c = central.session_stats(id).await?;
        if l.event_count.abs_diff(c.event_count) > self.config.count_tolerance {
            return Ok(Some(Mismatch::Count {
                legacy: l.event_count,
                central: c.event_count,
            }));
        }
        if self.config.checksums && l.event_count == c.event_count {
            let (_, legacy_sum) = session_checksum(Arc::clone(legacy), id).await?;
            let (_, central_sum) = session_checksum(Arc::clone(central), id).await?;
            if legacy_sum != central_sum {
                return Ok(Some(Mismatch::Checksum {
                    legacy: legacy_sum,
                    central: central_sum,
                }));
            }
        }
        Ok(None)
    }

    fn confirm(
        &self,
        found: Vec<(SessionId, Mismatch)>,
        checked: usize,
        divergences: Vec<DivergenceRecord>,
    ) -> AuditReport {
        let mut streaks = self.streaks.lock();
        let mut next = HashMap::with_capacity(found.len());
        let mut report = AuditReport {
            skipped: false,
            sessions_checked: checked,
            divergences,
            ..AuditReport::default()
        };

        for (session_id, mismatch) in found {
            let streak = streaks.get(&session_id).copied().unwrap_or(0) + 1;
            let _ = next.insert(session_id, streak);
            let entry = SessionMismatch {
                session_id,
                mismatch,
                streak,
            };
            if streak >= self.config.confirmations {
                error!(
                    session_id = %session_id,
                    kind = entry.mismatch.label(),
                    streak,
                    "backends inconsistent"
                );
                metrics::counter!(AUDIT_MISMATCHES_TOTAL, "kind" => entry.mismatch.label())
                    .increment(1);
                report.alerts.push(entry);
            } else {
                debug!(session_id = %session_id, kind = entry.mismatch.label(), streak, "audit mismatch pending confirmation");
                report.suspects.push(entry);
            }
        }
        *streaks = next;
        report
    }
}
