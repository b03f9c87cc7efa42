//! Dual-Write Coordinator: the storage surface callers use.
//!
//! Every call takes a [`BackendState`](crate::mode::BackendState) snapshot
//! from the [`ModeController`] and runs against it:
//!
//! - the primary (source of truth) is written first, and its error is the
//!   caller's error;
//! - in dual mode a successful primary write is queued on the session's
//!   replication lane for the secondary, and the caller returns without
//!   waiting; a failing secondary write becomes a [`DivergenceRecord`];
//! - reads always come from the primary.
//!
//! Mode changes go through [`DualWriteCoordinator::transition`]. It waits
//! for writes already in flight, drains the backlog when leaving dual mode,
//! and holds new writes back until the new state is in place.

pub mod divergence;
pub mod replication;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use hll_core::{EventRange, LogEvent, SessionId, SessionIdRange, SessionMeta, SessionRecord, StorageMode};
use hll_settings::ReplicationSettings;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

pub use divergence::{DivergenceLog, DivergenceRecord, OperationKind};
pub use replication::{Replicator, SecondaryOp};

use crate::backend::{SessionHandle, StorageBackend, read_events};
use crate::errors::{Result, StorageError};
use crate::metrics::observe;
use crate::mode::{ModeController, ModeSources};

/// Fans mutations out to the active backend(s).
pub struct DualWriteCoordinator {
    controller: Arc<ModeController>,
    replicator: Replicator,
    divergences: Arc<DivergenceLog>,
    drain_timeout: Duration,
    /// Writes hold it shared from snapshot to enqueue; transitions take it
    /// exclusively.
    barrier: RwLock<()>,
}

impl DualWriteCoordinator {
    /// Coordinator over `controller`.
    #[must_use]
    pub fn new(controller: Arc<ModeController>, settings: &ReplicationSettings) -> Self {
        let divergences = Arc::new(DivergenceLog::default());
        Self {
            controller,
            replicator: Replicator::new(Arc::clone(&divergences), settings),
            divergences,
            drain_timeout: Duration::from_millis(settings.drain_timeout_ms),
            barrier: RwLock::new(()),
        }
    }

    /// Mode controller in use.
    pub fn controller(&self) -> &Arc<ModeController> {
        &self.controller
    }

    /// Divergence log shared with the auditor.
    pub fn divergences(&self) -> &Arc<DivergenceLog> {
        &self.divergences
    }

    /// Current mode.
    pub fn mode(&self) -> StorageMode {
        self.controller.mode()
    }

    /// Secondary writes queued or running.
    pub fn replication_backlog(&self) -> usize {
        self.replicator.pending()
    }

    /// Replication lanes currently open.
    pub fn replication_lanes(&self) -> usize {
        self.replicator.lane_count()
    }

    /// Wait for queued secondary writes, bounded by the configured drain
    /// timeout. Returns `false` if the backlog did not empty in time.
    pub async fn drain(&self) -> bool {
        let drained = self.replicator.drain(self.drain_timeout).await;
        if !drained {
            warn!(
                pending = self.replicator.pending(),
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "replication backlog did not drain"
            );
        }
        drained
    }

    /// Operator entry point for mode changes. Leaving dual mode first waits
    /// for the replication backlog; if it does not drain the change is
    /// rejected. Writes arriving meanwhile wait and then run against the
    /// resulting mode.
    pub async fn transition(&self, target: StorageMode) -> Result<StorageMode> {
        let _barrier = self.barrier.write().await;
        let from = self.controller.mode();
        if from == StorageMode::Dual && target != StorageMode::Dual && !self.drain().await {
            return Err(StorageError::ModeTransitionRejected {
                from,
                to: target,
                reason: "replication backlog did not drain".into(),
            });
        }
        let mode = self.controller.transition(target).await?;
        if from == StorageMode::Dual && mode != StorageMode::Dual {
            self.replicator.close_all_lanes();
        }
        Ok(mode)
    }

    /// Re-resolve the mode after a configuration reload. A rejected change
    /// keeps the current mode and is logged.
    pub async fn reload(&self, sources: &ModeSources) -> Result<StorageMode> {
        let target = sources.resolve();
        let result = self.transition(target).await;
        if let Err(e) = &result {
            warn!(current = %self.mode(), requested = %target, error = %e, "mode reload rejected");
        }
        result
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Allocate storage for a new session.
    #[instrument(skip_all, fields(session_id = %meta.id))]
    pub async fn create_session(&self, meta: &SessionMeta) -> Result<SessionHandle> {
        self.write(
            OperationKind::CreateSession,
            meta.id,
            || SecondaryOp::Create(meta.clone()),
            |backend| async move { backend.create_session(meta).await },
        )
        .await
    }

    /// Append a batch atomically on the primary.
    pub async fn append_events(&self, session_id: SessionId, batch: Vec<LogEvent>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let events: Arc<[LogEvent]> = batch.into();
        let primary_events = Arc::clone(&events);
        self.write(
            OperationKind::AppendEvents,
            session_id,
            move || SecondaryOp::Append(events),
            move |backend| async move { backend.append_events(session_id, &primary_events).await },
        )
        .await
    }

    /// Mark the session closed.
    pub async fn close_session(&self, session_id: SessionId, end_time: DateTime<Utc>) -> Result<()> {
        self.write(
            OperationKind::CloseSession,
            session_id,
            move || SecondaryOp::Close(end_time),
            move |backend| async move { backend.close_session(session_id, end_time).await },
        )
        .await
    }

    /// Soft-delete the session.
    pub async fn mark_session_deleted(&self, session_id: SessionId, at: DateTime<Utc>) -> Result<()> {
        self.write(
            OperationKind::MarkSessionDeleted,
            session_id,
            move || SecondaryOp::MarkDeleted(at),
            move |backend| async move { backend.mark_session_deleted(session_id, at).await },
        )
        .await
    }

    /// Remove the session and all of its events.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn delete_session(&self, session_id: SessionId) -> Result<()> {
        let result = self
            .write(
                OperationKind::DeleteSession,
                session_id,
                || SecondaryOp::Delete,
                move |backend| async move { backend.delete_session(session_id).await },
            )
            .await;
        self.replicator.close_lane(session_id);
        result
    }

    /// Purge expired soft-deleted sessions on the primary and replicate a
    /// delete for each purged id.
    pub async fn purge_expired(&self, before: DateTime<Utc>) -> Result<Vec<SessionId>> {
        let _barrier = self.barrier.read().await;
        let state = self.controller.snapshot();
        let primary = state.primary();
        let started = Instant::now();
        let result = primary.purge_expired_sessions(before).await;
        observe("purge_expired_sessions", primary.kind(), started, &result);
        let purged = result?;

        if let Some(secondary) = state.secondary() {
            for id in &purged {
                let lane = self.replicator.lane(*id);
                {
                    let _gate = lane.gate().lock().await;
                    self.replicator
                        .enqueue(&lane, Arc::clone(secondary), *id, SecondaryOp::Delete);
                }
                self.replicator.close_lane(*id);
            }
        }
        if !purged.is_empty() {
            info!(purged = purged.len(), mode = %state.mode(), "purged expired sessions");
        }
        Ok(purged)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Lazily stream a session's events from the source of truth.
    pub fn read_events(
        &self,
        session_id: SessionId,
        range: EventRange,
    ) -> BoxStream<'static, Result<LogEvent>> {
        let state = self.controller.snapshot();
        read_events(Arc::clone(state.primary()), session_id, range)
    }

    /// Stored session record from the source of truth.
    pub async fn get_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>> {
        let state = self.controller.snapshot();
        let started = Instant::now();
        let result = state.primary().get_session(session_id).await;
        observe("get_session", state.primary().kind(), started, &result);
        result
    }

    /// Sessions in `range` from the source of truth.
    pub async fn list_sessions(&self, range: SessionIdRange) -> Result<Vec<SessionRecord>> {
        let state = self.controller.snapshot();
        let started = Instant::now();
        let result = state.primary().list_sessions(range).await;
        observe("list_sessions", state.primary().kind(), started, &result);
        result
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal
    // ─────────────────────────────────────────────────────────────────────────

    async fn write<T, S, F, Fut>(
        &self,
        operation: OperationKind,
        session_id: SessionId,
        secondary_op: S,
        primary_op: F,
    ) -> Result<T>
    where
        S: FnOnce() -> SecondaryOp,
        F: FnOnce(Arc<dyn StorageBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _barrier = self.barrier.read().await;
        let state = self.controller.snapshot();
        let primary = Arc::clone(state.primary());
        let kind = primary.kind();

        let Some(secondary) = state.secondary() else {
            let started = Instant::now();
            let result = primary_op(primary).await;
            observe(operation.as_str(), kind, started, &result);
            return result;
        };

        let lane = self.replicator.lane(session_id);
        let _gate = lane.gate().lock().await;
        let started = Instant::now();
        let result = primary_op(primary).await;
        observe(operation.as_str(), kind, started, &result);
        if result.is_ok() {
            self.replicator
                .enqueue(&lane, Arc::clone(secondary), session_id, secondary_op());
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
