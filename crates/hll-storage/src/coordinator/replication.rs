//! Per-session replication lanes for dual mode.
//!
//! Each session with secondary traffic gets a lane: a gate the coordinator
//! holds across "primary write, then enqueue", and an unbounded channel
//! drained in order by one background task. Secondary writes therefore
//! apply in primary order without the caller waiting for them.
//!
//! Transient secondary failures are retried on the lane with backoff before
//! they count as divergence. A lane nobody has used for `lane_idle_ms` is
//! released by its own worker.

use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hll_core::{LogEvent, RetryConfig, SessionId, SessionMeta};
use hll_settings::ReplicationSettings;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, warn};

use super::divergence::{DivergenceLog, DivergenceRecord, OperationKind};
use crate::backend::StorageBackend;
use crate::errors::{Result, StorageError};
use crate::metrics::{STORAGE_REPLICATION_BACKLOG, STORAGE_REPLICATION_RETRIES_TOTAL};

/// A mutation to replay on the secondary backend.
#[derive(Clone, Debug)]
pub enum SecondaryOp {
    /// Create the session.
    Create(SessionMeta),
    /// Append a batch.
    Append(Arc<[LogEvent]>),
    /// Close at the given end time.
    Close(DateTime<Utc>),
    /// Soft delete at the given time.
    MarkDeleted(DateTime<Utc>),
    /// Hard delete.
    Delete,
}

impl SecondaryOp {
    /// Operation kind for divergence records.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Create(_) => OperationKind::CreateSession,
            Self::Append(_) => OperationKind::AppendEvents,
            Self::Close(_) => OperationKind::CloseSession,
            Self::MarkDeleted(_) => OperationKind::MarkSessionDeleted,
            Self::Delete => OperationKind::DeleteSession,
        }
    }

    async fn apply(&self, target: &dyn StorageBackend, session_id: SessionId) -> Result<()> {
        match self {
            Self::Create(meta) => target.create_session(meta).await.map(|_| ()),
            Self::Append(events) => target.append_events(session_id, events).await,
            Self::Close(end) => target.close_session(session_id, *end).await,
            Self::MarkDeleted(at) => target.mark_session_deleted(session_id, *at).await,
            Self::Delete => target.delete_session(session_id).await,
        }
    }

    /// After a retry, whether `err` only says an earlier attempt already
    /// committed (the failure was reported after the write went through).
    async fn landed_earlier(
        &self,
        err: &StorageError,
        target: &dyn StorageBackend,
        session_id: SessionId,
    ) -> bool {
        match (self, err) {
            (Self::Create(_), StorageError::AlreadyExists(_)) => true,
            (Self::Append(events), StorageError::Conflict { .. }) => {
                let Some(last) = events.last() else {
                    return false;
                };
                target
                    .session_stats(session_id)
                    .await
                    .is_ok_and(|stats| stats.last_seq >= Some(last.log_seq))
            }
            _ => false,
        }
    }
}

struct Job {
    target: Arc<dyn StorageBackend>,
    session_id: SessionId,
    op: SecondaryOp,
}

/// Per-session ordering lane.
pub struct Lane {
    gate: Mutex<()>,
    tx: mpsc::UnboundedSender<Job>,
}

impl Lane {
    /// Serializes primary writes (and their enqueue) for one session.
    pub fn gate(&self) -> &Mutex<()> {
        &self.gate
    }
}

#[derive(Default)]
struct Backlog {
    pending: AtomicUsize,
    idle: Notify,
}

impl Backlog {
    #[allow(clippy::cast_precision_loss)]
    fn finish_one(&self) {
        let left = self.pending.fetch_sub(1, Ordering::AcqRel) - 1;
        metrics::gauge!(STORAGE_REPLICATION_BACKLOG).set(left as f64);
        if left == 0 {
            self.idle.notify_waiters();
        }
    }
}

type Lanes = DashMap<SessionId, Arc<Lane>>;

/// What every lane worker shares.
struct Worker {
    lanes: Lanes,
    backlog: Arc<Backlog>,
    divergences: Arc<DivergenceLog>,
    retry: RetryConfig,
    idle_after: Duration,
}

/// Owns the lanes and the background workers draining them.
pub struct Replicator {
    worker: Arc<Worker>,
    backlog_warn_threshold: usize,
}

impl Replicator {
    /// Replicator recording failures into `divergences`.
    #[must_use]
    pub fn new(divergences: Arc<DivergenceLog>, settings: &ReplicationSettings) -> Self {
        let retry = RetryConfig {
            max_retries: settings.max_retries,
            base_delay_ms: settings.base_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            ..RetryConfig::default()
        };
        Self {
            worker: Arc::new(Worker {
                lanes: DashMap::new(),
                backlog: Arc::new(Backlog::default()),
                divergences,
                retry,
                idle_after: Duration::from_millis(settings.lane_idle_ms),
            }),
            backlog_warn_threshold: settings.backlog_warn_threshold,
        }
    }

    /// Lane for `session_id`, spawning its worker on first use.
    pub fn lane(&self, session_id: SessionId) -> Arc<Lane> {
        let entry = self.worker.lanes.entry(session_id).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let lane = Arc::new(Lane {
                gate: Mutex::new(()),
                tx,
            });
            let _ = tokio::spawn(run_lane(
                session_id,
                Arc::downgrade(&lane),
                rx,
                Arc::clone(&self.worker),
            ));
            lane
        });
        Arc::clone(entry.value())
    }

    /// Forget the lane; its worker exits once queued jobs are done.
    pub fn close_lane(&self, session_id: SessionId) {
        let _ = self.worker.lanes.remove(&session_id);
    }

    /// Queue `op` for `target` on `lane`. Call while holding the lane gate.
    #[allow(clippy::cast_precision_loss)]
    pub fn enqueue(
        &self,
        lane: &Lane,
        target: Arc<dyn StorageBackend>,
        session_id: SessionId,
        op: SecondaryOp,
    ) {
        let pending = self.worker.backlog.pending.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::gauge!(STORAGE_REPLICATION_BACKLOG).set(pending as f64);
        if pending == self.backlog_warn_threshold + 1 {
            warn!(
                pending,
                threshold = self.backlog_warn_threshold,
                "replication backlog above threshold"
            );
        }

        let job = Job {
            target,
            session_id,
            op,
        };
        if let Err(mpsc::error::SendError(job)) = lane.tx.send(job) {
            self.worker.divergences.record(DivergenceRecord {
                session_id,
                operation: job.op.kind(),
                backend: job.target.kind(),
                error: "replication lane closed".into(),
                observed_at: Utc::now(),
            });
            self.worker.backlog.finish_one();
        }
    }

    /// Forget every lane, e.g. after leaving dual mode.
    pub fn close_all_lanes(&self) {
        self.worker.lanes.clear();
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.worker.backlog.pending.load(Ordering::Acquire)
    }

    /// Number of open lanes.
    pub fn lane_count(&self) -> usize {
        self.worker.lanes.len()
    }

    /// Wait until every queued job has finished. Returns `false` on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.worker.backlog.idle.notified();
            if self.pending() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return self.pending() == 0;
            }
        }
    }
}

async fn run_lane(
    session_id: SessionId,
    me: Weak<Lane>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    worker: Arc<Worker>,
) {
    loop {
        let job = match tokio::time::timeout(worker.idle_after, rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => {
                // only our own lane, and only if no writer holds it
                let released = worker
                    .lanes
                    .remove_if(&session_id, |_, lane| {
                        std::ptr::eq(Arc::as_ptr(lane), me.as_ptr())
                            && Arc::strong_count(lane) == 1
                            && rx.is_empty()
                    })
                    .is_some();
                if released {
                    debug!(session_id = %session_id, "idle replication lane released");
                    break;
                }
                continue;
            }
        };

        match replicate(&job, &worker.retry).await {
            Ok(()) => debug!(
                session_id = %job.session_id,
                operation = job.op.kind().as_str(),
                "secondary write applied"
            ),
            Err(e) => worker.divergences.record(DivergenceRecord {
                session_id: job.session_id,
                operation: job.op.kind(),
                backend: job.target.kind(),
                error: e.to_string(),
                observed_at: Utc::now(),
            }),
        }
        worker.backlog.finish_one();
    }
}

async fn replicate(job: &Job, retry: &RetryConfig) -> Result<()> {
    let target = job.target.as_ref();
    let mut attempt = 0;
    loop {
        let err = match job.op.apply(target, job.session_id).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if attempt > 0 && job.op.landed_earlier(&err, target, job.session_id).await {
            return Ok(());
        }
        if !(err.is_retryable() && retry.allows(attempt)) {
            return Err(err);
        }

        let delay = retry.delay(attempt, rand::random::<f64>());
        attempt += 1;
        warn!(
            session_id = %job.session_id,
            operation = job.op.kind().as_str(),
            backend = target.kind().as_str(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "secondary write failed, retrying"
        );
        metrics::counter!(
            STORAGE_REPLICATION_RETRIES_TOTAL,
            "operation" => job.op.kind().as_str(),
            "backend" => target.kind().as_str()
        )
        .increment(1);
        tokio::time::sleep(delay).await;
    }
}
