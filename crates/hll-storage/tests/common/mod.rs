//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hll_core::{
    EventRange, EventType, GuildId, LogEvent, LogPayload, PlayerRef, SessionId, SessionIdRange,
    SessionMeta, SessionRecord,
};
use hll_storage::backend::{EventCursor, SessionHandle, SessionStats, StorageBackend};
use hll_storage::legacy::ConnectionConfig;
use hll_storage::{BackendKind, CentralConnector, LegacyStore, Result, StorageError};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap()
}

pub fn meta(id: i64) -> SessionMeta {
    SessionMeta {
        id: SessionId::new(id),
        guild_id: GuildId::new(900),
        name: format!("session {id}"),
        start_time: t0(),
        end_time: None,
        is_auto: false,
        modifier_flags: 0,
        credentials: None,
    }
}

pub fn event(seq: i64) -> LogEvent {
    LogEvent::new(
        t0() + Duration::seconds(seq),
        seq,
        EventType::Kill,
        LogPayload {
            player: Some(PlayerRef {
                name: format!("player{seq}"),
                id: format!("7656{seq}"),
                ..PlayerRef::default()
            }),
            weapon: Some("M1 GARAND".into()),
            ..LogPayload::default()
        },
    )
}

pub fn events(seqs: std::ops::RangeInclusive<i64>) -> Vec<LogEvent> {
    seqs.map(event).collect()
}

pub fn legacy_store(dir: &Path, name: &str) -> LegacyStore {
    LegacyStore::open_path(&dir.join(name), &ConnectionConfig::default()).unwrap()
}

/// Wraps a real backend with fault injection.
pub struct TestBackend {
    inner: Arc<dyn StorageBackend>,
    kind: BackendKind,
    unreachable: AtomicBool,
    schema_missing: AtomicBool,
    ping_delay_ms: AtomicU64,
    slow_appends: Mutex<Option<(usize, StdDuration)>>,
    fail_appends: AtomicUsize,
    fail_appends_after_commit: AtomicUsize,
    appends: AtomicUsize,
    cancel_after_appends: Mutex<Option<(usize, CancellationToken)>>,
}

impl TestBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, kind: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            inner,
            kind,
            unreachable: AtomicBool::new(false),
            schema_missing: AtomicBool::new(false),
            ping_delay_ms: AtomicU64::new(0),
            slow_appends: Mutex::new(None),
            fail_appends: AtomicUsize::new(0),
            fail_appends_after_commit: AtomicUsize::new(0),
            appends: AtomicUsize::new(0),
            cancel_after_appends: Mutex::new(None),
        })
    }

    /// A SQLite file posing as the central store.
    pub fn central(dir: &Path) -> Arc<Self> {
        Self::new(Arc::new(legacy_store(dir, "central.db")), BackendKind::Central)
    }

    pub fn set_unreachable(&self, down: bool) {
        self.unreachable.store(down, Ordering::SeqCst);
    }

    /// Answer like a reachable database that was never migrated.
    pub fn set_schema_missing(&self, missing: bool) {
        self.schema_missing.store(missing, Ordering::SeqCst);
    }

    /// Delay every ping by `ms`.
    pub fn delay_pings(&self, ms: u64) {
        self.ping_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Delay the next `n` appends by `delay` before they write.
    pub fn delay_next_appends(&self, n: usize, delay: StdDuration) {
        *self.slow_appends.lock() = Some((n, delay));
    }

    /// Fail the next `n` appends without writing.
    pub fn fail_next_appends(&self, n: usize) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// Commit the next `n` appends, then report them as failed.
    pub fn fail_next_appends_after_commit(&self, n: usize) {
        self.fail_appends_after_commit.store(n, Ordering::SeqCst);
    }

    /// Cancel `token` once `n` appends have committed.
    pub fn cancel_after_appends(&self, n: usize, token: CancellationToken) {
        *self.cancel_after_appends.lock() = Some((n, token));
    }

    pub fn append_calls(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(self.kind, "connection refused"));
        }
        if self.schema_missing.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(
                self.kind,
                r#"relation "sessions" does not exist"#,
            ));
        }
        Ok(())
    }

    fn take_append_delay(&self) -> Option<StdDuration> {
        let mut slow = self.slow_appends.lock();
        let (left, delay) = slow.as_mut()?;
        let delay = *delay;
        *left -= 1;
        if *left == 0 {
            *slow = None;
        }
        Some(delay)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl StorageBackend for TestBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn ping(&self) -> Result<()> {
        let delay = self.ping_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(StdDuration::from_millis(delay)).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(self.kind, "connection refused"));
        }
        self.inner.ping().await
    }

    async fn schema_ready(&self) -> Result<bool> {
        Ok(!self.schema_missing.load(Ordering::SeqCst))
    }

    async fn create_session(&self, meta: &SessionMeta) -> Result<SessionHandle> {
        self.check()?;
        self.inner.create_session(meta).await
    }

    async fn append_events(&self, session_id: SessionId, batch: &[LogEvent]) -> Result<()> {
        if let Some(delay) = self.take_append_delay() {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        if take_one(&self.fail_appends) {
            return Err(StorageError::unavailable(self.kind, "statement timeout"));
        }
        self.inner.append_events(session_id, batch).await?;
        let done = self.appends.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((n, token)) = self.cancel_after_appends.lock().as_ref() {
            if done >= *n {
                token.cancel();
            }
        }
        if take_one(&self.fail_appends_after_commit) {
            return Err(StorageError::unavailable(self.kind, "connection reset after commit"));
        }
        Ok(())
    }

    fn read_page_size(&self) -> usize {
        self.inner.read_page_size()
    }

    async fn read_page(
        &self,
        session_id: SessionId,
        range: &EventRange,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<LogEvent>> {
        self.check()?;
        self.inner.read_page(session_id, range, after, limit).await
    }

    async fn read_after_sequence(
        &self,
        session_id: SessionId,
        after_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogEvent>> {
        self.check()?;
        self.inner.read_after_sequence(session_id, after_seq, limit).await
    }

    async fn close_session(&self, session_id: SessionId, end_time: DateTime<Utc>) -> Result<()> {
        self.check()?;
        self.inner.close_session(session_id, end_time).await
    }

    async fn mark_session_deleted(&self, session_id: SessionId, at: DateTime<Utc>) -> Result<()> {
        self.check()?;
        self.inner.mark_session_deleted(session_id, at).await
    }

    async fn delete_session(&self, session_id: SessionId) -> Result<()> {
        self.check()?;
        self.inner.delete_session(session_id).await
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>> {
        self.check()?;
        self.inner.get_session(session_id).await
    }

    async fn list_sessions(&self, range: SessionIdRange) -> Result<Vec<SessionRecord>> {
        self.check()?;
        self.inner.list_sessions(range).await
    }

    async fn import_session(&self, record: &SessionRecord) -> Result<()> {
        self.check()?;
        self.inner.import_session(record).await
    }

    async fn session_stats(&self, session_id: SessionId) -> Result<SessionStats> {
        self.check()?;
        self.inner.session_stats(session_id).await
    }

    async fn purge_expired_sessions(&self, before: DateTime<Utc>) -> Result<Vec<SessionId>> {
        self.check()?;
        self.inner.purge_expired_sessions(before).await
    }
}

/// Connector handing out a fixed backend, or failing when there is none.
pub struct StaticConnector {
    backend: Option<Arc<dyn StorageBackend>>,
}

impl StaticConnector {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend: Some(backend),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { backend: None })
    }
}

#[async_trait]
impl CentralConnector for StaticConnector {
    async fn connect(&self) -> Result<Arc<dyn StorageBackend>> {
        self.backend
            .clone()
            .ok_or_else(|| StorageError::unavailable(BackendKind::Central, "no route to host"))
    }
}
