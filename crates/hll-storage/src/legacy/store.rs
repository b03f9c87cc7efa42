//! [`LegacyStore`]: the per-session-table SQLite backend.
//!
//! Every call checks a connection out of the `r2d2` pool inside
//! [`tokio::task::spawn_blocking`], so disk I/O never stalls the runtime.
//! Writes open an `IMMEDIATE` transaction, which serializes writers on the
//! database file and keeps each operation all-or-nothing.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hll_core::{EventRange, LogEvent, SessionId, SessionIdRange, SessionMeta, SessionRecord};
use hll_settings::LegacySettings;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info, instrument};

use super::connection::{self, ConnectionConfig, ConnectionPool};
use super::migrations::run_migrations;
use super::repositories::{LogRepo, SessionRepo, StoredSession};
use crate::backend::{
    EventCursor, SessionHandle, SessionStats, StorageBackend, check_close, validate_batch,
};
use crate::errors::{BackendKind, Result, StorageError};

/// SQLite-backed legacy store.
#[derive(Clone)]
pub struct LegacyStore {
    pool: ConnectionPool,
    read_page_size: usize,
}

impl LegacyStore {
    /// Open the store described by `settings`, applying pending migrations.
    pub fn open(settings: &LegacySettings) -> Result<Self> {
        let store = Self::open_path(Path::new(&settings.path), &settings.into())?;
        Ok(store.with_read_page_size(settings.read_page_size as usize))
    }

    /// Open a store file with explicit pool settings.
    pub fn open_path(path: &Path, config: &ConnectionConfig) -> Result<Self> {
        let pool = connection::new_file(path, config)?;
        let applied = {
            let mut conn = pool.get()?;
            run_migrations(&mut conn)?
        };
        info!(path = %path.display(), applied, "legacy store opened");
        Ok(Self {
            pool,
            read_page_size: 500,
        })
    }

    /// Override the page size used by streamed reads.
    #[must_use]
    pub fn with_read_page_size(mut self, size: usize) -> Self {
        self.read_page_size = size.max(1);
        self
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| StorageError::unavailable(BackendKind::Legacy, format!("blocking task failed: {e}")))?
    }
}

fn write_tx(conn: &Connection) -> Result<Transaction<'_>> {
    Ok(Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?)
}

fn require(conn: &Connection, id: SessionId) -> Result<StoredSession> {
    SessionRepo::get(conn, id)?.ok_or(StorageError::UnknownSession(id))
}

#[async_trait]
impl StorageBackend for LegacyStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Legacy
    }

    async fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            let _: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            Ok(())
        })
        .await
    }

    #[instrument(skip_all, fields(session_id = %meta.id))]
    async fn create_session(&self, meta: &SessionMeta) -> Result<SessionHandle> {
        let record = SessionRecord::from_meta(meta);
        let handle = SessionHandle {
            id: meta.id,
            start_time: meta.start_time,
        };
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            if SessionRepo::is_retired(&tx, record.id)? || SessionRepo::get(&tx, record.id)?.is_some() {
                return Err(StorageError::AlreadyExists(record.id));
            }
            SessionRepo::insert(&tx, &record)?;
            LogRepo::create_table(&tx, record.id)?;
            tx.commit()?;
            debug!("session table created");
            Ok(handle)
        })
        .await
    }

    async fn append_events(&self, session_id: SessionId, batch: &[LogEvent]) -> Result<()> {
        let Some(last) = batch.last().map(|e| e.log_seq) else {
            return Ok(());
        };
        let batch = batch.to_vec();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let stored = require(&tx, session_id)?;
            validate_batch(session_id, stored.last_log_seq, &batch)?;
            LogRepo::insert_batch(&tx, session_id, &batch)?;
            SessionRepo::set_last_seq(&tx, session_id, last)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    fn read_page_size(&self) -> usize {
        self.read_page_size
    }

    async fn read_page(
        &self,
        session_id: SessionId,
        range: &EventRange,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<LogEvent>> {
        let range = range.clone();
        self.with_conn(move |conn| {
            let _ = require(conn, session_id)?;
            LogRepo::page(conn, session_id, &range, after, limit)
        })
        .await
    }

    async fn read_after_sequence(
        &self,
        session_id: SessionId,
        after_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogEvent>> {
        self.with_conn(move |conn| {
            let _ = require(conn, session_id)?;
            LogRepo::after_sequence(conn, session_id, after_seq, limit)
        })
        .await
    }

    async fn close_session(&self, session_id: SessionId, end_time: DateTime<Utc>) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let stored = require(&tx, session_id)?;
            if check_close(session_id, stored.record.closed, stored.record.end_time, end_time)? {
                SessionRepo::set_closed(&tx, session_id, end_time)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn mark_session_deleted(&self, session_id: SessionId, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(move |conn| {
            if SessionRepo::mark_deleted(conn, session_id, at)? {
                Ok(())
            } else {
                Err(StorageError::UnknownSession(session_id))
            }
        })
        .await
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn delete_session(&self, session_id: SessionId) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            LogRepo::drop_table(&tx, session_id)?;
            let existed = SessionRepo::delete(&tx, session_id)?;
            SessionRepo::retire(&tx, session_id, Utc::now())?;
            tx.commit()?;
            debug!(existed, "session deleted");
            Ok(())
        })
        .await
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>> {
        self.with_conn(move |conn| Ok(SessionRepo::get(conn, session_id)?.map(|s| s.record)))
            .await
    }

    async fn list_sessions(&self, range: SessionIdRange) -> Result<Vec<SessionRecord>> {
        self.with_conn(move |conn| {
            Ok(SessionRepo::list(conn, range)?
                .into_iter()
                .map(|s| s.record)
                .collect())
        })
        .await
    }

    async fn import_session(&self, record: &SessionRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            if SessionRepo::is_retired(&tx, record.id)? {
                return Err(StorageError::AlreadyExists(record.id));
            }
            SessionRepo::upsert(&tx, &record)?;
            LogRepo::create_table(&tx, record.id)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn session_stats(&self, session_id: SessionId) -> Result<SessionStats> {
        self.with_conn(move |conn| {
            let _ = require(conn, session_id)?;
            LogRepo::stats(conn, session_id)
        })
        .await
    }

    async fn purge_expired_sessions(&self, before: DateTime<Utc>) -> Result<Vec<SessionId>> {
        self.with_conn(move |conn| {
            let tx = write_tx(conn)?;
            let ids = SessionRepo::expired_ids(&tx, before)?;
            let now = Utc::now();
            for id in &ids {
                LogRepo::drop_table(&tx, *id)?;
                let _ = SessionRepo::delete(&tx, *id)?;
                SessionRepo::retire(&tx, *id, now)?;
            }
            tx.commit()?;
            if !ids.is_empty() {
                info!(purged = ids.len(), "purged expired legacy sessions");
            }
            Ok(ids)
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
