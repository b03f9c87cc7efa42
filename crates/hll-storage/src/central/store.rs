//! [`CentralStore`]: the partitioned Postgres backend.
//!
//! All events live in `session_logs`, range-partitioned by month on
//! `event_time`. Session metadata lives in `sessions`, whose `last_log_seq`
//! column is locked with `FOR UPDATE` by every append, so appends to one
//! session serialize while other sessions proceed independently.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hll_core::{
    CredentialSnapshot, EventRange, EventType, GuildId, LogEvent, LogPayload, SessionId,
    SessionIdRange, SessionMeta, SessionRecord,
};
use hll_settings::CentralSettings;
use sqlx::migrate::Migrator;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::{debug, info, instrument};

use super::partitions::{MonthKey, PartitionManager};
use super::pool;
use crate::backend::{
    EventCursor, SessionHandle, SessionStats, StorageBackend, check_close, validate_batch,
};
use crate::errors::{BackendKind, Result, StorageError};

/// Embedded schema migrations, applied at connect.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const DEFAULT_READ_PAGE_SIZE: usize = 1000;

#[derive(Debug, FromRow)]
struct DbSession {
    id: i64,
    guild_id: i64,
    name: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    closed: bool,
    is_auto: bool,
    modifier_flags: i64,
    credentials: Option<Json<CredentialSnapshot>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<DbSession> for SessionRecord {
    fn from(row: DbSession) -> Self {
        Self {
            id: SessionId::new(row.id),
            guild_id: GuildId::new(row.guild_id),
            name: row.name,
            start_time: row.start_time,
            end_time: row.end_time,
            closed: row.closed,
            is_auto: row.is_auto,
            modifier_flags: row.modifier_flags,
            credentials: row.credentials.map(|c| c.0),
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbEvent {
    event_time: DateTime<Utc>,
    log_seq: i64,
    event_type: String,
    payload: Json<LogPayload>,
}

impl DbEvent {
    fn into_event(self) -> Result<LogEvent> {
        let event_type = self
            .event_type
            .parse::<EventType>()
            .map_err(|e| StorageError::unavailable(BackendKind::Central, e))?;
        Ok(LogEvent {
            event_time: self.event_time,
            log_seq: self.log_seq,
            event_type,
            payload: self.payload.0,
        })
    }
}

const SESSION_COLUMNS: &str = "id, guild_id, name, start_time, end_time, closed, is_auto, \
                               modifier_flags, credentials, deleted_at";

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

async fn is_retired(conn: &mut PgConnection, id: SessionId) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT id FROM retired_sessions WHERE id = $1")
        .bind(id.get())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

async fn retire(conn: &mut PgConnection, ids: &[i64]) -> Result<()> {
    let _ = sqlx::query(
        "INSERT INTO retired_sessions (id)
         SELECT UNNEST($1::bigint[])
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(ids)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Postgres-backed central store.
#[derive(Clone)]
pub struct CentralStore {
    pool: PgPool,
    partitions: Arc<PartitionManager>,
    read_page_size: usize,
}

impl CentralStore {
    /// Connect, migrate (unless disabled) and pre-create partitions.
    pub async fn connect(settings: &CentralSettings) -> Result<Self> {
        let pool = pool::connect(settings).await?;
        if settings.run_migrations {
            MIGRATOR.run(&pool).await?;
            info!("central migrations applied");
        }
        let store = Self::from_pool(pool).with_read_page_size(settings.read_page_size as usize);
        let months = store
            .partitions
            .precreate(&store.pool, Utc::now(), settings.precreate_months)
            .await?;
        debug!(count = months.len(), "partitions pre-created");
        Ok(store)
    }

    /// Wrap an existing pool whose schema is already migrated.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            partitions: Arc::new(PartitionManager::new()),
            read_page_size: DEFAULT_READ_PAGE_SIZE,
        }
    }

    /// Override the page size used by streamed reads.
    #[must_use]
    pub fn with_read_page_size(mut self, size: usize) -> Self {
        self.read_page_size = size.max(1);
        self
    }

    /// Underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Partition cache.
    #[must_use]
    pub fn partitions(&self) -> &PartitionManager {
        &self.partitions
    }

    /// Retention: drop every monthly partition older than `cutoff`.
    pub async fn drop_partitions_before(&self, cutoff: MonthKey) -> Result<Vec<String>> {
        self.partitions.drop_before(&self.pool, cutoff).await
    }

    async fn require(&self, id: SessionId) -> Result<()> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM sessions WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        found.map(|_| ()).ok_or(StorageError::UnknownSession(id))
    }
}

#[async_trait]
impl StorageBackend for CentralStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Central
    }

    async fn ping(&self) -> Result<()> {
        let _ = sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn schema_ready(&self) -> Result<bool> {
        let ready = sqlx::query_scalar::<_, bool>(
            "SELECT to_regclass('sessions') IS NOT NULL
                AND to_regclass('session_logs') IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(ready)
    }

    #[instrument(skip_all, fields(session_id = %meta.id))]
    async fn create_session(&self, meta: &SessionMeta) -> Result<SessionHandle> {
        let mut tx = self.pool.begin().await?;
        if is_retired(&mut *tx, meta.id).await? {
            return Err(StorageError::AlreadyExists(meta.id));
        }
        let inserted = sqlx::query(
            "INSERT INTO sessions (id, guild_id, name, start_time, end_time, is_auto,
                                   modifier_flags, credentials)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(meta.id.get())
        .bind(meta.guild_id.get())
        .bind(&meta.name)
        .bind(meta.start_time)
        .bind(meta.end_time)
        .bind(meta.is_auto)
        .bind(meta.modifier_flags)
        .bind(meta.credentials.clone().map(Json))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            return Err(StorageError::AlreadyExists(meta.id));
        }
        tx.commit().await?;
        Ok(SessionHandle {
            id: meta.id,
            start_time: meta.start_time,
        })
    }

    async fn append_events(&self, session_id: SessionId, batch: &[LogEvent]) -> Result<()> {
        let Some(last) = batch.last().map(|e| e.log_seq) else {
            return Ok(());
        };
        self.partitions.ensure_for_events(&self.pool, batch).await?;

        let mut times = Vec::with_capacity(batch.len());
        let mut seqs = Vec::with_capacity(batch.len());
        let mut types = Vec::with_capacity(batch.len());
        let mut payloads = Vec::with_capacity(batch.len());
        for event in batch {
            times.push(event.event_time);
            seqs.push(event.log_seq);
            types.push(event.event_type.as_str().to_string());
            payloads.push(
                event
                    .payload
                    .to_canonical_json()
                    .map_err(|e| StorageError::unavailable(BackendKind::Central, e))?,
            );
        }

        let mut tx = self.pool.begin().await?;
        let stored: Option<Option<i64>> =
            sqlx::query_scalar("SELECT last_log_seq FROM sessions WHERE id = $1 FOR UPDATE")
                .bind(session_id.get())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(last_seq) = stored else {
            return Err(StorageError::UnknownSession(session_id));
        };
        validate_batch(session_id, last_seq, batch)?;

        let _ = sqlx::query(
            "INSERT INTO session_logs (session_id, event_time, log_seq, event_type, payload)
             SELECT $1, t.event_time, t.log_seq, t.event_type, t.payload::jsonb
             FROM UNNEST($2::timestamptz[], $3::bigint[], $4::text[], $5::text[])
                  AS t(event_time, log_seq, event_type, payload)",
        )
        .bind(session_id.get())
        .bind(&times)
        .bind(&seqs)
        .bind(&types)
        .bind(&payloads)
        .execute(&mut *tx)
        .await?;
        let _ = sqlx::query("UPDATE sessions SET last_log_seq = $2 WHERE id = $1")
            .bind(session_id.get())
            .bind(last)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
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
        self.require(session_id).await?;
        let types: Vec<String> = range
            .event_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        let rows: Vec<DbEvent> = sqlx::query_as(
            "SELECT event_time, log_seq, event_type, payload FROM session_logs
             WHERE session_id = $1
               AND ($2::timestamptz IS NULL OR event_time >= $2)
               AND ($3::timestamptz IS NULL OR event_time < $3)
               AND ($4::timestamptz IS NULL OR (event_time, log_seq) > ($4, $5))
               AND (cardinality($6::text[]) = 0 OR event_type = ANY($6))
             ORDER BY event_time, log_seq
             LIMIT $7",
        )
        .bind(session_id.get())
        .bind(range.from)
        .bind(range.to)
        .bind(after.map(|c| c.event_time))
        .bind(after.map_or(0, |c| c.log_seq))
        .bind(&types)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DbEvent::into_event).collect()
    }

    async fn read_after_sequence(
        &self,
        session_id: SessionId,
        after_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogEvent>> {
        self.require(session_id).await?;
        let rows: Vec<DbEvent> = sqlx::query_as(
            "SELECT event_time, log_seq, event_type, payload FROM session_logs
             WHERE session_id = $1 AND ($2::bigint IS NULL OR log_seq > $2)
             ORDER BY log_seq
             LIMIT $3",
        )
        .bind(session_id.get())
        .bind(after_seq)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DbEvent::into_event).collect()
    }

    async fn close_session(&self, session_id: SessionId, end_time: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let stored: Option<(bool, Option<DateTime<Utc>>)> =
            sqlx::query_as("SELECT closed, end_time FROM sessions WHERE id = $1 FOR UPDATE")
                .bind(session_id.get())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((closed, stored_end)) = stored else {
            return Err(StorageError::UnknownSession(session_id));
        };
        if check_close(session_id, closed, stored_end, end_time)? {
            let _ = sqlx::query("UPDATE sessions SET end_time = $2, closed = TRUE WHERE id = $1")
                .bind(session_id.get())
                .bind(end_time)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_session_deleted(&self, session_id: SessionId, at: DateTime<Utc>) -> Result<()> {
        let changed = sqlx::query(
            "UPDATE sessions SET deleted_at = COALESCE(deleted_at, $2) WHERE id = $1",
        )
        .bind(session_id.get())
        .bind(at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if changed == 0 {
            return Err(StorageError::UnknownSession(session_id));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn delete_session(&self, session_id: SessionId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let events = sqlx::query("DELETE FROM session_logs WHERE session_id = $1")
            .bind(session_id.get())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let _ = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session_id.get())
            .execute(&mut *tx)
            .await?;
        retire(&mut *tx, &[session_id.get()]).await?;
        tx.commit().await?;
        debug!(events, "session deleted");
        Ok(())
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>> {
        let row: Option<DbSession> =
            sqlx::query_as(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"))
                .bind(session_id.get())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(SessionRecord::from))
    }

    async fn list_sessions(&self, range: SessionIdRange) -> Result<Vec<SessionRecord>> {
        let rows: Vec<DbSession> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE ($1::bigint IS NULL OR id >= $1) AND ($2::bigint IS NULL OR id <= $2)
             ORDER BY id"
        ))
        .bind(range.start.map(SessionId::get))
        .bind(range.end.map(SessionId::get))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SessionRecord::from).collect())
    }

    async fn import_session(&self, record: &SessionRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if is_retired(&mut *tx, record.id).await? {
            return Err(StorageError::AlreadyExists(record.id));
        }
        let _ = sqlx::query(
            "INSERT INTO sessions (id, guild_id, name, start_time, end_time, closed, is_auto,
                                   modifier_flags, credentials, deleted_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO UPDATE SET
                guild_id = EXCLUDED.guild_id,
                name = EXCLUDED.name,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                closed = EXCLUDED.closed,
                is_auto = EXCLUDED.is_auto,
                modifier_flags = EXCLUDED.modifier_flags,
                credentials = EXCLUDED.credentials,
                deleted_at = EXCLUDED.deleted_at",
        )
        .bind(record.id.get())
        .bind(record.guild_id.get())
        .bind(&record.name)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.closed)
        .bind(record.is_auto)
        .bind(record.modifier_flags)
        .bind(record.credentials.clone().map(Json))
        .bind(record.deleted_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn session_stats(&self, session_id: SessionId) -> Result<SessionStats> {
        self.require(session_id).await?;
        let (count, last): (i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), MAX(log_seq) FROM session_logs WHERE session_id = $1",
        )
        .bind(session_id.get())
        .fetch_one(&self.pool)
        .await?;
        Ok(SessionStats {
            event_count: count as u64,
            last_seq: last,
        })
    }

    async fn purge_expired_sessions(&self, before: DateTime<Utc>) -> Result<Vec<SessionId>> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM sessions
             WHERE deleted_at IS NOT NULL AND COALESCE(end_time, start_time) < $1
             ORDER BY id
             FOR UPDATE",
        )
        .bind(before)
        .fetch_all(&mut *tx)
        .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let _ = sqlx::query("DELETE FROM session_logs WHERE session_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        let _ = sqlx::query("DELETE FROM sessions WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        retire(&mut *tx, &ids).await?;
        tx.commit().await?;
        info!(purged = ids.len(), "purged expired central sessions");
        Ok(ids.into_iter().map(SessionId::new).collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
