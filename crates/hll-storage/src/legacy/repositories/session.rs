//! Session metadata rows and retired ids.

use chrono::{DateTime, Utc};
use hll_core::events::format_event_time;
use hll_core::{CredentialSnapshot, GuildId, SessionId, SessionIdRange, SessionRecord};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{parse_json, parse_time};
use crate::errors::{BackendKind, Result, StorageError};

const SESSION_COLUMNS: &str = "id, guild_id, name, start_time, end_time, closed, is_auto, \
                               modifier_flags, credentials, deleted_at, last_log_seq";

/// A session row plus the bookkeeping column the store keeps beside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredSession {
    /// The session as callers see it.
    pub record: SessionRecord,
    /// Highest persisted sequence number.
    pub last_log_seq: Option<i64>,
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<StoredSession> {
    let start: String = row.get(3)?;
    let end: Option<String> = row.get(4)?;
    let credentials: Option<String> = row.get(8)?;
    let deleted: Option<String> = row.get(9)?;

    Ok(StoredSession {
        record: SessionRecord {
            id: SessionId::new(row.get(0)?),
            guild_id: GuildId::new(row.get(1)?),
            name: row.get(2)?,
            start_time: parse_time(3, &start)?,
            end_time: end.as_deref().map(|t| parse_time(4, t)).transpose()?,
            closed: row.get(5)?,
            is_auto: row.get(6)?,
            modifier_flags: row.get(7)?,
            credentials: credentials
                .as_deref()
                .map(|c| parse_json::<CredentialSnapshot>(8, c))
                .transpose()?,
            deleted_at: deleted.as_deref().map(|t| parse_time(9, t)).transpose()?,
        },
        last_log_seq: row.get(10)?,
    })
}

fn credentials_json(record: &SessionRecord) -> Result<Option<String>> {
    record
        .credentials
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StorageError::unavailable(BackendKind::Legacy, e))
}

/// Session repository.
pub struct SessionRepo;

impl SessionRepo {
    /// Fetch a live session.
    pub fn get(conn: &Connection, id: SessionId) -> Result<Option<StoredSession>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        Ok(conn
            .query_row(&sql, params![id.get()], map_session)
            .optional()?)
    }

    /// Live sessions in `range`, ascending by id.
    pub fn list(conn: &Connection, range: SessionIdRange) -> Result<Vec<StoredSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE (?1 IS NULL OR id >= ?1) AND (?2 IS NULL OR id <= ?2)
             ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![range.start.map(SessionId::get), range.end.map(SessionId::get)],
                map_session,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Insert a new row.
    pub fn insert(conn: &Connection, record: &SessionRecord) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO sessions (id, guild_id, name, start_time, end_time, closed, is_auto,
                                   modifier_flags, credentials, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id.get(),
                record.guild_id.get(),
                record.name,
                format_event_time(&record.start_time),
                record.end_time.as_ref().map(format_event_time),
                record.closed,
                record.is_auto,
                record.modifier_flags,
                credentials_json(record)?,
                record.deleted_at.as_ref().map(format_event_time),
            ],
        )?;
        Ok(())
    }

    /// Insert or overwrite a row, leaving `last_log_seq` as stored.
    pub fn upsert(conn: &Connection, record: &SessionRecord) -> Result<()> {
        let _ = conn.execute(
            "INSERT INTO sessions (id, guild_id, name, start_time, end_time, closed, is_auto,
                                   modifier_flags, credentials, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (id) DO UPDATE SET
                guild_id = excluded.guild_id,
                name = excluded.name,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                closed = excluded.closed,
                is_auto = excluded.is_auto,
                modifier_flags = excluded.modifier_flags,
                credentials = excluded.credentials,
                deleted_at = excluded.deleted_at",
            params![
                record.id.get(),
                record.guild_id.get(),
                record.name,
                format_event_time(&record.start_time),
                record.end_time.as_ref().map(format_event_time),
                record.closed,
                record.is_auto,
                record.modifier_flags,
                credentials_json(record)?,
                record.deleted_at.as_ref().map(format_event_time),
            ],
        )?;
        Ok(())
    }

    /// Record the close.
    pub fn set_closed(conn: &Connection, id: SessionId, end_time: DateTime<Utc>) -> Result<()> {
        let _ = conn.execute(
            "UPDATE sessions SET end_time = ?2, closed = 1 WHERE id = ?1",
            params![id.get(), format_event_time(&end_time)],
        )?;
        Ok(())
    }

    /// Set the soft-delete marker unless one is already present.
    pub fn mark_deleted(conn: &Connection, id: SessionId, at: DateTime<Utc>) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE sessions SET deleted_at = COALESCE(deleted_at, ?2) WHERE id = ?1",
            params![id.get(), format_event_time(&at)],
        )?;
        Ok(changed > 0)
    }

    /// Advance the persisted sequence high-water mark.
    pub fn set_last_seq(conn: &Connection, id: SessionId, seq: i64) -> Result<()> {
        let _ = conn.execute(
            "UPDATE sessions SET last_log_seq = ?2 WHERE id = ?1",
            params![id.get(), seq],
        )?;
        Ok(())
    }

    /// Delete the row. Returns whether it existed.
    pub fn delete(conn: &Connection, id: SessionId) -> Result<bool> {
        let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id.get()])?;
        Ok(changed > 0)
    }

    /// Whether the id belonged to a deleted session.
    pub fn is_retired(conn: &Connection, id: SessionId) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM retired_sessions WHERE id = ?1",
                params![id.get()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record the id as retired.
    pub fn retire(conn: &Connection, id: SessionId, at: DateTime<Utc>) -> Result<()> {
        let _ = conn.execute(
            "INSERT OR IGNORE INTO retired_sessions (id, retired_at) VALUES (?1, ?2)",
            params![id.get(), format_event_time(&at)],
        )?;
        Ok(())
    }

    /// Soft-deleted sessions whose end (or start) is before `before`.
    pub fn expired_ids(conn: &Connection, before: DateTime<Utc>) -> Result<Vec<SessionId>> {
        let mut stmt = conn.prepare(
            "SELECT id FROM sessions
             WHERE deleted_at IS NOT NULL AND COALESCE(end_time, start_time) < ?1
             ORDER BY id",
        )?;
        let ids = stmt
            .query_map(params![format_event_time(&before)], |row| {
                row.get::<_, i64>(0).map(SessionId::new)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::migrations::run_migrations;
    use chrono::TimeZone;

    fn setup() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        let _ = run_migrations(&mut conn).unwrap();
        conn
    }

    fn record(id: i64) -> SessionRecord {
        SessionRecord {
            id: SessionId::new(id),
            guild_id: GuildId::new(9),
            name: format!("session {id}"),
            start_time: Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap(),
            end_time: None,
            closed: false,
            is_auto: true,
            modifier_flags: 3,
            credentials: Some(CredentialSnapshot {
                credentials_id: None,
                name: "EU".into(),
                address: "127.0.0.1".into(),
                port: 7779,
                default_modifiers: 1,
            }),
            deleted_at: None,
        }
    }

    #[test]
    fn insert_and_get() {
        let conn = setup();
        SessionRepo::insert(&conn, &record(1)).unwrap();
        let stored = SessionRepo::get(&conn, SessionId::new(1)).unwrap().unwrap();
        assert_eq!(stored.record, record(1));
        assert_eq!(stored.last_log_seq, None);
    }

    #[test]
    fn upsert_overwrites_metadata_but_keeps_seq() {
        let conn = setup();
        SessionRepo::insert(&conn, &record(1)).unwrap();
        SessionRepo::set_last_seq(&conn, SessionId::new(1), 12).unwrap();

        let mut updated = record(1);
        updated.closed = true;
        updated.end_time = Some(Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap());
        SessionRepo::upsert(&conn, &updated).unwrap();

        let stored = SessionRepo::get(&conn, SessionId::new(1)).unwrap().unwrap();
        assert_eq!(stored.record, updated);
        assert_eq!(stored.last_log_seq, Some(12));
    }

    #[test]
    fn list_respects_range() {
        let conn = setup();
        for id in [5, 1, 3] {
            SessionRepo::insert(&conn, &record(id)).unwrap();
        }
        let all: Vec<i64> = SessionRepo::list(&conn, SessionIdRange::all())
            .unwrap()
            .iter()
            .map(|s| s.record.id.get())
            .collect();
        assert_eq!(all, vec![1, 3, 5]);

        let some = SessionRepo::list(
            &conn,
            SessionIdRange {
                start: Some(SessionId::new(2)),
                end: Some(SessionId::new(4)),
            },
        )
        .unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].record.id.get(), 3);
    }

    #[test]
    fn mark_deleted_keeps_first_marker() {
        let conn = setup();
        SessionRepo::insert(&conn, &record(1)).unwrap();
        let first = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        assert!(SessionRepo::mark_deleted(&conn, SessionId::new(1), first).unwrap());
        assert!(SessionRepo::mark_deleted(&conn, SessionId::new(1), later).unwrap());
        let stored = SessionRepo::get(&conn, SessionId::new(1)).unwrap().unwrap();
        assert_eq!(stored.record.deleted_at, Some(first));
    }

    #[test]
    fn retire_is_idempotent() {
        let conn = setup();
        let now = Utc::now();
        SessionRepo::retire(&conn, SessionId::new(4), now).unwrap();
        SessionRepo::retire(&conn, SessionId::new(4), now).unwrap();
        assert!(SessionRepo::is_retired(&conn, SessionId::new(4)).unwrap());
        assert!(!SessionRepo::is_retired(&conn, SessionId::new(5)).unwrap());
    }

    #[test]
    fn expired_ids_use_end_or_start() {
        let conn = setup();
        let cutoff = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();

        let open = record(1);
        let mut ended_late = record(2);
        ended_late.end_time = Some(Utc.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap());
        let not_deleted = record(3);
        for r in [&open, &ended_late, &not_deleted] {
            SessionRepo::insert(&conn, r).unwrap();
        }
        let _ = SessionRepo::mark_deleted(&conn, SessionId::new(1), cutoff).unwrap();
        let _ = SessionRepo::mark_deleted(&conn, SessionId::new(2), cutoff).unwrap();

        let ids = SessionRepo::expired_ids(&conn, cutoff).unwrap();
        assert_eq!(ids, vec![SessionId::new(1)]);
    }
}
