//! Per-session log tables (`session_log_<id>`).

use hll_core::events::format_event_time;
use hll_core::{EventRange, EventType, LogEvent, LogPayload, SessionId};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};

use super::{parse_json, parse_time};
use crate::backend::{EventCursor, SessionStats};
use crate::errors::{BackendKind, Result, StorageError};

/// Unquoted table name for a session's log table.
#[must_use]
pub fn log_table_name(session_id: SessionId) -> String {
    format!("session_log_{}", session_id.get())
}

fn quoted(session_id: SessionId) -> String {
    format!("\"{}\"", log_table_name(session_id))
}

fn map_event(row: &Row<'_>) -> rusqlite::Result<LogEvent> {
    let time: String = row.get(0)?;
    let kind: String = row.get(2)?;
    let payload: String = row.get(3)?;
    Ok(LogEvent {
        event_time: parse_time(0, &time)?,
        log_seq: row.get(1)?,
        event_type: kind
            .parse::<EventType>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
        payload: parse_json::<LogPayload>(3, &payload)?,
    })
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Log table repository.
pub struct LogRepo;

impl LogRepo {
    /// Create the log table and its ordering index.
    pub fn create_table(conn: &Connection, session_id: SessionId) -> Result<()> {
        let table = log_table_name(session_id);
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (
                log_seq    INTEGER PRIMARY KEY,
                event_time TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS \"idx_{table}_time\" ON \"{table}\" (event_time, log_seq);"
        ))?;
        Ok(())
    }

    /// Drop the log table if present.
    pub fn drop_table(conn: &Connection, session_id: SessionId) -> Result<()> {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quoted(session_id)))?;
        Ok(())
    }

    /// Insert every event of an already validated batch.
    pub fn insert_batch(conn: &Connection, session_id: SessionId, batch: &[LogEvent]) -> Result<()> {
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT INTO {} (log_seq, event_time, event_type, payload) VALUES (?1, ?2, ?3, ?4)",
            quoted(session_id)
        ))?;
        for event in batch {
            let payload = event
                .payload
                .to_canonical_json()
                .map_err(|e| StorageError::unavailable(BackendKind::Legacy, e))?;
            let _ = stmt.execute(params![
                event.log_seq,
                format_event_time(&event.event_time),
                event.event_type.as_str(),
                payload,
            ])?;
        }
        Ok(())
    }

    /// One page ordered by `(event_time, log_seq)`.
    pub fn page(
        conn: &Connection,
        session_id: SessionId,
        range: &EventRange,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<LogEvent>> {
        let types = if range.event_types.is_empty() {
            None
        } else {
            let names: Vec<&str> = range.event_types.iter().map(|t| t.as_str()).collect();
            Some(
                serde_json::to_string(&names)
                    .map_err(|e| StorageError::unavailable(BackendKind::Legacy, e))?,
            )
        };
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT event_time, log_seq, event_type, payload FROM {}
             WHERE (?1 IS NULL OR event_time >= ?1)
               AND (?2 IS NULL OR event_time < ?2)
               AND (?3 IS NULL OR event_time > ?3 OR (event_time = ?3 AND log_seq > ?4))
               AND (?5 IS NULL OR event_type IN (SELECT value FROM json_each(?5)))
             ORDER BY event_time, log_seq
             LIMIT ?6",
            quoted(session_id)
        ))?;
        let rows = stmt
            .query_map(
                params![
                    range.from.as_ref().map(format_event_time),
                    range.to.as_ref().map(format_event_time),
                    after.as_ref().map(|c| format_event_time(&c.event_time)),
                    after.map_or(0, |c| c.log_seq),
                    types,
                    limit_param(limit),
                ],
                map_event,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Events with `log_seq > after_seq`, ordered by `log_seq`.
    pub fn after_sequence(
        conn: &Connection,
        session_id: SessionId,
        after_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogEvent>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT event_time, log_seq, event_type, payload FROM {}
             WHERE (?1 IS NULL OR log_seq > ?1)
             ORDER BY log_seq
             LIMIT ?2",
            quoted(session_id)
        ))?;
        let rows = stmt
            .query_map(params![after_seq, limit_param(limit)], map_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Row count and highest sequence number.
    pub fn stats(conn: &Connection, session_id: SessionId) -> Result<SessionStats> {
        let (count, last): (i64, Option<i64>) = conn.query_row(
            &format!("SELECT COUNT(*), MAX(log_seq) FROM {}", quoted(session_id)),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(SessionStats {
            event_count: count as u64,
            last_seq: last,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use hll_core::PlayerRef;

    fn setup(id: i64) -> (Connection, SessionId) {
        let conn = Connection::open_in_memory().unwrap();
        let session = SessionId::new(id);
        LogRepo::create_table(&conn, session).unwrap();
        (conn, session)
    }

    fn event(offset_secs: i64, seq: i64, kind: EventType) -> LogEvent {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap();
        LogEvent::new(
            base + Duration::seconds(offset_secs),
            seq,
            kind,
            LogPayload {
                player: Some(PlayerRef {
                    name: "Able".into(),
                    id: "7656".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn insert_and_read_back() {
        let (conn, id) = setup(1);
        let batch = vec![event(0, 1, EventType::Kill), event(1, 2, EventType::Chat)];
        LogRepo::insert_batch(&conn, id, &batch).unwrap();
        let page = LogRepo::page(&conn, id, &EventRange::all(), None, 10).unwrap();
        assert_eq!(page, batch);
    }

    #[test]
    fn page_orders_by_time_then_seq() {
        let (conn, id) = setup(2);
        // seq 3 happened before seq 1 and 2 (clock skew on the server)
        let batch = vec![
            event(5, 1, EventType::Kill),
            event(5, 2, EventType::Kill),
            event(0, 3, EventType::Kill),
        ];
        LogRepo::insert_batch(&conn, id, &batch).unwrap();
        let seqs: Vec<i64> = LogRepo::page(&conn, id, &EventRange::all(), None, 10)
            .unwrap()
            .iter()
            .map(|e| e.log_seq)
            .collect();
        assert_eq!(seqs, vec![3, 1, 2]);
    }

    #[test]
    fn page_resumes_after_cursor_with_equal_times() {
        let (conn, id) = setup(3);
        let batch: Vec<LogEvent> = (1..=5).map(|s| event(0, s, EventType::Kill)).collect();
        LogRepo::insert_batch(&conn, id, &batch).unwrap();

        let first = LogRepo::page(&conn, id, &EventRange::all(), None, 2).unwrap();
        assert_eq!(first.len(), 2);
        let cursor = first.last().map(EventCursor::from);
        let second = LogRepo::page(&conn, id, &EventRange::all(), cursor, 10).unwrap();
        let seqs: Vec<i64> = second.iter().map(|e| e.log_seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn page_filters_types_and_window() {
        let (conn, id) = setup(4);
        let batch = vec![
            event(0, 1, EventType::Kill),
            event(10, 2, EventType::Chat),
            event(20, 3, EventType::Kill),
            event(30, 4, EventType::Connect),
        ];
        LogRepo::insert_batch(&conn, id, &batch).unwrap();

        let range = EventRange {
            from: Some(batch[1].event_time),
            to: Some(batch[3].event_time),
            event_types: vec![EventType::Kill, EventType::Connect],
        };
        let got = LogRepo::page(&conn, id, &range, None, 10).unwrap();
        assert_eq!(got, vec![batch[2].clone()]);
    }

    #[test]
    fn after_sequence_and_stats() {
        let (conn, id) = setup(5);
        let batch: Vec<LogEvent> = (1..=4).map(|s| event(s, s * 10, EventType::Kill)).collect();
        LogRepo::insert_batch(&conn, id, &batch).unwrap();

        let tail = LogRepo::after_sequence(&conn, id, Some(20), 10).unwrap();
        assert_eq!(tail.iter().map(|e| e.log_seq).collect::<Vec<_>>(), vec![30, 40]);
        let head = LogRepo::after_sequence(&conn, id, None, 1).unwrap();
        assert_eq!(head[0].log_seq, 10);

        let stats = LogRepo::stats(&conn, id).unwrap();
        assert_eq!(stats.event_count, 4);
        assert_eq!(stats.last_seq, Some(40));
    }

    #[test]
    fn negative_ids_get_valid_table_names() {
        let (conn, id) = setup(-3);
        LogRepo::insert_batch(&conn, id, &[event(0, 1, EventType::Kill)]).unwrap();
        assert_eq!(LogRepo::stats(&conn, id).unwrap().event_count, 1);
        LogRepo::drop_table(&conn, id).unwrap();
        assert!(LogRepo::stats(&conn, id).is_err());
    }
}
