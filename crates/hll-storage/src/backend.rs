//! The capability contract every storage backend implements.
//!
//! Both the legacy SQLite store and the central Postgres store implement
//! [`StorageBackend`]. The coordinator, auditor and backfill migrator only
//! talk to `Arc<dyn StorageBackend>`, so tests can substitute either store
//! (or a wrapper that injects failures) anywhere.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use hll_core::events::format_event_time;
use hll_core::{EventRange, LogEvent, SessionId, SessionIdRange, SessionMeta, SessionRecord};
use sha2::{Digest, Sha256};

use crate::errors::{BackendKind, Result, StorageError};

/// Returned by [`StorageBackend::create_session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionHandle {
    /// The session id, as given.
    pub id: SessionId,
    /// Capture start recorded for the session.
    pub start_time: DateTime<Utc>,
}

/// Keyset position for paged reads: the last `(event_time, log_seq)` returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventCursor {
    /// Event time of the last row returned.
    pub event_time: DateTime<Utc>,
    /// Sequence number of the last row returned.
    pub log_seq: i64,
}

impl From<&LogEvent> for EventCursor {
    fn from(event: &LogEvent) -> Self {
        Self {
            event_time: event.event_time,
            log_seq: event.log_seq,
        }
    }
}

/// Per-session aggregate used by the auditor and the backfill report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Number of stored events.
    pub event_count: u64,
    /// Highest persisted sequence number.
    pub last_seq: Option<i64>,
}

/// Storage backend contract.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Which physical backend this is.
    fn kind(&self) -> BackendKind;

    /// Verify the backend answers.
    async fn ping(&self) -> Result<()>;

    /// Whether the session tables exist. Backends that migrate on open are
    /// always ready; a store reached without migrations may not be.
    async fn schema_ready(&self) -> Result<bool> {
        Ok(true)
    }

    /// Allocate storage for a new session.
    ///
    /// Fails with [`StorageError::AlreadyExists`] if the id is live or retired.
    async fn create_session(&self, meta: &SessionMeta) -> Result<SessionHandle>;

    /// Atomically append a batch. See [`validate_batch`] for the sequence rules.
    async fn append_events(&self, session_id: SessionId, batch: &[LogEvent]) -> Result<()>;

    /// Page size used by [`read_events`].
    fn read_page_size(&self) -> usize;

    /// One page of events ordered by `(event_time, log_seq)`, strictly after
    /// `after` when given.
    async fn read_page(
        &self,
        session_id: SessionId,
        range: &EventRange,
        after: Option<EventCursor>,
        limit: usize,
    ) -> Result<Vec<LogEvent>>;

    /// Events with `log_seq > after_seq`, ordered by `log_seq`.
    async fn read_after_sequence(
        &self,
        session_id: SessionId,
        after_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogEvent>>;

    /// Mark the session closed. Repeating with the same end time is a no-op;
    /// a different end time is a [`StorageError::Conflict`].
    async fn close_session(&self, session_id: SessionId, end_time: DateTime<Utc>) -> Result<()>;

    /// Set the soft-delete marker. Keeps the first marker if already set.
    async fn mark_session_deleted(&self, session_id: SessionId, at: DateTime<Utc>) -> Result<()>;

    /// Remove metadata and every event, retiring the id. Idempotent.
    async fn delete_session(&self, session_id: SessionId) -> Result<()>;

    /// Stored record, `None` if unknown or deleted.
    async fn get_session(&self, session_id: SessionId) -> Result<Option<SessionRecord>>;

    /// Sessions in `range`, ascending by id, soft-deleted ones included.
    async fn list_sessions(&self, range: SessionIdRange) -> Result<Vec<SessionRecord>>;

    /// Insert or update a session row verbatim, preserving id, end time,
    /// close flag and soft-delete marker. Used by backfill.
    async fn import_session(&self, record: &SessionRecord) -> Result<()>;

    /// Event count and last persisted sequence.
    async fn session_stats(&self, session_id: SessionId) -> Result<SessionStats>;

    /// Hard-delete soft-deleted sessions whose end (or start, if open) is
    /// before `before`. Returns the purged ids.
    async fn purge_expired_sessions(&self, before: DateTime<Utc>) -> Result<Vec<SessionId>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Check a batch against the last persisted sequence number.
///
/// Sequence numbers must be strictly increasing within the batch and the
/// first must be greater than `last_seq`. An empty batch always passes.
pub fn validate_batch(session_id: SessionId, last_seq: Option<i64>, batch: &[LogEvent]) -> Result<()> {
    if let (Some(first), Some(last)) = (batch.first(), last_seq) {
        if first.log_seq <= last {
            return Err(StorageError::conflict(
                session_id,
                format!(
                    "log_seq {} is not greater than last persisted {last}",
                    first.log_seq
                ),
            ));
        }
    }
    for pair in batch.windows(2) {
        if pair[1].log_seq <= pair[0].log_seq {
            return Err(StorageError::conflict(
                session_id,
                format!(
                    "log_seq {} follows {} within the batch",
                    pair[1].log_seq, pair[0].log_seq
                ),
            ));
        }
    }
    Ok(())
}

/// Decide whether a repeated close contradicts the stored one.
pub(crate) fn check_close(
    session_id: SessionId,
    closed: bool,
    stored_end: Option<DateTime<Utc>>,
    end_time: DateTime<Utc>,
) -> Result<bool> {
    if !closed {
        return Ok(true);
    }
    if stored_end == Some(end_time) {
        return Ok(false);
    }
    Err(StorageError::conflict(
        session_id,
        format!(
            "already closed at {}, refusing {}",
            stored_end.map_or_else(|| "unknown".to_string(), |t| format_event_time(&t)),
            format_event_time(&end_time)
        ),
    ))
}

/// Lazily stream a session's events in `(event_time, log_seq)` order.
///
/// Pages are fetched on demand with keyset pagination, so memory stays
/// bounded by the backend's page size. The stream is finite and may be
/// re-created with a different range at any time. An unknown session
/// surfaces as the first item.
pub fn read_events(
    backend: Arc<dyn StorageBackend>,
    session_id: SessionId,
    range: EventRange,
) -> BoxStream<'static, Result<LogEvent>> {
    let limit = backend.read_page_size().max(1);
    let start = Some((backend, range, None::<EventCursor>));

    stream::try_unfold(start, move |state| async move {
        let Some((backend, range, after)) = state else {
            return Ok::<_, StorageError>(None);
        };
        let page = backend.read_page(session_id, &range, after, limit).await?;
        if page.is_empty() {
            return Ok(None);
        }
        let next = if page.len() < limit {
            None
        } else {
            page.last()
                .map(EventCursor::from)
                .map(|cursor| (backend, range, Some(cursor)))
        };
        let items: Vec<Result<LogEvent>> = page.into_iter().map(Ok).collect();
        Ok(Some((stream::iter(items), next)))
    })
    .try_flatten()
    .boxed()
}

/// Content checksum of a session: event count and hex SHA-256 over the
/// ordered stream of `(event_time, log_seq, event_type, canonical payload)`.
pub async fn session_checksum(
    backend: Arc<dyn StorageBackend>,
    session_id: SessionId,
) -> Result<(u64, String)> {
    let kind = backend.kind();
    let mut events = read_events(backend, session_id, EventRange::all());
    let mut hasher = Sha256::new();
    let mut count = 0u64;

    while let Some(event) = events.try_next().await? {
        let payload = event
            .payload
            .to_canonical_json()
            .map_err(|e| StorageError::unavailable(kind, e))?;
        hasher.update(format_event_time(&event.event_time).as_bytes());
        hasher.update(b"|");
        hasher.update(event.log_seq.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(event.event_type.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(payload.as_bytes());
        hasher.update(b"\n");
        count += 1;
    }

    Ok((count, format!("{:x}", hasher.finalize())))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
