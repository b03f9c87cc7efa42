//! Divergence records: secondary writes that failed in dual mode.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use hll_core::SessionId;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::errors::BackendKind;
use crate::metrics::STORAGE_DIVERGENCE_TOTAL;

/// Mutating operation kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// `create_session`.
    CreateSession,
    /// `append_events`.
    AppendEvents,
    /// `close_session`.
    CloseSession,
    /// `mark_session_deleted`.
    MarkSessionDeleted,
    /// `delete_session`.
    DeleteSession,
}

impl OperationKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateSession => "create_session",
            Self::AppendEvents => "append_events",
            Self::CloseSession => "close_session",
            Self::MarkSessionDeleted => "mark_session_deleted",
            Self::DeleteSession => "delete_session",
        }
    }
}

/// One failed secondary write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DivergenceRecord {
    /// Affected session.
    pub session_id: SessionId,
    /// Operation that failed.
    pub operation: OperationKind,
    /// Backend that failed.
    pub backend: BackendKind,
    /// Error message.
    pub error: String,
    /// When the failure was observed.
    pub observed_at: DateTime<Utc>,
}

/// Default number of records kept before the oldest are dropped.
pub const DEFAULT_DIVERGENCE_CAPACITY: usize = 10_000;

/// Bounded in-memory divergence log, drained by the auditor.
#[derive(Debug)]
pub struct DivergenceLog {
    records: Mutex<VecDeque<DivergenceRecord>>,
    capacity: usize,
}

impl Default for DivergenceLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DIVERGENCE_CAPACITY)
    }
}

impl DivergenceLog {
    /// Log keeping at most `capacity` records.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record a failure, emitting the warning and the counter.
    pub fn record(&self, record: DivergenceRecord) {
        warn!(
            session_id = %record.session_id,
            operation = record.operation.as_str(),
            backend = record.backend.as_str(),
            error = %record.error,
            "secondary write failed, backends diverged"
        );
        metrics::counter!(
            STORAGE_DIVERGENCE_TOTAL,
            "operation" => record.operation.as_str(),
            "backend" => record.backend.as_str()
        )
        .increment(1);

        let mut records = self.records.lock();
        if records.len() == self.capacity {
            let _ = records.pop_front();
        }
        records.push_back(record);
    }

    /// Take every record, oldest first.
    pub fn drain(&self) -> Vec<DivergenceRecord> {
        self.records.lock().drain(..).collect()
    }

    /// Copy of every record, oldest first.
    pub fn snapshot(&self) -> Vec<DivergenceRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no records are held.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
