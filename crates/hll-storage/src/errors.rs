//! Error taxonomy for storage operations.
//!
//! Callers only ever see [`StorageError`]. Driver errors from `rusqlite`,
//! `r2d2` and `sqlx` are folded into [`StorageError::BackendUnavailable`]
//! tagged with the [`BackendKind`] that produced them.

use std::fmt;

use hll_core::{SessionId, StorageMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which physical backend an operation ran against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Per-session-table SQLite store.
    Legacy,
    /// Partitioned Postgres store.
    Central,
}

impl BackendKind {
    /// Lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Central => "central",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Session was never created or has been deleted.
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// Session id is already in use (or was used by a deleted session).
    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),

    /// Sequence numbers or end time contradict what is stored.
    #[error("conflict on session {session_id}: {message}")]
    Conflict {
        /// Affected session.
        session_id: SessionId,
        /// What contradicted the stored state.
        message: String,
    },

    /// Connection, timeout or driver failure.
    #[error("{backend} backend unavailable: {message}")]
    BackendUnavailable {
        /// Backend that failed.
        backend: BackendKind,
        /// Driver or transport message.
        message: String,
    },

    /// Mode change refused; the current mode is unchanged.
    #[error("mode transition {from} -> {to} rejected: {reason}")]
    ModeTransitionRejected {
        /// Mode at the time of the request.
        from: StorageMode,
        /// Requested mode.
        to: StorageMode,
        /// Why the request was refused.
        reason: String,
    },

    /// Backfill stopped before reaching parity.
    #[error("migration incomplete: {reason}")]
    MigrationIncomplete {
        /// Why the run stopped.
        reason: String,
    },
}

impl StorageError {
    /// Build a [`StorageError::BackendUnavailable`].
    pub fn unavailable(backend: BackendKind, message: impl fmt::Display) -> Self {
        Self::BackendUnavailable {
            backend,
            message: message.to_string(),
        }
    }

    /// Build a [`StorageError::Conflict`].
    pub fn conflict(session_id: SessionId, message: impl Into<String>) -> Self {
        Self::Conflict {
            session_id,
            message: message.into(),
        }
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    /// Short label for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::UnknownSession(_) => "unknown_session",
            Self::AlreadyExists(_) => "already_exists",
            Self::Conflict { .. } => "conflict",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::ModeTransitionRejected { .. } => "mode_transition_rejected",
            Self::MigrationIncomplete { .. } => "migration_incomplete",
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::unavailable(BackendKind::Legacy, err)
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(err: r2d2::Error) -> Self {
        Self::unavailable(BackendKind::Legacy, err)
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        Self::unavailable(BackendKind::Central, err)
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::unavailable(BackendKind::Central, format!("migration failed: {err}"))
    }
}

/// Convenience type alias for storage results.
pub type Result<T> = std::result::Result<T, StorageError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
