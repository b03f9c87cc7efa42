//! Persisted backfill progress.
//!
//! The checkpoint is a small JSON file rewritten after every committed batch
//! (temp file, then rename) so an interrupted run resumes where it stopped.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use hll_core::{SessionId, SessionIdRange};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{Result, StorageError};

/// Progress inside the session currently being copied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    /// Session being copied.
    pub session_id: SessionId,
    /// Last sequence number committed to the destination.
    pub last_seq: Option<i64>,
}

/// Backfill progress marker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationCheckpoint {
    /// Sessions the run that wrote this checkpoint was copying.
    pub range: SessionIdRange,
    /// Highest session id fully copied.
    pub completed_through: Option<SessionId>,
    /// Partially copied session, if any.
    pub current: Option<SessionProgress>,
    /// Sessions fully copied so far.
    pub sessions_copied: u64,
    /// Events copied so far.
    pub events_copied: u64,
    /// Last write of this checkpoint.
    pub updated_at: Option<DateTime<Utc>>,
}

impl MigrationCheckpoint {
    /// Empty checkpoint for a run over `range`.
    #[must_use]
    pub fn for_range(range: SessionIdRange) -> Self {
        Self {
            range,
            ..Self::default()
        }
    }

    /// Whether `session_id` was fully copied by an earlier run.
    #[must_use]
    pub fn is_completed(&self, session_id: SessionId) -> bool {
        self.completed_through.is_some_and(|done| session_id <= done)
    }

    /// Sequence to resume `session_id` from, if it was in progress.
    #[must_use]
    pub fn resume_seq(&self, session_id: SessionId) -> Option<i64> {
        self.current
            .filter(|p| p.session_id == session_id)
            .and_then(|p| p.last_seq)
    }

    /// Record a committed batch.
    pub fn batch_committed(&mut self, session_id: SessionId, last_seq: i64, events: u64) {
        self.current = Some(SessionProgress {
            session_id,
            last_seq: Some(last_seq),
        });
        self.events_copied += events;
    }

    /// Record a fully copied session.
    pub fn session_completed(&mut self, session_id: SessionId) {
        self.completed_through = Some(
            self.completed_through
                .map_or(session_id, |done| done.max(session_id)),
        );
        self.current = None;
        self.sessions_copied += 1;
    }
}

/// Reads and writes the checkpoint file.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint. A missing file is `None`.
    pub async fn load(&self) -> Result<Option<MigrationCheckpoint>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.failure("read", e)),
        };
        let checkpoint = serde_json::from_slice(&bytes).map_err(|e| self.failure("parse", e))?;
        debug!(path = %self.path.display(), "loaded backfill checkpoint");
        Ok(Some(checkpoint))
    }

    /// Stamp and persist `checkpoint` atomically.
    pub async fn save(&self, checkpoint: &mut MigrationCheckpoint) -> Result<()> {
        checkpoint.updated_at = Some(Utc::now());
        let json =
            serde_json::to_vec_pretty(checkpoint).map_err(|e| self.failure("serialize", e))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.failure("create directory for", e))?;
        }
        let tmp = self.sibling(".tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.failure("write", e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.failure("replace", e))?;
        Ok(())
    }

    /// Move a completed checkpoint aside to `<path>.done-<timestamp>`.
    /// Returns the archive path, or `None` when there was nothing to archive.
    pub async fn archive(&self) -> Result<Option<PathBuf>> {
        if !tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| self.failure("stat", e))?
        {
            return Ok(None);
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let archived = self.sibling(&format!(".done-{stamp}"));
        tokio::fs::rename(&self.path, &archived)
            .await
            .map_err(|e| self.failure("archive", e))?;
        info!(path = %archived.display(), "archived backfill checkpoint");
        Ok(Some(archived))
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn failure(&self, action: &str, err: impl std::fmt::Display) -> StorageError {
        StorageError::MigrationIncomplete {
            reason: format!("failed to {action} checkpoint {}: {err}", self.path.display()),
        }
    }
}
