//! The backfill copy loop.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use hll_core::{LogEvent, RetryConfig, SessionId, SessionIdRange, SessionRecord};
use hll_settings::BackfillSettings;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::checkpoint::{CheckpointStore, MigrationCheckpoint};
use super::report::{BackfillReport, ChecksumMismatch, TableCount};
use crate::backend::{SessionStats, StorageBackend, session_checksum};
use crate::errors::{Result, StorageError};
use crate::legacy::log_table_name;
use crate::metrics::{BACKFILL_BATCH_RETRIES_TOTAL, BACKFILL_ROWS_COPIED_TOTAL};

/// Parameters of one backfill run.
#[derive(Clone, Debug, PartialEq)]
pub struct BackfillOptions {
    /// Sessions to copy.
    pub range: SessionIdRange,
    /// Events per batch.
    pub batch_size: usize,
    /// Read and check connectivity only.
    pub dry_run: bool,
    /// Compare content checksums after copying.
    pub checksums: bool,
    /// Backoff for transient failures.
    pub retry: RetryConfig,
    /// Checkpoint file location.
    pub checkpoint_path: PathBuf,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self::from(&BackfillSettings::default())
    }
}

impl From<&BackfillSettings> for BackfillOptions {
    fn from(settings: &BackfillSettings) -> Self {
        Self {
            range: SessionIdRange::all(),
            batch_size: settings.batch_size.max(1) as usize,
            dry_run: false,
            checksums: false,
            retry: RetryConfig {
                max_retries: settings.max_retries,
                base_delay_ms: settings.base_delay_ms,
                max_delay_ms: settings.max_delay_ms,
                ..RetryConfig::default()
            },
            checkpoint_path: PathBuf::from(&settings.checkpoint_path),
        }
    }
}

/// Copies sessions and events from `source` to `destination` in batches.
///
/// Session and event identifiers are preserved. Each batch is one atomic
/// append on the destination, and the checkpoint advances only after it
/// commits, so stopping between batches is always safe.
pub struct BackfillMigrator {
    source: Arc<dyn StorageBackend>,
    destination: Arc<dyn StorageBackend>,
    options: BackfillOptions,
    cancel: CancellationToken,
}

impl BackfillMigrator {
    /// Migrator with its own cancellation token.
    pub fn new(
        source: Arc<dyn StorageBackend>,
        destination: Arc<dyn StorageBackend>,
        options: BackfillOptions,
    ) -> Self {
        Self {
            source,
            destination,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop when `cancel` fires. Checked between batches and during backoff.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops this run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Options in use.
    pub fn options(&self) -> &BackfillOptions {
        &self.options
    }

    /// Run the copy.
    ///
    /// Both backends must answer a ping first; that failure is returned as
    /// is. Any later failure saves the checkpoint and becomes
    /// [`StorageError::MigrationIncomplete`]. A completed run archives the
    /// checkpoint.
    pub async fn run(&self) -> Result<BackfillReport> {
        let started = Instant::now();
        self.source.ping().await?;
        self.destination.ping().await?;

        // a dry run may reach a database that was never migrated
        let bare = self.options.dry_run && !self.destination.schema_ready().await?;
        if bare {
            info!("destination schema not created yet, treating it as empty");
        }

        let store = CheckpointStore::new(&self.options.checkpoint_path);
        let range = self.options.range;
        let saved = if self.options.dry_run {
            None
        } else {
            store.load().await?
        };
        let mut checkpoint = match saved {
            Some(saved) if saved.range == range => saved,
            Some(saved) => {
                warn!(
                    saved_start = ?saved.range.start.map(SessionId::get),
                    saved_end = ?saved.range.end.map(SessionId::get),
                    "checkpoint was written for a different session range, starting over"
                );
                MigrationCheckpoint::for_range(range)
            }
            None => MigrationCheckpoint::for_range(range),
        };
        let mut report = BackfillReport::new(self.options.dry_run);
        report.resumed_after = checkpoint.completed_through;
        if let Some(after) = checkpoint.completed_through {
            info!(
                after = %after,
                sessions_copied = checkpoint.sessions_copied,
                events_copied = checkpoint.events_copied,
                "resuming backfill from checkpoint"
            );
        }

        let result = self.copy_all(&store, &mut checkpoint, &mut report, bare).await;
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        if let Err(e) = result {
            if !self.options.dry_run {
                if let Err(save) = store.save(&mut checkpoint).await {
                    warn!(error = %save, "failed to save checkpoint after stopping");
                }
            }
            warn!(
                error = %e,
                sessions_copied = checkpoint.sessions_copied,
                events_copied = checkpoint.events_copied,
                "backfill stopped before completion"
            );
            return Err(match e {
                e @ StorageError::MigrationIncomplete { .. } => e,
                other => StorageError::MigrationIncomplete {
                    reason: other.to_string(),
                },
            });
        }

        if !self.options.dry_run {
            let _ = store.archive().await?;
        }
        info!(
            dry_run = self.options.dry_run,
            sessions = report.sessions.source_rows,
            events_copied = report.events_copied(),
            elapsed_ms = report.elapsed_ms,
            parity = report.is_parity(),
            "backfill finished"
        );
        Ok(report)
    }

    async fn copy_all(
        &self,
        store: &CheckpointStore,
        checkpoint: &mut MigrationCheckpoint,
        report: &mut BackfillReport,
        bare: bool,
    ) -> Result<()> {
        let range = self.options.range;
        let source = self.source.as_ref();
        let destination = self.destination.as_ref();

        let sessions = self
            .retrying("list_sessions", None, move || source.list_sessions(range))
            .await?;
        report.sessions.source_rows = sessions.len() as u64;

        for record in &sessions {
            self.check_cancelled()?;
            let fresh = !checkpoint.is_completed(record.id);
            let table = self.copy_session(record, store, checkpoint, bare).await?;
            if fresh {
                report.sessions.copied_rows += 1;
            }
            report.tables.push(table);
        }

        if bare {
            return Ok(());
        }
        report.sessions.destination_rows = self
            .retrying("list_sessions", None, move || destination.list_sessions(range))
            .await?
            .len() as u64;

        if self.options.checksums {
            for record in &sessions {
                self.check_cancelled()?;
                if let Some(mismatch) = self.compare_checksums(record.id).await? {
                    warn!(session_id = %record.id, "checksum mismatch after backfill");
                    report.checksum_mismatches.push(mismatch);
                }
            }
        }
        Ok(())
    }

    async fn copy_session(
        &self,
        record: &SessionRecord,
        store: &CheckpointStore,
        checkpoint: &mut MigrationCheckpoint,
        bare: bool,
    ) -> Result<TableCount> {
        let id = record.id;
        let source = self.source.as_ref();
        let destination = self.destination.as_ref();
        let dry_run = self.options.dry_run;

        let mut table = TableCount::new(log_table_name(id));
        table.source_rows = self
            .retrying("session_stats", Some(id), move || source.session_stats(id))
            .await?
            .event_count;

        if checkpoint.is_completed(id) {
            table.destination_rows = self.destination_stats(id).await?.event_count;
            debug!(session_id = %id, "session already copied, skipping");
            return Ok(table);
        }

        // metadata first so end time and soft-delete survive an interruption
        if !dry_run {
            self.retrying("import_session", Some(id), move || {
                destination.import_session(record)
            })
            .await?;
        }

        let existing = if bare {
            SessionStats::default()
        } else {
            self.destination_stats(id).await?
        };
        let mut after = checkpoint.resume_seq(id).max(existing.last_seq);
        let limit = self.options.batch_size.max(1);
        loop {
            self.check_cancelled()?;
            let batch = self
                .retrying("read_after_sequence", Some(id), move || {
                    source.read_after_sequence(id, after, limit)
                })
                .await?;
            let Some(last) = batch.last().map(|e| e.log_seq) else {
                break;
            };
            let n = batch.len() as u64;
            if !dry_run {
                self.append_batch(id, &batch, last).await?;
                checkpoint.batch_committed(id, last, n);
                store.save(checkpoint).await?;
                metrics::counter!(BACKFILL_ROWS_COPIED_TOTAL).increment(n);
            }
            table.copied_rows += n;
            after = Some(last);
            if batch.len() < limit {
                break;
            }
        }

        if dry_run {
            table.destination_rows = existing.event_count;
        } else {
            checkpoint.session_completed(id);
            store.save(checkpoint).await?;
            table.destination_rows = self.destination_stats(id).await?.event_count;
        }
        debug!(
            session_id = %id,
            copied = table.copied_rows,
            source_rows = table.source_rows,
            "session backfilled"
        );
        Ok(table)
    }

    /// Append one batch, treating a conflict as success when an earlier
    /// attempt already committed it.
    async fn append_batch(&self, id: SessionId, batch: &[LogEvent], last: i64) -> Result<()> {
        let destination = self.destination.as_ref();
        match self
            .retrying("append_events", Some(id), move || {
                destination.append_events(id, batch)
            })
            .await
        {
            Err(e @ StorageError::Conflict { .. }) => {
                let stats = self.destination_stats(id).await?;
                if stats.last_seq >= Some(last) {
                    debug!(session_id = %id, last_seq = last, "batch already committed");
                    Ok(())
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    async fn destination_stats(&self, id: SessionId) -> Result<SessionStats> {
        let destination = self.destination.as_ref();
        match self
            .retrying("session_stats", Some(id), move || destination.session_stats(id))
            .await
        {
            Err(StorageError::UnknownSession(_)) => Ok(SessionStats::default()),
            other => other,
        }
    }

    async fn compare_checksums(&self, id: SessionId) -> Result<Option<ChecksumMismatch>> {
        let Some(source) = checksum_of(&self.source, id).await? else {
            return Ok(None);
        };
        let destination = checksum_of(&self.destination, id)
            .await?
            .unwrap_or_else(|| "missing".to_string());
        Ok((source != destination).then_some(ChecksumMismatch {
            session_id: id,
            source,
            destination,
        }))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::MigrationIncomplete {
                reason: "cancelled".into(),
            });
        }
        Ok(())
    }

    /// Retry `op` on transient failures with exponential backoff.
    async fn retrying<T, F, Fut>(
        &self,
        operation: &'static str,
        session_id: Option<SessionId>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retry = &self.options.retry;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry.allows(attempt) => {
                    let delay = retry.delay(attempt, rand::random::<f64>());
                    attempt += 1;
                    warn!(
                        session_id = session_id.map(SessionId::get),
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "backfill step failed, retrying"
                    );
                    metrics::counter!(BACKFILL_BATCH_RETRIES_TOTAL, "operation" => operation)
                        .increment(1);
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(e),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn checksum_of(backend: &Arc<dyn StorageBackend>, id: SessionId) -> Result<Option<String>> {
    match session_checksum(Arc::clone(backend), id).await {
        Ok((_, sum)) => Ok(Some(sum)),
        Err(StorageError::UnknownSession(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_from_settings() {
        let settings = BackfillSettings {
            batch_size: 250,
            max_retries: 2,
            checkpoint_path: "/tmp/cp.json".into(),
            ..BackfillSettings::default()
        };
        let options = BackfillOptions::from(&settings);
        assert_eq!(options.batch_size, 250);
        assert_eq!(options.retry.max_retries, 2);
        assert_eq!(options.checkpoint_path, PathBuf::from("/tmp/cp.json"));
        assert_eq!(options.range, SessionIdRange::all());
        assert!(!options.dry_run);
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        let settings = BackfillSettings {
            batch_size: 0,
            ..BackfillSettings::default()
        };
        assert_eq!(BackfillOptions::from(&settings).batch_size, 1);
    }
}
