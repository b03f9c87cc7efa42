//! Backfill Migrator: offline, checkpointed bulk copy from the legacy store
//! to the central store.
//!
//! Sessions are copied in ascending id order and events in ascending
//! sequence order, `batch_size` events at a time. The resume point for a
//! session is the larger of the checkpoint and the destination's own last
//! sequence, so a re-run without a checkpoint copies nothing twice.

pub mod checkpoint;
pub mod migrator;
pub mod report;

pub use checkpoint::{CheckpointStore, MigrationCheckpoint, SessionProgress};
pub use migrator::{BackfillMigrator, BackfillOptions};
pub use report::{BackfillReport, ChecksumMismatch, TableCount};
