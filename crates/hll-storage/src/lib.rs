//! # hll-storage
//!
//! Durable storage for session logs across a live migration from a
//! single-file SQLite store to a partitioned Postgres store.
//!
//! - **Backends**: [`StorageBackend`], implemented by [`LegacyStore`]
//!   (table per session) and [`CentralStore`] (monthly partitions)
//! - **Modes**: [`ModeController`] holds the active [`BackendState`] and
//!   validates `legacy -> dual -> central` transitions
//! - **Coordinator**: [`DualWriteCoordinator`] is the caller-facing API; it
//!   writes the primary, replicates to the secondary per session in order,
//!   and records failures as divergences
//! - **Audit**: [`ConsistencyAuditor`] compares counts and checksums while
//!   dual-writing
//! - **Backfill**: [`BackfillMigrator`] copies history offline with a
//!   resumable checkpoint
//! - **Service**: [`StorageService`] wires all of the above from settings

#![deny(unsafe_code)]

pub mod audit;
pub mod backend;
pub mod backfill;
pub mod central;
pub mod coordinator;
pub mod errors;
pub mod legacy;
pub mod metrics;
pub mod mode;
pub mod service;

pub use audit::{AuditConfig, AuditReport, ConsistencyAuditor, Mismatch, SessionMismatch};
pub use backend::{
    EventCursor, SessionHandle, SessionStats, StorageBackend, read_events, session_checksum,
    validate_batch,
};
pub use backfill::{BackfillMigrator, BackfillOptions, BackfillReport, MigrationCheckpoint};
pub use central::{CentralStore, PgConnector};
pub use coordinator::{DivergenceLog, DivergenceRecord, DualWriteCoordinator, OperationKind};
pub use errors::{BackendKind, Result, StorageError};
pub use legacy::LegacyStore;
pub use mode::{BackendState, CentralConnector, ModeController, ModeSources};
pub use service::StorageService;
