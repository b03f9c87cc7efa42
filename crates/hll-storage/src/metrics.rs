//! Metric names recorded through the `metrics` facade.
//!
//! The library never installs a recorder; the embedding process chooses the
//! exporter. Without one every call is a no-op.

use std::time::Instant;

use crate::errors::{BackendKind, Result};

/// Storage operations (counter, labels: operation, backend, outcome).
pub const STORAGE_OPERATIONS_TOTAL: &str = "storage_operations_total";
/// Storage operation latency (histogram, labels: operation, backend).
pub const STORAGE_OPERATION_DURATION_SECONDS: &str = "storage_operation_duration_seconds";
/// Secondary writes that failed during dual mode (counter, labels: operation, backend).
pub const STORAGE_DIVERGENCE_TOTAL: &str = "storage_divergence_total";
/// Secondary writes retried after transient failures (counter, labels: operation, backend).
pub const STORAGE_REPLICATION_RETRIES_TOTAL: &str = "storage_replication_retries_total";
/// Queued secondary writes (gauge).
pub const STORAGE_REPLICATION_BACKLOG: &str = "storage_replication_backlog";
/// Confirmed audit mismatches (counter, labels: kind).
pub const AUDIT_MISMATCHES_TOTAL: &str = "audit_mismatches_total";
/// Completed audit runs (counter).
pub const AUDIT_RUNS_TOTAL: &str = "audit_runs_total";
/// Events copied by backfill (counter).
pub const BACKFILL_ROWS_COPIED_TOTAL: &str = "backfill_rows_copied_total";
/// Backfill retries after transient failures (counter).
pub const BACKFILL_BATCH_RETRIES_TOTAL: &str = "backfill_batch_retries_total";

/// Record outcome and latency of one backend call.
pub(crate) fn observe<T>(
    operation: &'static str,
    backend: BackendKind,
    started: Instant,
    result: &Result<T>,
) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::counter!(
        STORAGE_OPERATIONS_TOTAL,
        "operation" => operation,
        "backend" => backend.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(
        STORAGE_OPERATION_DURATION_SECONDS,
        "operation" => operation,
        "backend" => backend.as_str()
    )
    .record(started.elapsed().as_secs_f64());
}
