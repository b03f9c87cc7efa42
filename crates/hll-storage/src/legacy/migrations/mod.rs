//! Ordered schema scripts for the legacy file.
//!
//! The applied version lives in `PRAGMA user_version`. Each script and the
//! version bump commit together, so an interrupted upgrade leaves the file
//! at the previous version. Scripts run when the store opens, before any
//! session operation is served.

use rusqlite::{Connection, TransactionBehavior};
use tracing::info;

use crate::errors::{BackendKind, Result, StorageError};

/// Embedded scripts; index `n` upgrades the file from version `n` to `n + 1`.
const SCRIPTS: &[(&str, &str)] = &[(
    "sessions and retired session ids",
    include_str!("v001_schema.sql"),
)];

/// Schema version this build writes.
pub fn latest_version() -> u32 {
    SCRIPTS.len() as u32
}

/// Version recorded in the file, 0 for a fresh file.
pub fn current_version(conn: &Connection) -> Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| schema_error(format!("cannot read user_version: {e}")))
}

/// Bring the file up to [`latest_version`]. Returns the number of scripts run.
pub fn run_migrations(conn: &mut Connection) -> Result<u32> {
    let from = current_version(conn)?;
    if from > latest_version() {
        return Err(schema_error(format!(
            "file is at schema v{from}, newer than supported v{}",
            latest_version()
        )));
    }

    for (index, (description, sql)) in SCRIPTS.iter().enumerate().skip(from as usize) {
        let version = index as u32 + 1;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        tx.execute_batch(sql)
            .map_err(|e| schema_error(format!("v{version} ({description}): {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!(version, description, "legacy schema upgraded");
    }
    Ok(latest_version() - from)
}

fn schema_error(message: String) -> StorageError {
    StorageError::unavailable(BackendKind::Legacy, format!("schema: {message}"))
}
