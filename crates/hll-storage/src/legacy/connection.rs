//! Pooled connections to the legacy session file.
//!
//! Every connection handed out by the pool runs in WAL mode with foreign
//! keys on, so readers streaming one session never block a writer appending
//! to another.

use std::path::Path;
use std::time::Duration;

use hll_settings::LegacySettings;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::debug;

use crate::errors::{BackendKind, Result, StorageError};

/// Pool over the legacy file.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Connection checked out of [`ConnectionPool`].
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Pool sizing and lock waiting.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Connections kept by the pool.
    pub pool_size: u32,
    /// How long a statement waits on a locked database before `SQLITE_BUSY`.
    pub busy_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&LegacySettings::default())
    }
}

impl From<&LegacySettings> for ConnectionConfig {
    fn from(settings: &LegacySettings) -> Self {
        Self {
            pool_size: settings.pool_size.max(1),
            busy_timeout_ms: settings.busy_timeout_ms,
        }
    }
}

#[derive(Debug)]
struct SessionFilePragmas {
    busy_timeout: Duration,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for SessionFilePragmas {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.busy_timeout(self.busy_timeout)?;
        // journal_mode answers with the mode it switched to
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        debug!(journal_mode = %mode, "legacy connection opened");
        Ok(())
    }
}

/// Open a pool on the file at `path`, creating the file and its directory
/// when missing.
pub fn new_file(path: &Path, config: &ConnectionConfig) -> Result<ConnectionPool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            StorageError::unavailable(BackendKind::Legacy, format!("{}: {e}", parent.display()))
        })?;
    }
    let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
    let pool = Pool::builder()
        .max_size(config.pool_size)
        // checkout waits at least as long as a statement would
        .connection_timeout(busy_timeout.max(Duration::from_secs(1)))
        .connection_customizer(Box::new(SessionFilePragmas { busy_timeout }))
        .build(SqliteConnectionManager::file(path))?;
    Ok(pool)
}
