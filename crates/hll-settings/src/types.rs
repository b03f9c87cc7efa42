//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`: a settings
//! file may set any subset of fields and the rest keep their defaults.

use hll_core::StorageMode;
use serde::{Deserialize, Serialize};

/// Root settings for the storage subsystem.
///
/// ```json
/// {
///   "mode": "dual",
///   "central": { "url": "postgres://hll@db/hll", "poolMaxSize": 20 },
///   "audit": { "countTolerance": 50 }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Persisted storage mode. Lowest-priority mode source after the default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<StorageMode>,
    /// Legacy SQLite store.
    pub legacy: LegacySettings,
    /// Central Postgres store.
    pub central: CentralSettings,
    /// Secondary-write replication during dual mode.
    pub replication: ReplicationSettings,
    /// Consistency auditor.
    pub audit: AuditSettings,
    /// Backfill migrator.
    pub backfill: BackfillSettings,
    /// Logging output.
    pub logging: LoggingSettings,
}

/// Legacy store settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegacySettings {
    /// Path of the SQLite database file.
    pub path: String,
    /// Connection pool size.
    pub pool_size: u32,
    /// SQLite `busy_timeout` in milliseconds.
    pub busy_timeout_ms: u64,
    /// Rows fetched per page by streaming reads.
    pub read_page_size: u32,
}

impl Default for LegacySettings {
    fn default() -> Self {
        Self {
            path: "sessions.db".to_string(),
            pool_size: 4,
            busy_timeout_ms: 5_000,
            read_page_size: 500,
        }
    }
}

/// Central store settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CentralSettings {
    /// Postgres connection string. Unset means the central store is unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Minimum pooled connections.
    pub pool_min_size: u32,
    /// Maximum pooled connections.
    pub pool_max_size: u32,
    /// How long a caller waits for a pooled connection.
    pub acquire_timeout_ms: u64,
    /// Per-statement timeout; `None` leaves the server default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_timeout_ms: Option<u64>,
    /// Monthly partitions created ahead of the current month at connect.
    pub precreate_months: u32,
    /// Rows fetched per page by streaming reads.
    pub read_page_size: u32,
    /// Apply pending schema migrations at connect.
    pub run_migrations: bool,
}

impl Default for CentralSettings {
    fn default() -> Self {
        Self {
            url: None,
            pool_min_size: 1,
            pool_max_size: 10,
            acquire_timeout_ms: 5_000,
            statement_timeout_ms: None,
            precreate_months: 1,
            read_page_size: 1_000,
            run_migrations: true,
        }
    }
}

/// Replication settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplicationSettings {
    /// Queued secondary writes above which a warning is logged.
    pub backlog_warn_threshold: usize,
    /// Upper bound on waiting for the queue to empty at shutdown.
    pub drain_timeout_ms: u64,
    /// Retries of a transiently failing secondary write before it is
    /// recorded as a divergence.
    pub max_retries: u32,
    /// First retry delay in milliseconds.
    pub base_delay_ms: u64,
    /// Retry delay ceiling in milliseconds.
    pub max_delay_ms: u64,
    /// A session lane with nothing queued for this long is released.
    pub lane_idle_ms: u64,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            backlog_warn_threshold: 25,
            drain_timeout_ms: 30_000,
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            lane_idle_ms: 60_000,
        }
    }
}

/// Auditor settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditSettings {
    /// Run the periodic auditor while in dual mode.
    pub enabled: bool,
    /// Seconds between audit runs.
    pub interval_secs: u64,
    /// Allowed event-count difference per session.
    pub count_tolerance: u64,
    /// Consecutive runs a mismatch must persist before alerting.
    pub confirmations: u32,
    /// Compare content checksums when counts agree.
    pub checksums: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            count_tolerance: 0,
            confirmations: 2,
            checksums: false,
        }
    }
}

/// Backfill settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackfillSettings {
    /// Rows per copied batch.
    pub batch_size: u32,
    /// Retries per batch for transient failures.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_delay_ms: u64,
    /// Checkpoint file location.
    pub checkpoint_path: String,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            checkpoint_path: "backfill.checkpoint.json".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
