//! Monthly range partitions of `session_logs`.
//!
//! Partitions are named `session_logs_YYYY_MM` and cover
//! `[first day of month, first day of next month)`. The manager remembers
//! which partitions it has seen, so the write path only issues DDL the first
//! time a month shows up in this process.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Datelike, TimeZone, Utc};
use hll_core::LogEvent;
use hll_core::events::format_event_time;
use parking_lot::Mutex;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::errors::Result;

const PARTITION_PREFIX: &str = "session_logs_";

/// A calendar month in UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthKey {
    year: i32,
    month: u32,
}

impl MonthKey {
    /// Build a key; `None` unless `month` is 1..=12.
    #[must_use]
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    /// Month containing `t`.
    #[must_use]
    pub fn from_datetime(t: &DateTime<Utc>) -> Self {
        Self {
            year: t.year(),
            month: t.month(),
        }
    }

    /// Year.
    #[must_use]
    pub const fn year(self) -> i32 {
        self.year
    }

    /// Month, 1..=12.
    #[must_use]
    pub const fn month(self) -> u32 {
        self.month
    }

    /// The following month.
    #[must_use]
    pub const fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Midnight UTC on the first day of the month.
    #[must_use]
    pub fn start(self) -> DateTime<Utc> {
        // month is always 1..=12, so the date exists
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Partition table name.
    #[must_use]
    pub fn partition_name(self) -> String {
        format!("{PARTITION_PREFIX}{:04}_{:02}", self.year, self.month)
    }

    /// Inverse of [`Self::partition_name`].
    #[must_use]
    pub fn from_partition_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(PARTITION_PREFIX)?;
        let (year, month) = rest.split_once('_')?;
        Self::new(year.parse().ok()?, month.parse().ok()?)
    }
}

/// Creates and drops monthly partitions, caching the ones known to exist.
#[derive(Debug, Default)]
pub struct PartitionManager {
    known: Mutex<HashSet<MonthKey>>,
}

impl PartitionManager {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the partition for `month` is known to exist.
    pub fn is_known(&self, month: MonthKey) -> bool {
        self.known.lock().contains(&month)
    }

    /// Make sure the partition for `month` exists. Returns `true` if DDL ran.
    pub async fn ensure(&self, pool: &PgPool, month: MonthKey) -> Result<bool> {
        if self.is_known(month) {
            return Ok(false);
        }
        let name = month.partition_name();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {name} PARTITION OF session_logs \
             FOR VALUES FROM ('{}') TO ('{}')",
            format_event_time(&month.start()),
            format_event_time(&month.next().start()),
        );
        if let Err(err) = sqlx::query(&sql).execute(pool).await {
            // Another writer may have created it between our check and the DDL.
            let existing: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
                .bind(&name)
                .fetch_one(pool)
                .await?;
            if existing.is_none() {
                return Err(err.into());
            }
        }
        debug!(partition = %name, "partition ready");
        let _ = self.known.lock().insert(month);
        Ok(true)
    }

    /// Ensure a partition for every month touched by `events`.
    pub async fn ensure_for_events(&self, pool: &PgPool, events: &[LogEvent]) -> Result<()> {
        let months: BTreeSet<MonthKey> = events
            .iter()
            .map(|e| MonthKey::from_datetime(&e.event_time))
            .filter(|m| !self.is_known(*m))
            .collect();
        for month in months {
            let _ = self.ensure(pool, month).await?;
        }
        Ok(())
    }

    /// Create the partition for `now` plus the next `ahead` months.
    pub async fn precreate(
        &self,
        pool: &PgPool,
        now: DateTime<Utc>,
        ahead: u32,
    ) -> Result<Vec<MonthKey>> {
        let mut month = MonthKey::from_datetime(&now);
        let mut months = Vec::with_capacity(ahead as usize + 1);
        for _ in 0..=ahead {
            let _ = self.ensure(pool, month).await?;
            months.push(month);
            month = month.next();
        }
        Ok(months)
    }

    /// Drop every partition covering months strictly before `cutoff`.
    pub async fn drop_before(&self, pool: &PgPool, cutoff: MonthKey) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT c.relname::text
             FROM pg_inherits i
             JOIN pg_class c ON c.oid = i.inhrelid
             JOIN pg_class p ON p.oid = i.inhparent
             WHERE p.relname = 'session_logs'
             ORDER BY c.relname",
        )
        .fetch_all(pool)
        .await?;

        let mut dropped = Vec::new();
        for name in names {
            let Some(month) = MonthKey::from_partition_name(&name) else {
                continue;
            };
            if month >= cutoff {
                continue;
            }
            let _ = sqlx::query(&format!("DROP TABLE IF EXISTS {}", month.partition_name()))
                .execute(pool)
                .await?;
            let _ = self.known.lock().remove(&month);
            dropped.push(name);
        }
        if !dropped.is_empty() {
            info!(count = dropped.len(), cutoff = %cutoff.partition_name(), "dropped expired partitions");
        }
        Ok(dropped)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
