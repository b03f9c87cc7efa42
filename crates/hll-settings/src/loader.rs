//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`StorageSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `HLL_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::StorageSettings;

/// Env var naming an explicit settings file.
pub const SETTINGS_PATH_ENV: &str = "HLL_SETTINGS_PATH";

/// Resolve the settings file path: `$HLL_SETTINGS_PATH`, else `~/.hll/storage.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = read_env_string(SETTINGS_PATH_ENV) {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".hll").join("storage.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<StorageSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a failed validation is
/// an error.
pub fn load_settings_from_path(path: &Path) -> Result<StorageSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    validate(&settings)?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file_layer(path: &Path) -> Result<StorageSettings> {
    let defaults = serde_json::to_value(StorageSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides, reading variables through `lookup`.
///
/// Invalid values are logged and ignored, falling back to file/default.
/// `HLL_STORAGE_MODE` is deliberately absent: the mode controller reads it
/// as a separate priority source.
pub fn apply_env_overrides<F>(settings: &mut StorageSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Central store ───────────────────────────────────────────────
    if let Some(v) = env.string("HLL_DB_URL") {
        settings.central.url = Some(v);
    }
    if let Some(v) = env.u32_range("HLL_DB_POOL_MIN", 0, 1_000) {
        settings.central.pool_min_size = v;
    }
    if let Some(v) = env.u32_range("HLL_DB_POOL_MAX", 1, 1_000) {
        settings.central.pool_max_size = v;
    }
    if let Some(v) = env.u64_range("HLL_DB_ACQUIRE_TIMEOUT_MS", 1, 600_000) {
        settings.central.acquire_timeout_ms = v;
    }
    if let Some(v) = env.u64_range("HLL_DB_STATEMENT_TIMEOUT_MS", 1, 3_600_000) {
        settings.central.statement_timeout_ms = Some(v);
    }

    // ── Legacy store ────────────────────────────────────────────────
    if let Some(v) = env.string("HLL_SQLITE_PATH") {
        settings.legacy.path = v;
    }

    // ── Backfill / audit / logging ──────────────────────────────────
    if let Some(v) = env.u32_range("HLL_BACKFILL_BATCH_SIZE", 1, 1_000_000) {
        settings.backfill.batch_size = v;
    }
    if let Some(v) = env.u64_range("HLL_AUDIT_TOLERANCE", 0, u64::MAX) {
        settings.audit.count_tolerance = v;
    }
    if let Some(v) = env.string("HLL_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("HLL_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Reject settings that cannot work together.
pub fn validate(settings: &StorageSettings) -> Result<()> {
    let central = &settings.central;
    if central.pool_max_size == 0 {
        return Err(invalid("central.poolMaxSize must be greater than 0"));
    }
    if central.pool_min_size > central.pool_max_size {
        return Err(SettingsError::InvalidValue(format!(
            "central.poolMinSize ({}) exceeds central.poolMaxSize ({})",
            central.pool_min_size, central.pool_max_size
        )));
    }
    if settings.legacy.pool_size == 0 {
        return Err(invalid("legacy.poolSize must be greater than 0"));
    }
    if settings.legacy.read_page_size == 0 || central.read_page_size == 0 {
        return Err(invalid("readPageSize must be greater than 0"));
    }
    if settings.backfill.batch_size == 0 {
        return Err(invalid("backfill.batchSize must be greater than 0"));
    }
    if settings.audit.confirmations == 0 {
        return Err(invalid("audit.confirmations must be greater than 0"));
    }
    if settings.audit.interval_secs == 0 {
        return Err(invalid("audit.intervalSecs must be greater than 0"));
    }
    if settings.replication.lane_idle_ms == 0 {
        return Err(invalid("replication.laneIdleMs must be greater than 0"));
    }
    Ok(())
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_string())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u32_range(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        let val = self.string(name)?;
        let result = parse_u32_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
        }
        result
    }

    fn u64_range(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
