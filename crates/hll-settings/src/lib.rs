//! # hll-settings
//!
//! Layered configuration for the session log storage subsystem.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`StorageSettings::default()`]
//! 2. **Settings file**: `$HLL_SETTINGS_PATH` or `~/.hll/storage.json` (deep-merged over defaults)
//! 3. **Environment variables**: `HLL_*` overrides (highest priority)
//!
//! The storage mode is the exception: the settings file only provides the
//! persisted mode; the `HLL_STORAGE_MODE` env var and runtime overrides are
//! resolved by the mode controller in `hll-storage`.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path,
    validate,
};
pub use types::*;
