//! Storage modes.
//!
//! The migration from the legacy per-session-table store to the central store
//! moves through three modes: `legacy` (old store only), `dual` (old store
//! authoritative, writes replicated to the central store) and `central`
//! (central store only).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Active backend configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Legacy store only.
    #[default]
    #[serde(alias = "sqlite")]
    Legacy,
    /// Legacy store is primary, central store receives replicated writes.
    Dual,
    /// Central store only.
    #[serde(alias = "postgres")]
    Central,
}

impl StorageMode {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Dual => "dual",
            Self::Central => "central",
        }
    }

    /// Whether the mode needs a reachable central store.
    #[must_use]
    pub const fn requires_central(self) -> bool {
        matches!(self, Self::Dual | Self::Central)
    }

    /// Whether the mode uses the legacy store.
    #[must_use]
    pub const fn uses_legacy(self) -> bool {
        matches!(self, Self::Legacy | Self::Dual)
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognized mode string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown storage mode '{0}' (expected legacy, dual or central)")]
pub struct ParseModeError(pub String);

impl FromStr for StorageMode {
    type Err = ParseModeError;

    /// Case-insensitive. `sqlite` and `postgres` are accepted as aliases for
    /// `legacy` and `central`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" | "sqlite" => Ok(Self::Legacy),
            "dual" => Ok(Self::Dual),
            "central" | "postgres" | "postgresql" => Ok(Self::Central),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}
