//! Stateless repositories over a `rusqlite` connection.
//!
//! Every method takes `&Connection` (or a transaction deref'd to one), so the
//! store decides transaction boundaries.

pub mod log;
pub mod session;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;

pub use log::LogRepo;
pub use session::{SessionRepo, StoredSession};

/// Parse a stored RFC 3339 timestamp, reporting the column on failure.
pub(crate) fn parse_time(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

/// Decode a stored JSON column, reporting the column on failure.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    column: usize,
    raw: &str,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}
