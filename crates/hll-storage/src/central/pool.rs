//! Bounded `sqlx` connection pool for the central store.

use std::str::FromStr;
use std::time::Duration;

use hll_settings::CentralSettings;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::info;

use crate::errors::{BackendKind, Result, StorageError};

/// Connection string from settings, rejecting unset or blank values.
pub fn connection_url(settings: &CentralSettings) -> Result<&str> {
    settings
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| {
            StorageError::unavailable(BackendKind::Central, "central connection string is not set")
        })
}

/// Connect options with the per-statement timeout applied at session start.
pub fn connect_options(settings: &CentralSettings) -> Result<PgConnectOptions> {
    let mut options = PgConnectOptions::from_str(connection_url(settings)?)?;
    if let Some(ms) = settings.statement_timeout_ms {
        options = options.options([("statement_timeout", ms.to_string())]);
    }
    Ok(options)
}

/// Open the pool. Callers wait up to `acquire_timeout_ms` for a connection
/// when all `pool_max_size` connections are busy.
pub async fn connect(settings: &CentralSettings) -> Result<PgPool> {
    let options = connect_options(settings)?;
    let pool = PgPoolOptions::new()
        .min_connections(settings.pool_min_size)
        .max_connections(settings.pool_max_size)
        .acquire_timeout(Duration::from_millis(settings.acquire_timeout_ms))
        .connect_with(options)
        .await?;
    info!(
        min = settings.pool_min_size,
        max = settings.pool_max_size,
        statement_timeout_ms = settings.statement_timeout_ms,
        "central pool connected"
    );
    Ok(pool)
}
