//! # hll-backfill
//!
//! Copies session history from the legacy SQLite file into the central
//! Postgres store ahead of dual-write. Safe to interrupt (Ctrl-C stops after
//! the current batch) and to re-run.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use hll_core::{SessionId, SessionIdRange};
use hll_settings::StorageSettings;
use hll_storage::backfill::{BackfillMigrator, BackfillOptions};
use hll_storage::central::pool;
use hll_storage::{CentralStore, LegacyStore, StorageBackend};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Backfill the central store from the legacy store.
#[derive(Parser, Debug)]
#[command(name = "hll-backfill", about = "Backfill session logs from SQLite into Postgres")]
struct Cli {
    /// Legacy `SQLite` file.
    #[arg(long)]
    sqlite_path: Option<PathBuf>,

    /// Postgres connection string (overrides `HLL_DB_URL`).
    #[arg(long)]
    postgres_dsn: Option<String>,

    /// Minimum pooled Postgres connections.
    #[arg(long)]
    pool_min_size: Option<u32>,

    /// Maximum pooled Postgres connections.
    #[arg(long)]
    pool_max_size: Option<u32>,

    /// Per-statement timeout in milliseconds.
    #[arg(long)]
    statement_timeout_ms: Option<u64>,

    /// Events copied per batch.
    #[arg(long)]
    batch_size: Option<u32>,

    /// First session id to copy (inclusive).
    #[arg(long)]
    start_session_id: Option<i64>,

    /// Last session id to copy (inclusive).
    #[arg(long)]
    end_session_id: Option<i64>,

    /// Read and check connectivity without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Compare per-session content checksums after copying.
    #[arg(long)]
    checksums: bool,

    /// Checkpoint file.
    #[arg(long)]
    checkpoint_path: Option<PathBuf>,

    /// Retries per batch for transient failures.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut StorageSettings) {
        if let Some(path) = &self.sqlite_path {
            settings.legacy.path = path.to_string_lossy().into_owned();
        }
        if let Some(dsn) = &self.postgres_dsn {
            settings.central.url = Some(dsn.clone());
        }
        if let Some(n) = self.pool_min_size {
            settings.central.pool_min_size = n;
        }
        if let Some(n) = self.pool_max_size {
            settings.central.pool_max_size = n;
        }
        if let Some(ms) = self.statement_timeout_ms {
            settings.central.statement_timeout_ms = Some(ms);
        }
        if let Some(n) = self.batch_size {
            settings.backfill.batch_size = n;
        }
        if let Some(path) = &self.checkpoint_path {
            settings.backfill.checkpoint_path = path.to_string_lossy().into_owned();
        }
        if let Some(n) = self.max_retries {
            settings.backfill.max_retries = n;
        }
    }

    fn range(&self) -> SessionIdRange {
        SessionIdRange {
            start: self.start_session_id.map(SessionId::new),
            end: self.end_session_id.map(SessionId::new),
        }
    }
}

async fn open_central(settings: &StorageSettings, dry_run: bool) -> Result<CentralStore> {
    let page = settings.central.read_page_size as usize;
    if dry_run {
        // no migrations or partition DDL
        let pool = pool::connect(&settings.central)
            .await
            .context("Failed to connect to Postgres")?;
        return Ok(CentralStore::from_pool(pool).with_read_page_size(page));
    }
    CentralStore::connect(&settings.central)
        .await
        .context("Failed to open central store")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = hll_settings::load_settings().context("Failed to load settings")?;
    cli.apply(&mut settings);
    hll_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    hll_settings::validate(&settings).context("Invalid settings")?;

    if settings.central.url.as_deref().is_none_or(|u| u.trim().is_empty()) {
        bail!("no Postgres connection string: pass --postgres-dsn or set HLL_DB_URL");
    }
    let range = cli.range();
    if let (Some(start), Some(end)) = (range.start, range.end) {
        if start > end {
            bail!("--start-session-id {start} is after --end-session-id {end}");
        }
    }

    let legacy = LegacyStore::open(&settings.legacy)
        .with_context(|| format!("Failed to open legacy store {}", settings.legacy.path))?;
    let central = open_central(&settings, cli.dry_run).await?;

    let options = BackfillOptions {
        range,
        dry_run: cli.dry_run,
        checksums: cli.checksums,
        ..BackfillOptions::from(&settings.backfill)
    };
    info!(
        source = %settings.legacy.path,
        batch_size = options.batch_size,
        dry_run = options.dry_run,
        checkpoint = %options.checkpoint_path.display(),
        "starting backfill"
    );

    let cancel = CancellationToken::new();
    let _ = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping after the current batch");
                cancel.cancel();
            }
        }
    });

    let source: Arc<dyn StorageBackend> = Arc::new(legacy);
    let destination: Arc<dyn StorageBackend> = Arc::new(central);
    let report = BackfillMigrator::new(source, destination, options)
        .with_cancellation(cancel)
        .run()
        .await
        .context("Backfill did not complete; re-run to resume from the checkpoint")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }

    if !report.dry_run && !report.is_parity() {
        bail!("backfill finished without parity");
    }
    Ok(())
}
