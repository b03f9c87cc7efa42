//! Central backend: one partitioned Postgres fact table for all sessions.

pub mod partitions;
pub mod pool;
pub mod store;

use std::sync::Arc;

use async_trait::async_trait;
use hll_settings::CentralSettings;

pub use partitions::{MonthKey, PartitionManager};
pub use store::{CentralStore, MIGRATOR};

use crate::backend::StorageBackend;
use crate::errors::Result;
use crate::mode::CentralConnector;

/// [`CentralConnector`] that opens a [`CentralStore`] from settings.
#[derive(Clone, Debug)]
pub struct PgConnector {
    settings: CentralSettings,
}

impl PgConnector {
    /// Connector for the configured central store.
    #[must_use]
    pub fn new(settings: CentralSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl CentralConnector for PgConnector {
    async fn connect(&self) -> Result<Arc<dyn StorageBackend>> {
        let store = CentralStore::connect(&self.settings).await?;
        Ok(Arc::new(store))
    }
}
