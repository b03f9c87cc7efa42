//! Legacy backend: one SQLite file, one log table per session.

pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod store;

pub use connection::{ConnectionConfig, ConnectionPool};
pub use repositories::log::log_table_name;
pub use store::LegacyStore;
