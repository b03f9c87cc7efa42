//! # hll-core
//!
//! Foundation types shared by every crate of the session log storage subsystem.
//!
//! - **IDs**: [`SessionId`] and [`GuildId`] newtypes over the integer keys used by both backends
//! - **Sessions**: [`SessionMeta`] (what a caller creates) and [`SessionRecord`] (what a backend stores)
//! - **Events**: [`LogEvent`], the [`EventType`] discriminator and its structured [`LogPayload`]
//! - **Modes**: [`StorageMode`], the three backend configurations of a migration
//! - **Retry**: exponential backoff math used by the backfill job
//! - **Logging**: `tracing` subscriber setup and a capture layer for tests

#![deny(unsafe_code)]

pub mod events;
pub mod ids;
pub mod logging;
pub mod mode;
pub mod retry;
pub mod session;

pub use events::{EventRange, EventType, LogEvent, LogPayload, PlayerRef, PlayerScore};
pub use ids::{GuildId, SessionId, SessionIdRange};
pub use mode::{ParseModeError, StorageMode};
pub use retry::RetryConfig;
pub use session::{CredentialSnapshot, SessionMeta, SessionRecord};
