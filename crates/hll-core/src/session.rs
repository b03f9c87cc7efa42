//! Session metadata.
//!
//! A session is owned by the session lifecycle manager; the storage subsystem
//! only records it. [`SessionMeta`] is the creation request, [`SessionRecord`]
//! is the stored row including the soft-delete marker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{GuildId, SessionId};

/// Game-server credentials captured when the session started.
///
/// The snapshot is immutable: editing the guild's saved credentials later
/// never rewrites past sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSnapshot {
    /// Id of the saved credentials row, if it still exists.
    pub credentials_id: Option<i64>,
    /// Display name of the server.
    pub name: String,
    /// RCON address.
    pub address: String,
    /// RCON port.
    pub port: u16,
    /// Modifier defaults that were active on the credentials at start time.
    pub default_modifiers: i64,
}

/// Request to create a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    /// Session id, allocated by the caller.
    pub id: SessionId,
    /// Owning guild.
    pub guild_id: GuildId,
    /// Human-readable name.
    pub name: String,
    /// Capture start.
    pub start_time: DateTime<Utc>,
    /// Planned or actual end, `None` for open-ended captures.
    pub end_time: Option<DateTime<Utc>>,
    /// Whether the session was started automatically.
    pub is_auto: bool,
    /// Modifier bitmask.
    pub modifier_flags: i64,
    /// Credential snapshot taken at creation.
    pub credentials: Option<CredentialSnapshot>,
}

/// Stored session row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Session id.
    pub id: SessionId,
    /// Owning guild.
    pub guild_id: GuildId,
    /// Human-readable name.
    pub name: String,
    /// Capture start.
    pub start_time: DateTime<Utc>,
    /// Planned end time, or the actual end once closed.
    pub end_time: Option<DateTime<Utc>>,
    /// Whether `close_session` has been applied. A planned end time given at
    /// creation does not close the session.
    #[serde(default)]
    pub closed: bool,
    /// Whether the session was started automatically.
    pub is_auto: bool,
    /// Modifier bitmask.
    pub modifier_flags: i64,
    /// Credential snapshot taken at creation.
    pub credentials: Option<CredentialSnapshot>,
    /// Soft-delete marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Build the initial record for a freshly created session.
    #[must_use]
    pub fn from_meta(meta: &SessionMeta) -> Self {
        Self {
            id: meta.id,
            guild_id: meta.guild_id,
            name: meta.name.clone(),
            start_time: meta.start_time,
            end_time: meta.end_time,
            closed: false,
            is_auto: meta.is_auto,
            modifier_flags: meta.modifier_flags,
            credentials: meta.credentials.clone(),
            deleted_at: None,
        }
    }

    /// Whether the session has been soft-deleted.
    #[must_use]
    pub fn is_soft_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Timestamp used to decide expiry: the end time, or the start time if open.
    #[must_use]
    pub fn expiry_anchor(&self) -> DateTime<Utc> {
        self.end_time.unwrap_or(self.start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta() -> SessionMeta {
        SessionMeta {
            id: SessionId::new(42),
            guild_id: GuildId::new(1),
            name: "evening scrim".into(),
            start_time: Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap(),
            end_time: None,
            is_auto: false,
            modifier_flags: 0b101,
            credentials: Some(CredentialSnapshot {
                credentials_id: Some(3),
                name: "EU #1".into(),
                address: "10.0.0.1".into(),
                port: 7779,
                default_modifiers: 0,
            }),
        }
    }

    #[test]
    fn record_from_meta_is_not_deleted() {
        let record = SessionRecord::from_meta(&meta());
        assert_eq!(record.id, SessionId::new(42));
        assert_eq!(record.modifier_flags, 0b101);
        assert!(!record.is_soft_deleted());
        assert!(!record.closed);
    }

    #[test]
    fn expiry_anchor_prefers_end_time() {
        let mut record = SessionRecord::from_meta(&meta());
        assert_eq!(record.expiry_anchor(), record.start_time);
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap();
        record.end_time = Some(end);
        assert_eq!(record.expiry_anchor(), end);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(meta()).unwrap();
        assert_eq!(json["guildId"], 1);
        assert_eq!(json["credentials"]["credentialsId"], 3);
        assert!(json.get("guild_id").is_none());
    }
}
