//! Log event model.
//!
//! A [`LogEvent`] is one immutable record of something that happened on the
//! game server during a session. Events are identified inside their session by
//! `(event_time, log_seq)`; `log_seq` is strictly increasing per session and
//! breaks ties between identical timestamps.
//!
//! Timestamps are kept at microsecond precision, the resolution both backends
//! store, so an event read back compares equal to the event written.

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Event type discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Player killed an enemy.
    Kill,
    /// Player killed a teammate.
    TeamKill,
    /// Player joined the server.
    Connect,
    /// Player left the server.
    Disconnect,
    /// Player changed team.
    TeamSwitch,
    /// Player changed squad.
    SquadSwitch,
    /// Player changed role.
    RoleChange,
    /// Squad leader changed.
    SquadLeaderChange,
    /// Chat message.
    Chat,
    /// Administrative action (kick, ban, broadcast).
    Admin,
    /// Periodic score snapshot for a player.
    ScoreUpdate,
    /// Objective captured.
    ObjectiveCapture,
    /// Match started.
    MatchStart,
    /// Match ended.
    MatchEnd,
    /// Map changed.
    MapChange,
}

impl EventType {
    /// Every variant, in declaration order.
    pub const ALL: [Self; 15] = [
        Self::Kill,
        Self::TeamKill,
        Self::Connect,
        Self::Disconnect,
        Self::TeamSwitch,
        Self::SquadSwitch,
        Self::RoleChange,
        Self::SquadLeaderChange,
        Self::Chat,
        Self::Admin,
        Self::ScoreUpdate,
        Self::ObjectiveCapture,
        Self::MatchStart,
        Self::MatchEnd,
        Self::MapChange,
    ];

    /// Stable string form, as stored in both backends.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Kill => "kill",
            Self::TeamKill => "team_kill",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::TeamSwitch => "team_switch",
            Self::SquadSwitch => "squad_switch",
            Self::RoleChange => "role_change",
            Self::SquadLeaderChange => "squad_leader_change",
            Self::Chat => "chat",
            Self::Admin => "admin",
            Self::ScoreUpdate => "score_update",
            Self::ObjectiveCapture => "objective_capture",
            Self::MatchStart => "match_start",
            Self::MatchEnd => "match_end",
            Self::MapChange => "map_change",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stored event type string is not recognized.
#[derive(Debug, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// Score breakdown attached to a player at the time of the event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerScore {
    /// Combat points.
    pub combat: i32,
    /// Offense points.
    pub offense: i32,
    /// Defense points.
    pub defense: i32,
    /// Support points.
    pub support: i32,
}

/// A player referenced by an event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRef {
    /// In-game name.
    pub name: String,
    /// Platform id (Steam64 or similar).
    pub id: String,
    /// Team name, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    /// Role, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Score snapshot, if the event carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<PlayerScore>,
}

/// Structured event payload.
///
/// All fields are optional; which ones are set depends on the event type
/// (a kill carries both players and a weapon, a chat message carries one
/// player and the message text).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    /// Acting player.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerRef>,
    /// Second player (victim, previous squad leader).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player2: Option<PlayerRef>,
    /// Weapon used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weapon: Option<String>,
    /// Previous value for switch events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    /// New value for switch events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
    /// Team the event is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
    /// Squad the event is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squad_name: Option<String>,
    /// Free text (chat message, admin reason, match score).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LogPayload {
    /// Canonical JSON form. Field order is fixed by the struct, so equal
    /// payloads always produce identical strings.
    pub fn to_canonical_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// One immutable log record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// When the event happened on the server.
    pub event_time: DateTime<Utc>,
    /// Per-session sequence number.
    pub log_seq: i64,
    /// Event discriminator.
    pub event_type: EventType,
    /// Structured payload.
    pub payload: LogPayload,
}

impl LogEvent {
    /// Build an event, truncating the timestamp to microseconds.
    #[must_use]
    pub fn new(
        event_time: DateTime<Utc>,
        log_seq: i64,
        event_type: EventType,
        payload: LogPayload,
    ) -> Self {
        Self {
            event_time: truncate_to_micros(event_time),
            log_seq,
            event_type,
            payload,
        }
    }

    /// Ordering key used by reads.
    #[must_use]
    pub fn sort_key(&self) -> (DateTime<Utc>, i64) {
        (self.event_time, self.log_seq)
    }
}

/// Drop sub-microsecond precision.
#[must_use]
pub fn truncate_to_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = t.nanosecond();
    t.with_nanosecond(nanos - nanos % 1_000).unwrap_or(t)
}

/// Fixed-width RFC 3339 form (`2024-03-01T18:00:00.000000Z`).
///
/// Lexicographic order of this form equals chronological order, which the
/// legacy store relies on for its `event_time` index.
#[must_use]
pub fn format_event_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Filter for reading a session's events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventRange {
    /// Inclusive lower bound on `event_time`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `event_time`.
    pub to: Option<DateTime<Utc>>,
    /// Restrict to these types; empty means all.
    pub event_types: Vec<EventType>,
}

impl EventRange {
    /// Every event of the session.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether an event passes the filter.
    #[must_use]
    pub fn matches(&self, event: &LogEvent) -> bool {
        self.from.is_none_or(|f| event.event_time >= f)
            && self.to.is_none_or(|t| event.event_time < t)
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_type_string_forms_round_trip() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let err = "teleport".parse::<EventType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown event type: teleport");
    }

    #[test]
    fn timestamps_are_truncated_to_micros() {
        let t = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let event = LogEvent::new(t, 1, EventType::Chat, LogPayload::default());
        assert_eq!(event.event_time.nanosecond(), 123_456_000);
    }

    #[test]
    fn formatted_time_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let b = Utc.timestamp_opt(a.timestamp(), 5_000).unwrap();
        assert_eq!(format_event_time(&a), "2024-03-01T09:00:00.000000Z");
        assert!(format_event_time(&a) < format_event_time(&b));
    }

    #[test]
    fn canonical_json_omits_empty_fields() {
        let payload = LogPayload {
            message: Some("gg".into()),
            ..Default::default()
        };
        assert_eq!(payload.to_canonical_json().unwrap(), r#"{"message":"gg"}"#);
    }

    #[test]
    fn range_filters_by_time_and_type() {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let event = LogEvent::new(base, 1, EventType::Kill, LogPayload::default());

        assert!(EventRange::all().matches(&event));
        assert!(
            EventRange {
                from: Some(base),
                ..Default::default()
            }
            .matches(&event)
        );
        assert!(
            !EventRange {
                to: Some(base),
                ..Default::default()
            }
            .matches(&event)
        );
        assert!(
            !EventRange {
                event_types: vec![EventType::Chat],
                ..Default::default()
            }
            .matches(&event)
        );
    }
}
