//! Integer ID newtypes.
//!
//! Sessions are keyed by the integer id the legacy store assigned them, and
//! that id is preserved verbatim in the central store. Wrapping it prevents
//! passing a guild id where a session id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! integer_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw integer id.
            #[must_use]
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Return the raw integer id.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map(Self)
            }
        }
    };
}

integer_id!(
    /// Unique session identifier.
    SessionId
);

integer_id!(
    /// Chat-platform guild (owner) identifier.
    GuildId
);

/// Inclusive range of session ids. Open ends are unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionIdRange {
    /// First id to include.
    pub start: Option<SessionId>,
    /// Last id to include.
    pub end: Option<SessionId>,
}

impl SessionIdRange {
    /// Range covering every session.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// Whether `id` falls inside the range.
    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.start.is_none_or(|s| id >= s) && self.end.is_none_or(|e| id <= e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let id = SessionId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(" 42 ".parse::<SessionId>().unwrap(), id);
        assert!("forty-two".parse::<SessionId>().is_err());
    }

    #[test]
    fn serde_is_transparent() {
        let json = serde_json::to_string(&SessionId::new(7)).unwrap();
        assert_eq!(json, "7");
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(), 7);
    }

    #[test]
    fn ordering_follows_raw_value() {
        assert!(SessionId::new(1) < SessionId::new(2));
    }

    #[test]
    fn range_contains() {
        let range = SessionIdRange {
            start: Some(SessionId::new(10)),
            end: Some(SessionId::new(20)),
        };
        assert!(range.contains(SessionId::new(10)));
        assert!(range.contains(SessionId::new(20)));
        assert!(!range.contains(SessionId::new(9)));
        assert!(!range.contains(SessionId::new(21)));
        assert!(SessionIdRange::all().contains(SessionId::new(i64::MIN)));
    }
}
