//! Common data types shared by the call coordinator crates.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Identity of one participating device: a `(user_id, device_id)` pair.
///
/// Ordering compares `user_id` first and `device_id` second, both as plain
/// strings. The ordering is total and is used as the primary tie-break key
/// when deciding which side of a pair initiates a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParticipantId {
    /// Account identifier.
    pub user_id: String,
    /// Device identifier within the account.
    pub device_id: String,
}

impl ParticipantId {
    /// Create a participant identity.
    #[must_use]
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl Ord for ParticipantId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_id
            .cmp(&other.user_id)
            .then_with(|| self.device_id.cmp(&other.device_id))
    }
}

impl PartialOrd for ParticipantId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.user_id, self.device_id)
    }
}

/// Identifier of the room whose state channel carries the call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a group call within a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub String);

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-entry membership session identifier.
///
/// A fresh value is minted every time a device creates a call session, so it
/// distinguishes two registrations of the same device identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a new random session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_ordering_is_user_then_device() {
        let a1 = ParticipantId::new("a", "DEV1");
        let a2 = ParticipantId::new("a", "DEV2");
        let b1 = ParticipantId::new("b", "DEV0");

        assert!(a1 < a2);
        assert!(a2 < b1);
        assert_eq!(a1.cmp(&a1.clone()), Ordering::Equal);
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_display_formats() {
        let id = ParticipantId::new("@alice:example.org", "PHONE");
        assert_eq!(id.to_string(), "@alice:example.org|PHONE");
        assert_eq!(RoomId::from("!room").to_string(), "!room");
    }
}
