//! Common data types for Camera Hub components.
//!
//! Identifiers travel as plain strings on the wire. Server-generated ids are
//! random UUIDs, but any string a client sends back is accepted so that a
//! stale or made-up id surfaces as "not found" rather than a parse error.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a connected signaling client.
    ClientId
);

string_id!(
    /// Unique identifier for a media transport.
    TransportId
);

string_id!(
    /// Unique identifier for a media producer.
    ProducerId
);

string_id!(
    /// Unique identifier for a media consumer.
    ConsumerId
);

/// Kind of media carried by a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Returns the kind as used on the wire and in metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a client transport, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    #[serde(alias = "receive")]
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

/// Role a client registers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Camera client publishing media.
    Streamer,
    /// Monitoring client consuming every streamer's media.
    #[serde(alias = "master")]
    Viewer,
}

impl Role {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Streamer => "streamer",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ClientId::new(), ClientId::new());
        assert_ne!(ProducerId::new().as_str(), ProducerId::new().as_str());
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = TransportId::from("t-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"t-1\"");

        let parsed: TransportId = serde_json::from_str("\"anything goes\"").unwrap();
        assert_eq!(parsed.as_str(), "anything goes");
    }

    #[test]
    fn test_role_accepts_master_alias() {
        let role: Role = serde_json::from_str("\"master\"").unwrap();
        assert_eq!(role, Role::Viewer);
        assert_eq!(serde_json::to_string(&role).unwrap(), "\"viewer\"");
    }

    #[test]
    fn test_direction_accepts_receive_alias() {
        let dir: TransportDirection = serde_json::from_str("\"receive\"").unwrap();
        assert_eq!(dir, TransportDirection::Recv);
    }

    #[test]
    fn test_media_kind_wire_format() {
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
        assert!(serde_json::from_str::<MediaKind>("\"data\"").is_err());
    }
}
