//! Identifier newtypes.
//!
//! Connections get a fresh UUID v7 when they are admitted. Principals come
//! from the session store and are treated as opaque strings. Channels are a
//! composite `(type, id)` key with no storage of their own.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

string_id! {
    /// Unique identifier for a live connection.
    ConnectionId
}

string_id! {
    /// Authenticated user identity. One principal may own many connections.
    Principal
}

impl ConnectionId {
    /// Create a new random ID (UUID v7, time-ordered).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Principal {
    /// Read a principal out of a JSON value.
    ///
    /// Strings are taken as-is (empty strings are rejected) and integers are
    /// rendered in decimal, so `"42"` and `42` name the same user.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        json_scalar(value).map(Self)
    }
}

/// A named broadcast group, keyed by `(channel_type, channel_id)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelKey {
    /// Kind of channel (e.g. `"room"`).
    pub channel_type: String,
    /// Identifier within the kind (e.g. `"7"`).
    pub channel_id: String,
}

impl ChannelKey {
    /// Build a key from its two parts.
    pub fn new(channel_type: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            channel_type: channel_type.into(),
            channel_id: channel_id.into(),
        }
    }

    /// Build a key from two JSON values, if both are usable.
    ///
    /// Accepts non-empty strings and integers; anything else (null, empty
    /// string, objects, floats) means "no channel".
    pub fn from_json(
        channel_type: Option<&serde_json::Value>,
        channel_id: Option<&serde_json::Value>,
    ) -> Option<Self> {
        let channel_type = json_scalar(channel_type?)?;
        let channel_id = json_scalar(channel_id?)?;
        Some(Self {
            channel_type,
            channel_id,
        })
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.channel_type, self.channel_id)
    }
}

fn json_scalar(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
