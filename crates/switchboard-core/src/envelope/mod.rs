//! The routed message unit.
//!
//! An [`Envelope`] is what travels over every WebSocket in both directions:
//!
//! ```json
//! { "action": "create", "collection": "Message", "response": { ... },
//!   "channelType": "room", "channelId": "7", "httpRequest": true }
//! ```
//!
//! Fields are private; once built an envelope is only ever borrowed, so the
//! payload seen by every recipient of a routing pass is identical. Unknown
//! top-level fields sent by clients are kept and re-emitted verbatim.

pub mod codec;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{ChannelKey, Principal};

/// Collection whose envelopes are only ever delivered to their owner.
pub const USER_META_COLLECTION: &str = "usersmeta";

/// What happened, or what the client asks for.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    /// A document was created.
    Create,
    /// A document was updated.
    Update,
    /// A document was deleted.
    Delete,
    /// Membership command: add the sending connection to a channel.
    Join,
    /// Membership command: remove the sending connection from a channel.
    Leave,
    /// Any other application-defined action, forwarded untouched.
    Custom(String),
}

impl Action {
    /// Wire name of the action.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Custom(name) => name,
        }
    }

    /// Whether this action is a channel-membership command.
    pub fn is_membership(&self) -> bool {
        matches!(self, Self::Join | Self::Leave)
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        match s.as_str() {
            "create" => Self::Create,
            "update" => Self::Update,
            "delete" => Self::Delete,
            "join" => Self::Join,
            "leave" => Self::Leave,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        Self::from(s.to_owned())
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Custom(name) => name,
            other => other.as_str().to_owned(),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A routed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    action: Action,
    #[serde(default)]
    collection: String,
    #[serde(default)]
    response: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel_type: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel_id: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    http_request: bool,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Envelope {
    /// Build an envelope with no routing hint.
    pub fn new(action: impl Into<Action>, collection: impl Into<String>, response: Value) -> Self {
        Self {
            action: action.into(),
            collection: collection.into(),
            response,
            channel_type: None,
            channel_id: None,
            http_request: false,
            extra: Map::new(),
        }
    }

    /// Build the envelope for a document-API mutation.
    pub fn from_http_request(
        action: impl Into<Action>,
        collection: impl Into<String>,
        document: Value,
    ) -> Self {
        Self {
            http_request: true,
            ..Self::new(action, collection, document)
        }
    }

    /// Attach an explicit top-level channel hint.
    #[must_use]
    pub fn with_channel(mut self, key: &ChannelKey) -> Self {
        self.channel_type = Some(Value::String(key.channel_type.clone()));
        self.channel_id = Some(Value::String(key.channel_id.clone()));
        self
    }

    /// The action.
    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Name of the logical resource type.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The opaque payload, typically the affected document.
    pub fn response(&self) -> &Value {
        &self.response
    }

    /// Whether the envelope came from the document API rather than a client.
    pub fn is_http_request(&self) -> bool {
        self.http_request
    }

    /// Whether this envelope carries per-user private data.
    pub fn is_user_meta(&self) -> bool {
        self.collection == USER_META_COLLECTION
    }

    /// Owner named by `response.userId`, used for owner-targeted delivery.
    pub fn owner(&self) -> Option<Principal> {
        self.response.get("userId").and_then(Principal::from_json)
    }

    /// Resolve the channel this envelope is addressed to.
    ///
    /// The top-level `channelType`/`channelId` pair is used when both parts
    /// are present; otherwise the same pair nested in `response` is tried.
    /// The two parts are never mixed across locations.
    pub fn channel_key(&self) -> Option<ChannelKey> {
        ChannelKey::from_json(self.channel_type.as_ref(), self.channel_id.as_ref()).or_else(|| {
            ChannelKey::from_json(
                self.response.get("channelType"),
                self.response.get("channelId"),
            )
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
