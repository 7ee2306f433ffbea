//! JSON frames exchanged with chat clients.
//!
//! Inbound: `{"condition": "...", "message": "...", "user_name": "..."}`.
//! Outbound: `{"condition": "...", "message": "...", "message_type": "...",
//! "connected_user": [...]}`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::HubError;

/// What an inbound frame asks the hub to do.
///
/// Unrecognized values are kept verbatim in [`Condition::Unknown`] so the
/// dispatcher can log and drop them instead of failing the whole frame.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Condition {
    /// Set or change the sender's display name.
    Username,
    /// Relay a chat line to everyone.
    SendMessage,
    /// The sender is leaving.
    ServerOffline,
    Unknown(String),
}

impl Condition {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Username => "username",
            Self::SendMessage => "sendMessage",
            Self::ServerOffline => "serveroffline",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::Unknown(String::new())
    }
}

impl From<&str> for Condition {
    fn from(raw: &str) -> Self {
        match raw {
            "username" => Self::Username,
            "sendMessage" => Self::SendMessage,
            "serveroffline" => Self::ServerOffline,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl From<String> for Condition {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "username" | "sendMessage" | "serveroffline" => Self::from(raw.as_str()),
            _ => Self::Unknown(raw),
        }
    }
}

impl From<Condition> for String {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Unknown(raw) => raw,
            known => known.as_str().to_owned(),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame sent by a chat client.
///
/// Missing fields default to empty. The older `username` key is accepted
/// for `user_name`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "username")]
    pub user_name: String,
}

impl InboundMessage {
    /// Decode one text frame. A frame that is not a JSON object of the
    /// expected shape is a read failure for the connection that sent it.
    pub fn decode(text: &str) -> Result<Self, HubError> {
        serde_json::from_str(text).map_err(|e| HubError::Read(format!("malformed frame: {e}")))
    }
}

pub const CONDITION_USERNAME: &str = "username";
pub const CONDITION_MESSAGE: &str = "message";
pub const CONDITION_SERVER_OFFLINE: &str = "serveroffline";
pub const CONDITION_CONNECTED: &str = "connected";

pub const MESSAGE_TYPE_PRESENCE: &str = "presence";
pub const MESSAGE_TYPE_CHAT: &str = "chat";
pub const MESSAGE_TYPE_GREETING: &str = "greeting";

/// A frame the hub sends to clients.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub condition: String,
    pub message: String,
    pub message_type: String,
    pub connected_user: Vec<String>,
}

impl OutboundMessage {
    /// Presence update after someone named themselves.
    pub fn username(connected_user: Vec<String>) -> Self {
        Self {
            condition: CONDITION_USERNAME.into(),
            message: String::new(),
            message_type: MESSAGE_TYPE_PRESENCE.into(),
            connected_user,
        }
    }

    /// A relayed chat line.
    pub fn chat(user_name: &str, message: &str, connected_user: Vec<String>) -> Self {
        Self {
            condition: CONDITION_MESSAGE.into(),
            message: chat_line(user_name, message),
            message_type: MESSAGE_TYPE_CHAT.into(),
            connected_user,
        }
    }

    /// Presence update after someone left.
    pub fn server_offline(connected_user: Vec<String>) -> Self {
        Self {
            condition: CONDITION_SERVER_OFFLINE.into(),
            message: String::new(),
            message_type: MESSAGE_TYPE_PRESENCE.into(),
            connected_user,
        }
    }

    /// Sent only to a connection that just registered.
    pub fn greeting(text: &str, connected_user: Vec<String>) -> Self {
        Self {
            condition: CONDITION_CONNECTED.into(),
            message: text.to_owned(),
            message_type: MESSAGE_TYPE_GREETING.into(),
            connected_user,
        }
    }

    pub fn to_json(&self) -> Result<String, HubError> {
        serde_json::to_string(self).map_err(|e| HubError::Write(format!("encode failed: {e}")))
    }
}

/// `"<user_name>: <message>"`
pub fn chat_line(user_name: &str, message: &str) -> String {
    format!("{user_name}: {message}")
}
