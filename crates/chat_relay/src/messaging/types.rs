//! Frame definitions for client-relay and relay-broker communication.
//!
//! Clients send two shapes of JSON frame:
//!
//! ```json
//! {"type": "user_join", "user": "alice"}
//! {"text": "hello", "user": "alice"}
//! ```
//!
//! Any object whose `type` is not `"user_join"` is a chat frame, whatever
//! else it carries. Fields of the wrong JSON type are ignored. The relay
//! answers with [`RelayFrame`]s, which are also the exact payloads
//! published to and consumed from the broker.

use crate::error::FrameError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// User identifier used when a client omits the `user` field.
pub const ANONYMOUS_USER: &str = "anonymous";

/// A frame received from a client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Declares the connection's user; never forwarded to the broker
    Join {
        /// Declared user identifier
        user: String,
    },
    /// A chat line to fan out to everyone
    Chat {
        /// Declared user identifier
        user: String,
        /// Message body, if any
        text: Option<String>,
    },
}

#[derive(Deserialize)]
struct RawClientFrame {
    #[serde(rename = "type", default)]
    kind: Option<Value>,
    #[serde(default)]
    user: Option<Value>,
    #[serde(default)]
    text: Option<Value>,
}

fn string_field(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

impl ClientFrame {
    /// Parses a raw text frame from a client.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let frame: RawClientFrame = serde_json::from_str(raw)?;
        let user = string_field(frame.user)
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| ANONYMOUS_USER.to_string());

        match frame.kind.as_ref().and_then(Value::as_str) {
            Some("user_join") => Ok(Self::Join { user }),
            _ => Ok(Self::Chat { user, text: string_field(frame.text) }),
        }
    }

    /// The user identifier the frame declares.
    pub fn user(&self) -> &str {
        match self {
            Self::Join { user } | Self::Chat { user, .. } => user,
        }
    }
}

/// A frame fanned out through the broker to every local socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayFrame {
    /// Chat line stamped by the relay
    #[serde(rename = "chat")]
    Chat(ChatFrame),
    /// Full membership snapshot of one relay instance
    #[serde(rename = "user_list_update")]
    Presence(PresenceSnapshot),
}

/// Outbound chat line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFrame {
    /// Message body; omitted when the client sent none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Sender's user identifier
    pub user: String,
    /// Server timestamp in epoch milliseconds
    pub ts: i64,
}

/// Membership snapshot published on every presence change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    /// Present users in join order
    pub user_list: Vec<PresenceUser>,
    /// Number of entries in `user_list`
    pub total_users: usize,
    /// Generation timestamp in epoch milliseconds
    pub ts: i64,
}

/// One row of a [`PresenceSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    /// User identifier
    pub user_id: String,
    /// Join time as an RFC 3339 string with millisecond precision
    pub connection_time: String,
}

impl RelayFrame {
    /// Decodes a frame consumed from the broker.
    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encodes the frame as the JSON text sent to the broker and to clients.
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Returns at most `max_chars` characters of `raw`, for log previews.
pub fn preview(raw: &str, max_chars: usize) -> &str {
    match raw.char_indices().nth(max_chars) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}
