//! WebSocket message types.
//!
//! Every frame on the wire is one JSON envelope:
//! `{"type": string, "data": object, "timestamp": RFC3339}`.

use std::fmt;

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// A serialized envelope ready to be written to a socket.
pub type Frame = Utf8Bytes;

/// Identifier of one live connection. Fresh on every connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Events (Server -> Client)
// ============================================================================

/// Online/offline transition of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceStatus::Online => write!(f, "online"),
            PresenceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Events sent from the hub to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    // ========== Connection Events ==========
    /// Sent once, right after the upgrade.
    Connected {
        connection_id: ConnectionId,
        user_id: String,
    },

    /// Reply to a client `ping`.
    Pong,

    // ========== Presence ==========
    UserStatus {
        user_id: String,
        status: PresenceStatus,
    },

    // ========== Private Messaging ==========
    /// A private message addressed to the receiving user.
    NewMessage {
        /// `None` when persistence failed; delivery is best effort.
        message_id: Option<String>,
        sender_id: String,
        receiver_id: String,
        content: String,
        sent_at: DateTime<Utc>,
    },

    /// Confirmation echoed to the sender's sessions.
    MessageSent {
        message_id: Option<String>,
        receiver_id: String,
        receiver_online: bool,
    },

    TypingIndicator {
        sender_id: String,
        is_typing: bool,
    },

    /// The reader has seen the messages sent to them.
    MessageRead { reader_id: String },

    // ========== Forum Events ==========
    DiscussionUpdate(Value),

    NewPost(Value),

    NewComment(Value),
}

impl ServerEvent {
    /// The `type` tag this event carries on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::Pong => "pong",
            ServerEvent::UserStatus { .. } => "user_status",
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::MessageSent { .. } => "message_sent",
            ServerEvent::TypingIndicator { .. } => "typing_indicator",
            ServerEvent::MessageRead { .. } => "message_read",
            ServerEvent::DiscussionUpdate(_) => "discussion_update",
            ServerEvent::NewPost(_) => "new_post",
            ServerEvent::NewComment(_) => "new_comment",
        }
    }
}

/// Which connections an envelope is delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Route {
    /// Every registered connection.
    #[default]
    All,
    /// Every connection of one user.
    User(String),
    /// Every connection except those of one user.
    AllExcept(String),
}

/// One outbound wire unit plus its routing hint.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: ServerEvent,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    pub route: Route,
}

impl Envelope {
    pub fn new(event: ServerEvent, route: Route) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            route,
        }
    }

    pub fn to_user(user_id: impl Into<String>, event: ServerEvent) -> Self {
        Self::new(event, Route::User(user_id.into()))
    }

    pub fn to_all(event: ServerEvent) -> Self {
        Self::new(event, Route::All)
    }

    pub fn to_all_except(user_id: impl Into<String>, event: ServerEvent) -> Self {
        Self::new(event, Route::AllExcept(user_id.into()))
    }

    /// Serialize into a frame. Serialization happens once per envelope no
    /// matter how many connections receive it.
    pub fn to_frame(&self) -> serde_json::Result<Frame> {
        serde_json::to_string(self).map(Frame::from)
    }
}

// ============================================================================
// Inbound (Client -> Server)
// ============================================================================

/// Errors produced while decoding an inbound frame. None of them are fatal
/// for the connection.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not a JSON envelope: {0}")]
    NotJson(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// The untyped `{type, data}` shape every inbound frame must have.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMessagePayload {
    pub receiver_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub receiver_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    /// The user whose messages were read.
    pub sender_id: String,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    PrivateMessage(PrivateMessagePayload),
    TypingIndicator(TypingPayload),
    MessageRead(ReadReceiptPayload),
    DiscussionUpdate(Value),
    Ping,
}

impl InboundMessage {
    /// Decode and validate one text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let raw: RawFrame = serde_json::from_str(text)?;

        match raw.kind.as_str() {
            "private_message" | "privateMessage" => {
                let payload: PrivateMessagePayload = payload("private_message", raw.data)?;
                require_non_empty("private_message", "receiverId", &payload.receiver_id)?;
                require_non_empty("private_message", "content", payload.content.trim())?;
                Ok(InboundMessage::PrivateMessage(payload))
            }
            "typing_indicator" | "typing" => {
                let payload: TypingPayload = payload("typing_indicator", raw.data)?;
                require_non_empty("typing_indicator", "receiverId", &payload.receiver_id)?;
                Ok(InboundMessage::TypingIndicator(payload))
            }
            "message_read" | "readReceipt" => {
                let payload: ReadReceiptPayload = payload("message_read", raw.data)?;
                require_non_empty("message_read", "senderId", &payload.sender_id)?;
                Ok(InboundMessage::MessageRead(payload))
            }
            "discussion_update" => Ok(InboundMessage::DiscussionUpdate(raw.data)),
            "ping" => Ok(InboundMessage::Ping),
            _ => Err(DecodeError::UnknownType(raw.kind)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::PrivateMessage(_) => "private_message",
            InboundMessage::TypingIndicator(_) => "typing_indicator",
            InboundMessage::MessageRead(_) => "message_read",
            InboundMessage::DiscussionUpdate(_) => "discussion_update",
            InboundMessage::Ping => "ping",
        }
    }
}

fn payload<T: for<'de> Deserialize<'de>>(kind: &'static str, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|e| DecodeError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

fn require_non_empty(kind: &'static str, field: &str, value: &str) -> Result<(), DecodeError> {
    if value.is_empty() {
        return Err(DecodeError::Malformed {
            kind,
            reason: format!("{field} must not be empty"),
        });
    }
    Ok(())
}
