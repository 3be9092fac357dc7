//! Wire-format envelopes, inbound frame decoding, and outbound chat events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use messenger_common::{ChatId, MessageId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::ClientInfo;

// ---------------------------------------------------------------------------
// Frame types
// ---------------------------------------------------------------------------

pub const TYPE_MESSAGE: &str = "message";
pub const TYPE_TYPING: &str = "typing";
pub const TYPE_READ: &str = "read";
pub const TYPE_ERROR: &str = "error";
pub const TYPE_DEBUG: &str = "debug";

/// Default `type` for an inbound message without one.
const DEFAULT_MESSAGE_KIND: &str = "text";

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Outer envelope of every frame a client sends.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// Payload of an inbound `message` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub chat_id: ChatId,
    pub content: String,
    #[serde(rename = "type", default = "default_message_kind")]
    pub kind: String,
}

fn default_message_kind() -> String {
    DEFAULT_MESSAGE_KIND.to_string()
}

/// Payload of an inbound `typing` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub chat_id: ChatId,
    pub status: bool,
}

/// Payload of an inbound `read` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPayload {
    pub message_id: MessageId,
}

/// A decoded inbound frame. Unrecognized types are kept, not rejected, so the
/// caller can answer with an `error` frame and keep the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Message(NewMessagePayload),
    Typing(TypingPayload),
    Read(ReadPayload),
    Unknown { kind: String },
}

/// Failure to decode an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The outer `{type, payload}` envelope is not valid JSON. Fatal.
    #[error("malformed frame envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    /// A known `type` carried a payload of the wrong shape.
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode one inbound frame.
pub fn decode(raw: &[u8]) -> Result<InboundFrame, FrameError> {
    let envelope: ClientMessage = serde_json::from_slice(raw).map_err(FrameError::Envelope)?;

    fn payload<T: serde::de::DeserializeOwned>(
        kind: &'static str,
        value: Value,
    ) -> Result<T, FrameError> {
        serde_json::from_value(value).map_err(|source| FrameError::Payload { kind, source })
    }

    match envelope.kind.as_str() {
        TYPE_MESSAGE => Ok(InboundFrame::Message(payload(TYPE_MESSAGE, envelope.payload)?)),
        TYPE_TYPING => Ok(InboundFrame::Typing(payload(TYPE_TYPING, envelope.payload)?)),
        TYPE_READ => Ok(InboundFrame::Read(payload(TYPE_READ, envelope.payload)?)),
        _ => Ok(InboundFrame::Unknown {
            kind: envelope.kind,
        }),
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Sender fields embedded in a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderView {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Delivery projection of a persisted message. `content` is plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub user: SenderView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStatus {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub status: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user_id: UserId,
    pub message_id: MessageId,
    pub chat_id: ChatId,
}

/// Client-visible error. Sent as an `error` frame; never closes the
/// connection on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct ClientError {
    pub message: String,
    pub code: u16,
}

impl ClientError {
    fn new(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(message, 400)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(message, 401)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(message, 403)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(message, 404)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(message, 500)
    }
}

/// Diagnostic frame sent once a connection is registered.
#[derive(Debug, Clone, Serialize)]
pub struct DebugPayload {
    pub client_info: ClientInfo,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub message_data: Value,
}

/// Every event the server pushes to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ChatEvent {
    #[serde(rename = "message")]
    NewMessage(MessageView),
    #[serde(rename = "typing")]
    TypingStatus(TypingStatus),
    #[serde(rename = "read")]
    ReadReceipt(ReadReceipt),
    #[serde(rename = "error")]
    Error(ClientError),
    #[serde(rename = "debug")]
    Debug(DebugPayload),
}

impl ChatEvent {
    /// The wire `type` of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::NewMessage(_) => TYPE_MESSAGE,
            ChatEvent::TypingStatus(_) => TYPE_TYPING,
            ChatEvent::ReadReceipt(_) => TYPE_READ,
            ChatEvent::Error(_) => TYPE_ERROR,
            ChatEvent::Debug(_) => TYPE_DEBUG,
        }
    }

    /// The `payload` half of the envelope.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            ChatEvent::NewMessage(p) => serde_json::to_value(p),
            ChatEvent::TypingStatus(p) => serde_json::to_value(p),
            ChatEvent::ReadReceipt(p) => serde_json::to_value(p),
            ChatEvent::Error(p) => serde_json::to_value(p),
            ChatEvent::Debug(p) => serde_json::to_value(p),
        }
    }

    /// Encode into a ready-to-write frame.
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::from)
    }
}

impl From<ClientError> for ChatEvent {
    fn from(err: ClientError) -> Self {
        ChatEvent::Error(err)
    }
}

/// An encoded outbound frame. Cheap to clone so one encoding is shared by
/// every recipient of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Arc<str>);

impl Frame {
    /// Build a `{type, payload}` envelope around an already-encoded payload.
    pub fn envelope(kind: &str, payload: &Value) -> Self {
        let envelope = serde_json::json!({ "type": kind, "payload": payload });
        Self::from(envelope.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Self(Arc::from(text))
    }
}
