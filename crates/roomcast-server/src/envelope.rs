//! The unit exchanged over a live room connection.
//!
//! Envelopes are JSON objects with snake_case keys. Unknown fields are
//! ignored; an unknown `kind` fails decoding and the frame is dropped.
//! An envelope is encoded once per broadcast into a [`Frame`], which clones
//! by reference count into each recipient's queue.

use axum::extract::ws::Utf8Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A pre-serialized text frame ready for the socket.
pub type Frame = Utf8Bytes;

/// What an envelope announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Message,
    Edit,
    Delete,
    Typing,
    Read,
    ReactionAdd,
    ReactionRemove,
    Join,
    Leave,
    Error,
}

impl EnvelopeKind {
    /// Kinds a client may send. `join`, `leave` and `error` are server-only.
    pub fn is_client_kind(self) -> bool {
        !matches!(self, Self::Join | Self::Leave | Self::Error)
    }
}

/// One event on a room's live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub room_id: i64,
    #[serde(default)]
    pub sender_id: i64,
    #[serde(default)]
    pub sender_display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// The persisted object behind a durable event, so receivers need no
    /// follow-up fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Envelope {
    /// A bare envelope from `sender_id` in `room_id`, stamped now.
    pub fn new(
        kind: EnvelopeKind,
        room_id: i64,
        sender_id: i64,
        sender_display_name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            room_id,
            sender_id,
            sender_display_name: sender_display_name.into(),
            message_id: None,
            body: None,
            attachment_url: None,
            attachment_name: None,
            reply_to_id: None,
            emoji: None,
            timestamp: Utc::now(),
            payload: None,
        }
    }

    /// An error notice addressed to a single session.
    pub fn error(room_id: i64, message: impl Into<String>) -> Self {
        let mut envelope = Self::new(EnvelopeKind::Error, room_id, 0, "");
        envelope.body = Some(message.into());
        envelope
    }

    pub fn with_message_id(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_emoji(mut self, emoji: impl Into<String>) -> Self {
        self.emoji = Some(emoji.into());
        self
    }

    /// Attaches a persisted object as the payload.
    ///
    /// Serializing one of this crate's row types cannot fail; if a value
    /// somehow does, the envelope goes out without a payload.
    pub fn with_payload<T: Serialize>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(payload) => self.payload = Some(payload),
            Err(e) => tracing::warn!(error = %e, kind = ?self.kind, "dropping envelope payload"),
        }
        self
    }

    /// Overwrites identity fields with the authenticated session's values.
    /// Whatever the client put there is discarded.
    pub fn stamp(&mut self, room_id: i64, sender_id: i64, sender_display_name: &str) {
        self.room_id = room_id;
        self.sender_id = sender_id;
        self.sender_display_name = sender_display_name.to_string();
        self.timestamp = Utc::now();
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::from)
    }
}
