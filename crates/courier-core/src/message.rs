//! Conversation messages.
//!
//! A [`Message`] is the durable form of a chat message. Frames on the wire
//! are derived from it; the store owns the authoritative copy.

use courier_protocol::{EventType, Frame, MessageId, MessageStatus};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// An authenticated principal.
pub type Identity = String;

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Durable ID; `None` until the store saves the message.
    pub id: Option<MessageId>,
    /// Client correlation token.
    pub temp_id: Option<String>,
    /// Sender identity.
    pub sender_id: Identity,
    /// Receiver identity.
    pub receiver_id: Identity,
    /// Text content, empty when only a file is attached.
    pub content: String,
    /// Attachment URL.
    pub file_url: Option<String>,
    /// Creation time (ms).
    pub created_at: u64,
    /// Time the receiver acknowledged the message (ms).
    pub delivered_at: Option<u64>,
    /// Delivery progress.
    pub status: MessageStatus,
    /// Event type used when the message is delivered to its receiver.
    pub event_type: EventType,
    /// An acknowledgment for this message still has to reach the sender.
    #[serde(default)]
    pub ack_pending: bool,
}

impl Message {
    /// Create a new, unsaved message.
    #[must_use]
    pub fn new(
        sender_id: impl Into<Identity>,
        receiver_id: impl Into<Identity>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            temp_id: None,
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            content: content.into(),
            file_url: None,
            created_at: now_millis(),
            delivered_at: None,
            status: MessageStatus::Stored,
            event_type: EventType::ReceiveMessage,
            ack_pending: false,
        }
    }

    /// Build a message from an inbound `send_message` frame.
    ///
    /// The sender is always the authenticated identity of the connection,
    /// never whatever the frame claims.
    #[must_use]
    pub fn from_send_frame(sender_id: &str, frame: Frame) -> Self {
        let mut message = Self::new(
            sender_id,
            frame.receiver_id,
            frame.content.unwrap_or_default(),
        );
        message.temp_id = frame.temp_id;
        message.file_url = frame.file_url.filter(|url| !url.is_empty());
        message
    }

    /// Attach a correlation token.
    #[must_use]
    pub fn with_temp_id(mut self, temp_id: impl Into<String>) -> Self {
        self.temp_id = Some(temp_id.into());
        self
    }

    /// Attach a file URL.
    #[must_use]
    pub fn with_file_url(mut self, file_url: impl Into<String>) -> Self {
        self.file_url = Some(file_url.into());
        self
    }

    /// Whether the message belongs to the conversation between `a` and `b`.
    #[must_use]
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    /// Frame delivering this message to its receiver.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame {
            event_type: self.event_type.clone(),
            id: self.id,
            temp_id: self.temp_id.clone(),
            sender_id: self.sender_id.clone(),
            receiver_id: self.receiver_id.clone(),
            content: Some(self.content.clone()),
            file_url: self.file_url.clone(),
            created_at: Some(self.created_at),
            delivered_at: self.delivered_at,
            status: Some(self.status),
        }
    }

    /// Acknowledgment frame reporting `status` back to the sender.
    #[must_use]
    pub fn acknowledgment(&self, status: MessageStatus) -> Frame {
        Frame {
            event_type: EventType::Acknowledgment,
            status: Some(status),
            ..self.to_frame()
        }
    }
}
