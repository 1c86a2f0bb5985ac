//! Frame types for the Courier protocol.
//!
//! A frame is a flat, tagged record. The `event_type` tag tells the receiver
//! which protocol role the frame plays; every other field is optional on the
//! wire so that clients only send what their event needs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Durable message identifier, assigned by the message store.
pub type MessageId = u64;

/// Protocol role of a frame.
///
/// Clients send `send_message` and `ack_received`; the server emits
/// `receive_message` and `acknowledgment`. Any other tag decodes into
/// [`EventType::Unknown`] so that newer clients never break older servers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// Client submits a new message.
    SendMessage,
    /// Client confirms it received a message.
    AckReceived,
    /// Server delivers a message to its receiver.
    ReceiveMessage,
    /// Server reports message progress back to its sender.
    Acknowledgment,
    /// Any tag this version does not understand.
    Unknown(String),
}

impl EventType {
    /// Wire name of the event type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            EventType::SendMessage => "send_message",
            EventType::AckReceived => "ack_received",
            EventType::ReceiveMessage => "receive_message",
            EventType::Acknowledgment => "acknowledgment",
            EventType::Unknown(other) => other,
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "send_message" => EventType::SendMessage,
            "ack_received" => EventType::AckReceived,
            "receive_message" => EventType::ReceiveMessage,
            "acknowledgment" => EventType::Acknowledgment,
            _ => EventType::Unknown(value),
        }
    }
}

impl From<EventType> for String {
    fn from(event: EventType) -> String {
        match event {
            EventType::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery progress of a message.
///
/// Variants are declared in protocol order, so the derived `Ord` is the
/// progress order: `Stored < Sent < Received < Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Persisted, not yet handed to the receiver's connection.
    Stored,
    /// Handed to the receiver's outbound mailbox.
    Sent,
    /// Receiver confirmed receipt.
    Received,
    /// Receiver opened the message.
    Read,
}

impl MessageStatus {
    /// Whether moving from `self` to `next` is forward progress.
    #[must_use]
    pub fn advances_to(self, next: MessageStatus) -> bool {
        next > self
    }

    /// Wire name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Stored => "stored",
            MessageStatus::Sent => "sent",
            MessageStatus::Received => "received",
            MessageStatus::Read => "read",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Protocol role of this frame.
    pub event_type: EventType,

    /// Durable message ID (absent on `send_message`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,

    /// Client correlation token, echoed on every acknowledgment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,

    /// Sender identity. Ignored on inbound `send_message`.
    #[serde(default)]
    pub sender_id: String,

    /// Receiver identity.
    #[serde(default)]
    pub receiver_id: String,

    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Attachment URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,

    /// Creation time, milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,

    /// Delivery time, milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<u64>,

    /// Message status, set on server-emitted frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

impl Frame {
    /// Create an empty frame with the given event type.
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            id: None,
            temp_id: None,
            sender_id: String::new(),
            receiver_id: String::new(),
            content: None,
            file_url: None,
            created_at: None,
            delivered_at: None,
            status: None,
        }
    }

    /// Create a `send_message` frame.
    #[must_use]
    pub fn send_message(receiver_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            receiver_id: receiver_id.into(),
            content: Some(content.into()),
            ..Self::new(EventType::SendMessage)
        }
    }

    /// Create an `ack_received` frame for a delivered message.
    #[must_use]
    pub fn ack_received(id: MessageId) -> Self {
        Self {
            id: Some(id),
            ..Self::new(EventType::AckReceived)
        }
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

    /// Set the sender identity.
    #[must_use]
    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    /// Whether the frame carries neither text nor an attachment.
    #[must_use]
    pub fn is_empty_body(&self) -> bool {
        let no_text = self.content.as_deref().map_or(true, str::is_empty);
        let no_file = self.file_url.as_deref().map_or(true, str::is_empty);
        no_text && no_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        assert_eq!(EventType::from("send_message".to_string()), EventType::SendMessage);
        assert_eq!(EventType::from("ack_received".to_string()), EventType::AckReceived);
        assert_eq!(
            EventType::from("typing".to_string()),
            EventType::Unknown("typing".to_string())
        );
        assert_eq!(String::from(EventType::Acknowledgment), "acknowledgment");
    }

    #[test]
    fn test_status_order() {
        assert!(MessageStatus::Stored < MessageStatus::Sent);
        assert!(MessageStatus::Sent < MessageStatus::Received);
        assert!(MessageStatus::Received < MessageStatus::Read);
        assert!(MessageStatus::Sent.advances_to(MessageStatus::Received));
        assert!(!MessageStatus::Received.advances_to(MessageStatus::Received));
        assert!(!MessageStatus::Received.advances_to(MessageStatus::Sent));
    }

    #[test]
    fn test_unknown_event_decodes() {
        let json = r#"{"event_type":"typing","sender_id":"a","receiver_id":"b"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.event_type, EventType::Unknown("typing".to_string()));
        assert_eq!(frame.receiver_id, "b");
    }

    #[test]
    fn test_send_frame_shape() {
        let frame = Frame::send_message("R", "hi").with_temp_id("t1");
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event_type"], "send_message");
        assert_eq!(value["temp_id"], "t1");
        assert_eq!(value["content"], "hi");
        assert!(value.get("id").is_none());
        assert!(value.get("status").is_none());
    }

    #[test]
    fn test_empty_body() {
        assert!(Frame::send_message("R", "").is_empty_body());
        assert!(!Frame::send_message("R", "").with_file_url("https://f/1").is_empty_body());
        assert!(!Frame::send_message("R", "hi").is_empty_body());
    }
}
