//! Message persistence port.
//!
//! The delivery engine only talks to storage through [`MessageStore`]. Each
//! call is expected to be atomic on its own; no call sequence is treated as
//! a transaction. Status updates are monotonic so that racing or replayed
//! updates converge instead of conflicting.

use crate::message::Message;
use async_trait::async_trait;
use courier_protocol::{MessageId, MessageStatus};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No message with this ID.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// A stored document could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The storage backend failed.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message and return its durable ID.
    ///
    /// Any ID already set on `message` is ignored.
    async fn save(&self, message: &Message) -> StoreResult<MessageId>;

    /// Fetch a message by ID.
    async fn get(&self, id: MessageId) -> StoreResult<Message>;

    /// Messages addressed to `receiver_id` that have not been acknowledged
    /// (status below `received`) and were created at or after `since` (ms).
    ///
    /// Results are in ascending creation order.
    async fn list_undelivered(&self, receiver_id: &str, since: u64) -> StoreResult<Vec<Message>>;

    /// Messages sent by `identity` whose acknowledgment has not reached it.
    ///
    /// Results are in ascending creation order.
    async fn list_pending_acknowledgments(&self, identity: &str) -> StoreResult<Vec<Message>>;

    /// Move a message forward to `status`.
    ///
    /// Returns `true` if the status advanced, `false` if the message was
    /// already at or past `status`. Never moves a status backwards.
    async fn update_status(&self, id: MessageId, status: MessageStatus) -> StoreResult<bool>;

    /// Record the delivery timestamp if none is set yet.
    async fn mark_delivered(&self, id: MessageId) -> StoreResult<()>;

    /// Flag or clear an acknowledgment that still has to reach the sender.
    async fn set_ack_pending(&self, id: MessageId, pending: bool) -> StoreResult<()>;

    /// Conversation between `a` and `b`, oldest first, paginated.
    async fn history(
        &self,
        a: &str,
        b: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Message>>;
}
