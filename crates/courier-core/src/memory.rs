//! In-memory message store.
//!
//! Backed by a [`DashMap`], so every update runs under that entry's shard
//! lock and is atomic per message.

use crate::message::{now_millis, Message};
use crate::store::{MessageStore, StoreError, StoreResult};
use async_trait::async_trait;
use courier_protocol::{MessageId, MessageStatus};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// A [`MessageStore`] that keeps everything in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    messages: DashMap<MessageId, Message>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn collect_sorted<F>(&self, filter: F) -> Vec<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let mut found: Vec<Message> = self
            .messages
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|m| (m.created_at, m.id));
        found
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, message: &Message) -> StoreResult<MessageId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut stored = message.clone();
        stored.id = Some(id);
        self.messages.insert(id, stored);
        trace!(message_id = id, "Saved message");
        Ok(id)
    }

    async fn get(&self, id: MessageId) -> StoreResult<Message> {
        self.messages
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_undelivered(&self, receiver_id: &str, since: u64) -> StoreResult<Vec<Message>> {
        Ok(self.collect_sorted(|m| {
            m.receiver_id == receiver_id
                && m.status < MessageStatus::Received
                && m.created_at >= since
        }))
    }

    async fn list_pending_acknowledgments(&self, identity: &str) -> StoreResult<Vec<Message>> {
        Ok(self.collect_sorted(|m| m.sender_id == identity && m.ack_pending))
    }

    async fn update_status(&self, id: MessageId, status: MessageStatus) -> StoreResult<bool> {
        let mut entry = self.messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if entry.status.advances_to(status) {
            entry.status = status;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn mark_delivered(&self, id: MessageId) -> StoreResult<()> {
        let mut entry = self.messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if entry.delivered_at.is_none() {
            entry.delivered_at = Some(now_millis());
        }
        Ok(())
    }

    async fn set_ack_pending(&self, id: MessageId, pending: bool) -> StoreResult<()> {
        let mut entry = self.messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        entry.ack_pending = pending;
        Ok(())
    }

    async fn history(
        &self,
        a: &str,
        b: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Message>> {
        Ok(self
            .collect_sorted(|m| m.is_between(a, b))
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_assigns_ids() {
        let store = MemoryStore::new();
        let id1 = store.save(&Message::new("a", "b", "one")).await.unwrap();
        let id2 = store.save(&Message::new("a", "b", "two")).await.unwrap();
        assert_ne!(id1, id2);

        let loaded = store.get(id1).await.unwrap();
        assert_eq!(loaded.id, Some(id1));
        assert_eq!(loaded.content, "one");
        assert!(matches!(store.get(999).await, Err(StoreError::NotFound(999))));
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let store = MemoryStore::new();
        let id = store.save(&Message::new("a", "b", "hi")).await.unwrap();

        assert!(store.update_status(id, MessageStatus::Sent).await.unwrap());
        assert!(store.update_status(id, MessageStatus::Received).await.unwrap());
        assert!(!store.update_status(id, MessageStatus::Received).await.unwrap());
        assert!(!store.update_status(id, MessageStatus::Sent).await.unwrap());
        assert_eq!(store.get(id).await.unwrap().status, MessageStatus::Received);
    }

    #[tokio::test]
    async fn test_list_undelivered_filters_and_orders() {
        let store = MemoryStore::new();
        let mut old = Message::new("a", "b", "old");
        old.created_at = 10;
        let mut first = Message::new("a", "b", "first");
        first.created_at = 200;
        let mut second = Message::new("c", "b", "second");
        second.created_at = 300;

        // Inserted out of order on purpose
        let second_id = store.save(&second).await.unwrap();
        let first_id = store.save(&first).await.unwrap();
        store.save(&old).await.unwrap();
        let acked = store.save(&Message::new("a", "b", "acked")).await.unwrap();
        store.update_status(acked, MessageStatus::Received).await.unwrap();
        store.save(&Message::new("b", "a", "other way")).await.unwrap();

        let pending = store.list_undelivered("b", 100).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|m| m.id.unwrap()).collect();
        assert_eq!(ids, vec![first_id, second_id]);
    }

    #[tokio::test]
    async fn test_pending_acknowledgments() {
        let store = MemoryStore::new();
        let id = store.save(&Message::new("a", "b", "hi")).await.unwrap();
        store.save(&Message::new("a", "b", "no ack owed")).await.unwrap();

        store.set_ack_pending(id, true).await.unwrap();
        let pending = store.list_pending_acknowledgments("a").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, Some(id));
        assert!(store.list_pending_acknowledgments("b").await.unwrap().is_empty());

        store.set_ack_pending(id, false).await.unwrap();
        assert!(store.list_pending_acknowledgments("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_delivered_keeps_first_timestamp() {
        let store = MemoryStore::new();
        let id = store.save(&Message::new("a", "b", "hi")).await.unwrap();

        store.mark_delivered(id).await.unwrap();
        let first = store.get(id).await.unwrap().delivered_at;
        assert!(first.is_some());

        store.mark_delivered(id).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().delivered_at, first);
    }

    #[tokio::test]
    async fn test_history_pagination() {
        let store = MemoryStore::new();
        for i in 0..5u64 {
            let (from, to) = if i % 2 == 0 { ("a", "b") } else { ("b", "a") };
            let mut msg = Message::new(from, to, format!("m{i}"));
            msg.created_at = 1_000 + i;
            store.save(&msg).await.unwrap();
        }
        store.save(&Message::new("a", "c", "elsewhere")).await.unwrap();

        let page = store.history("a", "b", 2, 1).await.unwrap();
        let contents: Vec<_> = page.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m2"]);
        assert_eq!(store.history("b", "a", 20, 0).await.unwrap().len(), 5);
    }
}
