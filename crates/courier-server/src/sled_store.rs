//! Message store backed by `sled`.
//!
//! Documents live in the `messages` tree as JSON keyed by the big-endian
//! message ID. Three index trees hold empty values under composite keys:
//!
//! - `undelivered`: receiver, creation time, ID for messages not yet received
//! - `ack_pending`: sender, creation time, ID for acknowledgments still owed
//! - `conversations`: both participants (sorted), creation time, ID
//!
//! Identities in a key are length-prefixed, so a prefix scan never bleeds
//! into another identity. Documents and their index entries change together
//! in one transaction, which also keeps status updates atomic and monotonic
//! when several connection tasks race on the same message.

use async_trait::async_trait;
use courier_core::message::now_millis;
use courier_core::{Message, MessageStore, StoreError, StoreResult};
use courier_protocol::{MessageId, MessageStatus};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree, UnabortableTransactionError,
};
use sled::{Db, IVec, Transactional, Tree};
use std::path::Path;
use tracing::{info, warn};

type TxResult<T> = ConflictableTransactionResult<T, StoreError>;

const MESSAGES_TREE: &str = "messages";
const UNDELIVERED_TREE: &str = "undelivered";
const ACK_PENDING_TREE: &str = "ack_pending";
const CONVERSATIONS_TREE: &str = "conversations";

/// A [`MessageStore`] persisted in an embedded sled database.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    messages: Tree,
    undelivered: Tree,
    ack_pending: Tree,
    conversations: Tree,
}

fn backend(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn transaction_error(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => backend(e),
    }
}

fn decode(bytes: &[u8]) -> StoreResult<Message> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn encode(message: &Message) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn index_prefix(identities: &[&str]) -> Vec<u8> {
    let mut prefix = Vec::new();
    for identity in identities {
        prefix.extend_from_slice(&(identity.len() as u32).to_be_bytes());
        prefix.extend_from_slice(identity.as_bytes());
    }
    prefix
}

fn index_key(identities: &[&str], created_at: u64, id: MessageId) -> Vec<u8> {
    let mut key = index_prefix(identities);
    key.extend_from_slice(&created_at.to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn conversation_prefix(a: &str, b: &str) -> Vec<u8> {
    if a <= b {
        index_prefix(&[a, b])
    } else {
        index_prefix(&[b, a])
    }
}

fn undelivered_key(message: &Message, id: MessageId) -> Option<Vec<u8>> {
    (message.status < MessageStatus::Received)
        .then(|| index_key(&[&message.receiver_id], message.created_at, id))
}

fn ack_pending_key(message: &Message, id: MessageId) -> Option<Vec<u8>> {
    message
        .ack_pending
        .then(|| index_key(&[&message.sender_id], message.created_at, id))
}

fn conversation_key(message: &Message, id: MessageId) -> Vec<u8> {
    let mut key = conversation_prefix(&message.sender_id, &message.receiver_id);
    key.extend_from_slice(&message.created_at.to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Message ID stored in the last eight bytes of an index key.
fn indexed_id(key: &[u8]) -> StoreResult<MessageId> {
    key.len()
        .checked_sub(8)
        .and_then(|start| key[start..].try_into().ok())
        .map(MessageId::from_be_bytes)
        .ok_or_else(|| StoreError::Backend("corrupt index key".to_string()))
}

/// Move an index entry from `before` to `after`.
fn reindex(
    tree: &TransactionalTree,
    before: Option<Vec<u8>>,
    after: Option<Vec<u8>>,
) -> Result<(), UnabortableTransactionError> {
    if before == after {
        return Ok(());
    }
    if let Some(key) = before {
        tree.remove(key)?;
    }
    if let Some(key) = after {
        tree.insert(key, &b""[..])?;
    }
    Ok(())
}

impl SledStore {
    /// Open or create a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(backend)?;
        let messages = db.open_tree(MESSAGES_TREE).map_err(backend)?;
        let undelivered = db.open_tree(UNDELIVERED_TREE).map_err(backend)?;
        let ack_pending = db.open_tree(ACK_PENDING_TREE).map_err(backend)?;
        let conversations = db.open_tree(CONVERSATIONS_TREE).map_err(backend)?;
        info!(path = %path.display(), messages = messages.len(), "Opened sled store");
        Ok(Self {
            db,
            messages,
            undelivered,
            ack_pending,
            conversations,
        })
    }

    async fn flush(&self) -> StoreResult<()> {
        self.db.flush_async().await.map_err(backend)?;
        Ok(())
    }

    /// Apply `change` to one message and its index entries atomically.
    ///
    /// `change` returns `false` to leave the document untouched; it may run
    /// more than once if the transaction conflicts with another writer.
    fn modify<F>(&self, id: MessageId, change: F) -> StoreResult<bool>
    where
        F: Fn(&mut Message) -> bool,
    {
        let key = id.to_be_bytes();
        (&self.messages, &self.undelivered, &self.ack_pending)
            .transaction(|(messages, undelivered, ack_pending)| -> TxResult<bool> {
                let current = messages
                    .get(key)?
                    .ok_or(ConflictableTransactionError::Abort(StoreError::NotFound(id)))?;
                let before = decode(&current).map_err(ConflictableTransactionError::Abort)?;

                let mut after = before.clone();
                if !change(&mut after) {
                    return Ok(false);
                }

                let document = encode(&after).map_err(ConflictableTransactionError::Abort)?;
                messages.insert(&key[..], document)?;
                reindex(
                    undelivered,
                    undelivered_key(&before, id),
                    undelivered_key(&after, id),
                )?;
                reindex(
                    ack_pending,
                    ack_pending_key(&before, id),
                    ack_pending_key(&after, id),
                )?;
                Ok(true)
            })
            .map_err(transaction_error)
    }

    /// Load the documents behind a run of index keys.
    ///
    /// Index reads are not isolated from concurrent writers, so each document
    /// is checked against `filter` once more after loading.
    fn load<I, F>(&self, keys: I, filter: F) -> StoreResult<Vec<Message>>
    where
        I: Iterator<Item = sled::Result<IVec>>,
        F: Fn(&Message) -> bool,
    {
        let mut found = Vec::new();
        for key in keys {
            let id = indexed_id(&key.map_err(backend)?)?;
            match self.messages.get(id.to_be_bytes()).map_err(backend)? {
                Some(bytes) => {
                    let message = decode(&bytes)?;
                    if filter(&message) {
                        found.push(message);
                    }
                }
                None => warn!(message_id = id, "Index entry without document"),
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl MessageStore for SledStore {
    async fn save(&self, message: &Message) -> StoreResult<MessageId> {
        // sled IDs start at 0; message IDs start at 1
        let id = self.db.generate_id().map_err(backend)? + 1;
        let mut message = message.clone();
        message.id = Some(id);
        let document = encode(&message)?;

        let trees = (
            &self.messages,
            &self.undelivered,
            &self.ack_pending,
            &self.conversations,
        );
        trees
            .transaction(|(messages, undelivered, ack_pending, conversations)| -> TxResult<()> {
                messages.insert(&id.to_be_bytes()[..], document.clone())?;
                reindex(undelivered, None, undelivered_key(&message, id))?;
                reindex(ack_pending, None, ack_pending_key(&message, id))?;
                conversations.insert(conversation_key(&message, id), &b""[..])?;
                Ok(())
            })
            .map_err(transaction_error)?;

        self.flush().await?;
        Ok(id)
    }

    async fn get(&self, id: MessageId) -> StoreResult<Message> {
        let bytes = self
            .messages
            .get(id.to_be_bytes())
            .map_err(backend)?
            .ok_or(StoreError::NotFound(id))?;
        decode(&bytes)
    }

    async fn list_undelivered(&self, receiver_id: &str, since: u64) -> StoreResult<Vec<Message>> {
        let prefix = index_prefix(&[receiver_id]);
        let mut start = prefix.clone();
        start.extend_from_slice(&since.to_be_bytes());

        let keys = self
            .undelivered
            .range(start..)
            .keys()
            .take_while(|key| key.as_ref().map_or(true, |key| key.starts_with(&prefix)));
        self.load(keys, |m| m.status < MessageStatus::Received)
    }

    async fn list_pending_acknowledgments(&self, identity: &str) -> StoreResult<Vec<Message>> {
        let keys = self.ack_pending.scan_prefix(index_prefix(&[identity])).keys();
        self.load(keys, |m| m.ack_pending)
    }

    async fn update_status(&self, id: MessageId, status: MessageStatus) -> StoreResult<bool> {
        let advanced = self.modify(id, |m| {
            if m.status.advances_to(status) {
                m.status = status;
                true
            } else {
                false
            }
        })?;
        if advanced {
            self.flush().await?;
        }
        Ok(advanced)
    }

    async fn mark_delivered(&self, id: MessageId) -> StoreResult<()> {
        let now = now_millis();
        let changed = self.modify(id, |m| {
            if m.delivered_at.is_some() {
                return false;
            }
            m.delivered_at = Some(now);
            true
        })?;
        if changed {
            self.flush().await?;
        }
        Ok(())
    }

    async fn set_ack_pending(&self, id: MessageId, pending: bool) -> StoreResult<()> {
        let changed = self.modify(id, |m| {
            if m.ack_pending == pending {
                return false;
            }
            m.ack_pending = pending;
            true
        })?;
        if changed {
            self.flush().await?;
        }
        Ok(())
    }

    async fn history(
        &self,
        a: &str,
        b: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Message>> {
        let keys = self
            .conversations
            .scan_prefix(conversation_prefix(a, b))
            .keys()
            .skip(offset)
            .take(limit);
        self.load(keys, |_| true)
    }
}
