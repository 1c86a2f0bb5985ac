//! The delivery engine.
//!
//! Moves every message from `stored` towards `received` while either side
//! may disconnect at any moment:
//!
//! ```text
//!  send_message ──▶ save (stored) ──▶ ack(stored) to sender
//!                        │
//!                        ├─ receiver online, mailbox accepts ──▶ sent
//!                        └─ otherwise ──▶ stays stored until the receiver reconnects
//!
//!  ack_received ──▶ received + delivered_at ──▶ ack(received) to sender
//!                                                 └─ sender offline ──▶ ack pending
//! ```
//!
//! A full mailbox or an absent peer is never an error: the message is already
//! durable and the next backlog sweep for that identity picks it up.

use crate::connection::Connection;
use crate::mailbox::{Enqueue, DEFAULT_MAILBOX_CAPACITY};
use crate::message::{now_millis, Identity, Message};
use crate::metrics;
use crate::registry::ConnectionRegistry;
use crate::store::{MessageStore, StoreError};
use courier_protocol::{Frame, MessageId, MessageStatus};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default look-back window for undelivered messages (5 days).
pub const DEFAULT_UNDELIVERED_WINDOW: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Engine errors. Each one aborts handling of a single frame only.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The message store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The frame is missing required fields.
    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// Someone other than the receiver acknowledged a message.
    #[error("{identity} is not the receiver of message {id}")]
    NotRecipient {
        /// Message being acknowledged.
        id: MessageId,
        /// Identity that sent the acknowledgment.
        identity: Identity,
    },
}

impl EngineError {
    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Store(StoreError::NotFound(_)) => "unknown_message",
            EngineError::Store(_) => "store",
            EngineError::InvalidFrame(_) => "invalid_frame",
            EngineError::NotRecipient { .. } => "not_recipient",
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of each connection's outbound mailbox.
    pub mailbox_capacity: usize,
    /// How far back a reconnect sweep looks for undelivered messages.
    pub undelivered_window: Duration,
    /// How long a sweep waits for mailbox capacity before giving up.
    pub sweep_enqueue_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            undelivered_window: DEFAULT_UNDELIVERED_WINDOW,
            sweep_enqueue_timeout: Duration::from_secs(2),
        }
    }
}

/// Where a frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the peer's live mailbox.
    Live,
    /// Peer absent or mailbox unavailable; left in durable pending state.
    Deferred,
}

/// Result of handling a `send_message` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    /// Durable ID assigned to the message.
    pub id: MessageId,
    /// Delivery to the receiver.
    pub delivery: Delivery,
    /// Delivery of the `stored` acknowledgment to the sender.
    pub sender_notified: Delivery,
}

/// Result of handling an `ack_received` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Status advanced to `received`.
    Acknowledged {
        /// Acknowledged message.
        id: MessageId,
        /// Delivery of the `received` acknowledgment to the sender.
        sender_notified: Delivery,
    },
    /// The message was already `received`; nothing changed.
    Duplicate {
        /// Acknowledged message.
        id: MessageId,
    },
}

/// Result of a reconnect backlog sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Undelivered messages handed to the mailbox.
    pub redelivered: usize,
    /// Undelivered messages left for a later sweep.
    pub undelivered_remaining: usize,
    /// Pending acknowledgments handed to the mailbox.
    pub acks_delivered: usize,
    /// Pending acknowledgments left for a later sweep.
    pub acks_remaining: usize,
}

/// Decides live vs deferred delivery and runs the acknowledgment protocol.
///
/// Safe to call concurrently from any number of connection tasks.
pub struct DeliveryEngine {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    config: EngineConfig,
}

impl DeliveryEngine {
    /// Create an engine with a fresh registry.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, config: EngineConfig) -> Self {
        Self::with_registry(Arc::new(ConnectionRegistry::new()), store, config)
    }

    /// Create an engine over an existing registry.
    #[must_use]
    pub fn with_registry(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MessageStore>,
        config: EngineConfig,
    ) -> Self {
        info!("Creating delivery engine with config: {:?}", config);
        Self {
            registry,
            store,
            config,
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The message store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle a `send_message` frame from `sender`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is malformed or the message cannot be
    /// persisted. An unreachable receiver is not an error.
    pub async fn handle_send(&self, sender: &str, frame: Frame) -> Result<SendOutcome, EngineError> {
        if frame.receiver_id.is_empty() {
            return Err(EngineError::InvalidFrame("missing receiver_id"));
        }
        if frame.is_empty_body() {
            return Err(EngineError::InvalidFrame("neither content nor file_url"));
        }

        let mut message = Message::from_send_frame(sender, frame);
        let id = self.store.save(&message).await?;
        message.id = Some(id);

        debug!(
            message_id = id,
            sender = %message.sender_id,
            receiver = %message.receiver_id,
            "Message stored"
        );

        let sender_notified = self.emit_ack(id, &message, MessageStatus::Stored).await;

        let delivery = self.deliver_live(&message);
        if delivery == Delivery::Live {
            self.store.update_status(id, MessageStatus::Sent).await?;
        }

        Ok(SendOutcome {
            id,
            delivery,
            sender_notified,
        })
    }

    /// Handle an `ack_received` frame from `identity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame has no message ID, the message does not
    /// exist or is addressed to someone else, or the store fails.
    pub async fn handle_ack(&self, identity: &str, frame: Frame) -> Result<AckOutcome, EngineError> {
        let id = frame
            .id
            .ok_or(EngineError::InvalidFrame("ack_received without id"))?;

        let mut message = self.store.get(id).await?;
        if message.receiver_id != identity {
            return Err(EngineError::NotRecipient {
                id,
                identity: identity.to_string(),
            });
        }

        // received is only ever reached through sent
        if message.status < MessageStatus::Sent {
            self.store.update_status(id, MessageStatus::Sent).await?;
        }
        if !self.store.update_status(id, MessageStatus::Received).await? {
            debug!(message_id = id, status = %message.status, "Duplicate acknowledgment");
            return Ok(AckOutcome::Duplicate { id });
        }
        self.store.mark_delivered(id).await?;

        message.status = MessageStatus::Received;
        message.delivered_at.get_or_insert_with(now_millis);

        let sender_notified = self.emit_ack(id, &message, MessageStatus::Received).await;
        if sender_notified == Delivery::Live && message.ack_pending {
            if let Err(e) = self.store.set_ack_pending(id, false).await {
                warn!(message_id = id, error = %e, "Failed to clear pending acknowledgment");
            }
        }

        debug!(message_id = id, sender = %message.sender_id, "Message received");
        Ok(AckOutcome::Acknowledged {
            id,
            sender_notified,
        })
    }

    /// Start the backlog sweeps for a freshly registered identity.
    ///
    /// Runs in the background; the returned handle is only for callers that
    /// want the report.
    pub fn on_connect(self: &Arc<Self>, identity: &str) -> JoinHandle<SweepReport> {
        let engine = Arc::clone(self);
        let identity = identity.to_string();
        tokio::spawn(async move { engine.sweep(&identity).await })
    }

    /// Replay undelivered messages, then pending acknowledgments, to the live
    /// connection of `identity`.
    ///
    /// Each sweep stops at the first frame the mailbox cannot take, so that
    /// nothing is replayed out of creation order; whatever is left stays
    /// pending for the next connect.
    pub async fn sweep(&self, identity: &str) -> SweepReport {
        let mut report = SweepReport::default();

        let Some(connection) = self.registry.lookup(identity) else {
            debug!(identity = %identity, "Skipping sweep, identity offline");
            return report;
        };

        self.sweep_undelivered(&connection, &mut report).await;
        self.sweep_pending_acks(&connection, &mut report).await;

        if report != SweepReport::default() {
            info!(
                identity = %identity,
                redelivered = report.redelivered,
                undelivered_remaining = report.undelivered_remaining,
                acks_delivered = report.acks_delivered,
                acks_remaining = report.acks_remaining,
                "Backlog sweep finished"
            );
        }
        report
    }

    async fn sweep_undelivered(&self, connection: &Connection, report: &mut SweepReport) {
        let identity = connection.identity();
        let window = u64::try_from(self.config.undelivered_window.as_millis()).unwrap_or(u64::MAX);
        let since = now_millis().saturating_sub(window);

        let backlog = match self.store.list_undelivered(identity, since).await {
            Ok(backlog) => backlog,
            Err(e) => {
                error!(identity = %identity, error = %e, "Failed to fetch undelivered messages");
                metrics::record_error("store");
                return;
            }
        };

        for (index, message) in backlog.iter().enumerate() {
            let Some(id) = message.id else { continue };

            let outcome = connection
                .enqueue_timeout(message.to_frame(), self.config.sweep_enqueue_timeout)
                .await;
            if !outcome.is_accepted() {
                report.undelivered_remaining = backlog.len() - index;
                metrics::record_delivery("backlog", "deferred");
                debug!(identity = %identity, ?outcome, "Stopping undelivered sweep");
                break;
            }

            report.redelivered += 1;
            metrics::record_delivery("backlog", "sent");
            if let Err(e) = self.store.update_status(id, MessageStatus::Sent).await {
                warn!(message_id = id, error = %e, "Failed to mark redelivered message as sent");
            }
        }
    }

    async fn sweep_pending_acks(&self, connection: &Connection, report: &mut SweepReport) {
        let identity = connection.identity();

        let pending = match self.store.list_pending_acknowledgments(identity).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(identity = %identity, error = %e, "Failed to fetch pending acknowledgments");
                metrics::record_error("store");
                return;
            }
        };

        for (index, message) in pending.iter().enumerate() {
            let Some(id) = message.id else { continue };

            let outcome = connection
                .enqueue_timeout(
                    message.acknowledgment(message.status),
                    self.config.sweep_enqueue_timeout,
                )
                .await;
            if !outcome.is_accepted() {
                report.acks_remaining = pending.len() - index;
                debug!(identity = %identity, ?outcome, "Stopping acknowledgment sweep");
                break;
            }

            report.acks_delivered += 1;
            metrics::record_ack("sent");
            if let Err(e) = self.store.set_ack_pending(id, false).await {
                warn!(message_id = id, error = %e, "Failed to clear pending acknowledgment");
            }
            if message.status >= MessageStatus::Received {
                if let Err(e) = self.store.mark_delivered(id).await {
                    warn!(message_id = id, error = %e, "Failed to mark message delivered");
                }
            }
        }
    }

    /// Try to hand a message to its receiver's mailbox.
    fn deliver_live(&self, message: &Message) -> Delivery {
        let outcome = match self.registry.lookup(&message.receiver_id) {
            Some(connection) => connection.enqueue(message.to_frame()),
            None => {
                debug!(receiver = %message.receiver_id, "Receiver offline, message pending");
                metrics::record_delivery("live", "deferred");
                return Delivery::Deferred;
            }
        };

        match outcome {
            Enqueue::Accepted => {
                metrics::record_delivery("live", "sent");
                Delivery::Live
            }
            Enqueue::Full | Enqueue::Closed => {
                debug!(
                    receiver = %message.receiver_id,
                    ?outcome,
                    "Receiver mailbox unavailable, message pending"
                );
                metrics::record_delivery("live", "deferred");
                Delivery::Deferred
            }
        }
    }

    /// Try to hand an acknowledgment to the sender's mailbox.
    fn deliver_ack(&self, message: &Message, status: MessageStatus) -> bool {
        self.registry
            .lookup(&message.sender_id)
            .map_or(false, |connection| {
                connection.enqueue(message.acknowledgment(status)).is_accepted()
            })
    }

    /// Send an acknowledgment to the message's sender, or flag it pending.
    async fn emit_ack(&self, id: MessageId, message: &Message, status: MessageStatus) -> Delivery {
        if self.deliver_ack(message, status) {
            metrics::record_ack("sent");
            return Delivery::Live;
        }

        if let Err(e) = self.store.set_ack_pending(id, true).await {
            error!(message_id = id, error = %e, "Failed to mark acknowledgment pending");
            metrics::record_error("store");
            metrics::record_ack("pending");
            return Delivery::Deferred;
        }

        // The sender may have connected and swept before the flag landed
        if self.deliver_ack(message, status) {
            debug!(message_id = id, sender = %message.sender_id, "Sender reconnected, acknowledgment sent");
            if let Err(e) = self.store.set_ack_pending(id, false).await {
                warn!(message_id = id, error = %e, "Failed to clear pending acknowledgment");
            }
            metrics::record_ack("sent");
            return Delivery::Live;
        }

        debug!(message_id = id, sender = %message.sender_id, %status, "Acknowledgment pending");
        metrics::record_ack("pending");
        Delivery::Deferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::StoreResult;
    use async_trait::async_trait;
    use courier_protocol::EventType;
    use courier_transport::memory::{self, MemoryPeer};
    use courier_transport::{FrameSink, TransportError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(1);

    type Hook = Box<dyn FnOnce() + Send>;

    /// Memory store that records status writes and can be made to fail.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        fail: AtomicBool,
        status_writes: Mutex<Vec<(MessageId, MessageStatus)>>,
        /// Runs once, just before an acknowledgment is flagged pending.
        before_ack_pending: Mutex<Option<Hook>>,
    }

    /// Sink whose peer never reads.
    struct StalledSink;

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn send(&mut self, _frame: &Frame) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    impl RecordingStore {
        fn check(&self) -> StoreResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("injected failure".into()));
            }
            Ok(())
        }

        fn writes_for(&self, id: MessageId) -> Vec<MessageStatus> {
            self.status_writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(written, _)| *written == id)
                .map(|(_, status)| *status)
                .collect()
        }
    }

    #[async_trait]
    impl MessageStore for RecordingStore {
        async fn save(&self, message: &Message) -> StoreResult<MessageId> {
            self.check()?;
            self.inner.save(message).await
        }
        async fn get(&self, id: MessageId) -> StoreResult<Message> {
            self.check()?;
            self.inner.get(id).await
        }
        async fn list_undelivered(&self, receiver_id: &str, since: u64) -> StoreResult<Vec<Message>> {
            self.check()?;
            self.inner.list_undelivered(receiver_id, since).await
        }
        async fn list_pending_acknowledgments(&self, identity: &str) -> StoreResult<Vec<Message>> {
            self.check()?;
            self.inner.list_pending_acknowledgments(identity).await
        }
        async fn update_status(&self, id: MessageId, status: MessageStatus) -> StoreResult<bool> {
            self.check()?;
            self.status_writes.lock().unwrap().push((id, status));
            self.inner.update_status(id, status).await
        }
        async fn mark_delivered(&self, id: MessageId) -> StoreResult<()> {
            self.check()?;
            self.inner.mark_delivered(id).await
        }
        async fn set_ack_pending(&self, id: MessageId, pending: bool) -> StoreResult<()> {
            self.check()?;
            if pending {
                let hook = self.before_ack_pending.lock().unwrap().take();
                if let Some(hook) = hook {
                    hook();
                }
            }
            self.inner.set_ack_pending(id, pending).await
        }
        async fn history(
            &self,
            a: &str,
            b: &str,
            limit: usize,
            offset: usize,
        ) -> StoreResult<Vec<Message>> {
            self.check()?;
            self.inner.history(a, b, limit, offset).await
        }
    }

    fn engine_with(capacity: usize) -> (Arc<DeliveryEngine>, Arc<RecordingStore>) {
        let store = Arc::new(RecordingStore::default());
        let config = EngineConfig {
            mailbox_capacity: capacity,
            sweep_enqueue_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let engine = Arc::new(DeliveryEngine::new(store.clone(), config));
        (engine, store)
    }

    fn connect(engine: &DeliveryEngine, identity: &str) -> (Arc<Connection>, MemoryPeer) {
        let (sink, _source, peer) = memory::channel();
        let (connection, _drain) =
            Connection::open(identity, Box::new(sink), engine.config().mailbox_capacity);
        engine.registry().register(Arc::clone(&connection));
        (connection, peer)
    }

    async fn status_of(store: &RecordingStore, id: MessageId) -> MessageStatus {
        store.inner.get(id).await.unwrap().status
    }

    #[tokio::test]
    async fn test_live_send_marks_sent() {
        let (engine, store) = engine_with(8);
        let (_s, mut sender) = connect(&engine, "S");
        let (_r, mut receiver) = connect(&engine, "R");

        let frame = Frame::send_message("R", "hi").with_temp_id("t1");
        let outcome = engine.handle_send("S", frame).await.unwrap();
        assert_eq!(outcome.delivery, Delivery::Live);
        assert_eq!(outcome.sender_notified, Delivery::Live);
        assert_eq!(status_of(&store, outcome.id).await, MessageStatus::Sent);

        let ack = sender.recv_timeout(WAIT).await.unwrap();
        assert_eq!(ack.event_type, EventType::Acknowledgment);
        assert_eq!(ack.status, Some(MessageStatus::Stored));
        assert_eq!(ack.temp_id.as_deref(), Some("t1"));
        assert_eq!(ack.id, Some(outcome.id));

        let delivered = receiver.recv_timeout(WAIT).await.unwrap();
        assert_eq!(delivered.event_type, EventType::ReceiveMessage);
        assert_eq!(delivered.id, Some(outcome.id));
        assert_eq!(delivered.sender_id, "S");
        assert_eq!(delivered.content.as_deref(), Some("hi"));
        assert_eq!(delivered.temp_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_offline_receiver_gets_backlog_in_order() {
        let (engine, store) = engine_with(8);

        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            let outcome = engine
                .handle_send("S", Frame::send_message("R", text))
                .await
                .unwrap();
            assert_eq!(outcome.delivery, Delivery::Deferred);
            assert_eq!(status_of(&store, outcome.id).await, MessageStatus::Stored);
            ids.push(outcome.id);
        }

        let (_r, mut receiver) = connect(&engine, "R");
        let report = engine.sweep("R").await;
        assert_eq!(report.redelivered, 3);
        assert_eq!(report.undelivered_remaining, 0);

        for (expected, text) in ids.iter().zip(["one", "two", "three"]) {
            let frame = receiver.recv_timeout(WAIT).await.unwrap();
            assert_eq!(frame.id, Some(*expected));
            assert_eq!(frame.content.as_deref(), Some(text));
            assert_eq!(frame.status, Some(MessageStatus::Stored));
            assert_eq!(status_of(&store, *expected).await, MessageStatus::Sent);
        }
    }

    #[tokio::test]
    async fn test_ack_round_trip_echoes_temp_id() {
        let (engine, store) = engine_with(8);
        let (_s, mut sender) = connect(&engine, "S");
        let (_r, mut receiver) = connect(&engine, "R");

        let outcome = engine
            .handle_send("S", Frame::send_message("R", "hi").with_temp_id("t1"))
            .await
            .unwrap();
        let _stored_ack = sender.recv_timeout(WAIT).await.unwrap();
        let delivered = receiver.recv_timeout(WAIT).await.unwrap();

        let ack = engine
            .handle_ack("R", Frame::ack_received(delivered.id.unwrap()))
            .await
            .unwrap();
        assert_eq!(
            ack,
            AckOutcome::Acknowledged {
                id: outcome.id,
                sender_notified: Delivery::Live
            }
        );

        let frame = sender.recv_timeout(WAIT).await.unwrap();
        assert_eq!(frame.event_type, EventType::Acknowledgment);
        assert_eq!(frame.status, Some(MessageStatus::Received));
        assert_eq!(frame.temp_id.as_deref(), Some("t1"));
        assert!(frame.delivered_at.is_some());

        let stored = store.inner.get(outcome.id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Received);
        assert!(stored.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_replayed_ack_is_idempotent() {
        let (engine, store) = engine_with(8);
        let (_s, mut sender) = connect(&engine, "S");
        let (_r, _receiver) = connect(&engine, "R");

        let outcome = engine
            .handle_send("S", Frame::send_message("R", "hi"))
            .await
            .unwrap();
        let _stored_ack = sender.recv_timeout(WAIT).await.unwrap();

        engine
            .handle_ack("R", Frame::ack_received(outcome.id))
            .await
            .unwrap();
        let _received_ack = sender.recv_timeout(WAIT).await.unwrap();

        let again = engine
            .handle_ack("R", Frame::ack_received(outcome.id))
            .await
            .unwrap();
        assert_eq!(again, AckOutcome::Duplicate { id: outcome.id });
        assert_eq!(status_of(&store, outcome.id).await, MessageStatus::Received);
        assert!(sender.recv_timeout(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_ack_on_stored_message_passes_through_sent() {
        let (engine, store) = engine_with(8);

        let outcome = engine
            .handle_send("S", Frame::send_message("R", "hi"))
            .await
            .unwrap();
        assert_eq!(status_of(&store, outcome.id).await, MessageStatus::Stored);

        engine
            .handle_ack("R", Frame::ack_received(outcome.id))
            .await
            .unwrap();

        assert_eq!(
            store.writes_for(outcome.id),
            vec![MessageStatus::Sent, MessageStatus::Received]
        );
        assert_eq!(status_of(&store, outcome.id).await, MessageStatus::Received);
    }

    #[tokio::test]
    async fn test_ack_from_other_identity_is_rejected() {
        let (engine, store) = engine_with(8);
        let outcome = engine
            .handle_send("S", Frame::send_message("R", "hi"))
            .await
            .unwrap();

        let err = engine
            .handle_ack("M", Frame::ack_received(outcome.id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotRecipient { .. }));
        assert_eq!(status_of(&store, outcome.id).await, MessageStatus::Stored);
    }

    #[tokio::test]
    async fn test_invalid_frames_rejected() {
        let (engine, store) = engine_with(8);

        let err = engine
            .handle_send("S", Frame::send_message("", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_frame");

        let err = engine
            .handle_send("S", Frame::send_message("R", ""))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_frame");

        let mut ack = Frame::ack_received(1);
        ack.id = None;
        assert!(engine.handle_ack("R", ack).await.is_err());

        let err = engine
            .handle_ack("R", Frame::ack_received(404))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_message");
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn test_file_only_message_accepted() {
        let (engine, store) = engine_with(8);
        let frame = Frame::send_message("R", "").with_file_url("https://files/1.png");

        let outcome = engine.handle_send("S", frame).await.unwrap();
        let stored = store.inner.get(outcome.id).await.unwrap();
        assert_eq!(stored.content, "");
        assert_eq!(stored.file_url.as_deref(), Some("https://files/1.png"));
    }

    #[tokio::test]
    async fn test_store_failure_aborts_send() {
        let (engine, store) = engine_with(8);
        let (_r, mut receiver) = connect(&engine, "R");
        store.fail.store(true, Ordering::SeqCst);

        let err = engine
            .handle_send("S", Frame::send_message("R", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Backend(_))));
        assert!(receiver.recv_timeout(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_full_mailbox_falls_back_to_stored() {
        let (engine, store) = engine_with(1);
        let (_r, _receiver) = connect(&engine, "R");

        // The drain task never gets to run between these calls
        let first = engine
            .handle_send("S", Frame::send_message("R", "one"))
            .await
            .unwrap();
        let second = engine
            .handle_send("S", Frame::send_message("R", "two"))
            .await
            .unwrap();

        assert_eq!(first.delivery, Delivery::Live);
        assert_eq!(second.delivery, Delivery::Deferred);
        assert_eq!(status_of(&store, first.id).await, MessageStatus::Sent);
        assert_eq!(status_of(&store, second.id).await, MessageStatus::Stored);
    }

    #[tokio::test]
    async fn test_pending_ack_replayed_on_sender_reconnect() {
        let (engine, store) = engine_with(8);
        let (_r, mut receiver) = connect(&engine, "R");

        // Sender is offline for the whole exchange
        let outcome = engine
            .handle_send("S", Frame::send_message("R", "hi").with_temp_id("t1"))
            .await
            .unwrap();
        assert_eq!(outcome.sender_notified, Delivery::Deferred);
        let delivered = receiver.recv_timeout(WAIT).await.unwrap();

        let ack = engine
            .handle_ack("R", Frame::ack_received(delivered.id.unwrap()))
            .await
            .unwrap();
        assert_eq!(
            ack,
            AckOutcome::Acknowledged {
                id: outcome.id,
                sender_notified: Delivery::Deferred
            }
        );
        assert!(store.inner.get(outcome.id).await.unwrap().ack_pending);

        let (_s, mut sender) = connect(&engine, "S");
        let report = engine.sweep("S").await;
        assert_eq!(report.acks_delivered, 1);

        let frame = sender.recv_timeout(WAIT).await.unwrap();
        assert_eq!(frame.event_type, EventType::Acknowledgment);
        assert_eq!(frame.status, Some(MessageStatus::Received));
        assert_eq!(frame.temp_id.as_deref(), Some("t1"));

        let stored = store.inner.get(outcome.id).await.unwrap();
        assert!(!stored.ack_pending);
        assert_eq!(stored.status, MessageStatus::Received);
    }

    #[tokio::test]
    async fn test_sweep_skips_messages_outside_window() {
        let (engine, store) = engine_with(8);

        let mut ancient = Message::new("S", "R", "ancient");
        ancient.created_at = 1;
        let ancient_id = store.inner.save(&ancient).await.unwrap();
        let recent = engine
            .handle_send("S", Frame::send_message("R", "recent"))
            .await
            .unwrap();

        let (_r, mut receiver) = connect(&engine, "R");
        let report = engine.sweep("R").await;
        assert_eq!(report.redelivered, 1);
        assert_eq!(receiver.recv_timeout(WAIT).await.unwrap().id, Some(recent.id));
        assert_eq!(status_of(&store, ancient_id).await, MessageStatus::Stored);
    }

    #[tokio::test]
    async fn test_sweep_on_closed_connection_leaves_backlog() {
        let (engine, store) = engine_with(8);
        let outcome = engine
            .handle_send("S", Frame::send_message("R", "hi"))
            .await
            .unwrap();

        let (connection, _receiver) = connect(&engine, "R");
        connection.close();

        let report = engine.sweep("R").await;
        assert_eq!(report.redelivered, 0);
        assert_eq!(report.undelivered_remaining, 1);
        assert_eq!(status_of(&store, outcome.id).await, MessageStatus::Stored);
    }

    #[tokio::test]
    async fn test_sweep_stops_at_full_mailbox() {
        let store = Arc::new(RecordingStore::default());
        let config = EngineConfig {
            mailbox_capacity: 1,
            sweep_enqueue_timeout: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        let engine = DeliveryEngine::new(store.clone(), config);
        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            let outcome = engine
                .handle_send("S", Frame::send_message("R", text))
                .await
                .unwrap();
            ids.push(outcome.id);
        }

        // The drain takes "one" and blocks on the socket; "two" fills the
        // single slot; "three" cannot be queued before the timeout
        let (connection, _drain) = Connection::open("R", Box::new(StalledSink), 1);
        engine.registry().register(connection);

        let report = engine.sweep("R").await;

        assert_eq!(report.redelivered, 2);
        assert_eq!(report.undelivered_remaining, 1);
        assert_eq!(status_of(&store, ids[0]).await, MessageStatus::Sent);
        assert_eq!(status_of(&store, ids[1]).await, MessageStatus::Sent);
        assert_eq!(status_of(&store, ids[2]).await, MessageStatus::Stored);
    }

    #[tokio::test]
    async fn test_sender_connecting_during_ack_is_notified() {
        let (engine, store) = engine_with(8);
        let (sink, _source, mut sender) = memory::channel();
        let (connection, _drain) = Connection::open("S", Box::new(sink), 8);

        // "S" registers between the failed lookup and the pending flag
        let registry = Arc::clone(engine.registry());
        *store.before_ack_pending.lock().unwrap() = Some(Box::new(move || {
            registry.register(connection);
        }));

        let outcome = engine
            .handle_send("S", Frame::send_message("R", "hi").with_temp_id("t1"))
            .await
            .unwrap();
        assert_eq!(outcome.sender_notified, Delivery::Live);

        let ack = sender.recv_timeout(WAIT).await.unwrap();
        assert_eq!(ack.status, Some(MessageStatus::Stored));
        assert_eq!(ack.temp_id.as_deref(), Some("t1"));
        assert!(!store.inner.get(outcome.id).await.unwrap().ack_pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_and_acks() {
        const COUNT: usize = 32;
        let (engine, store) = engine_with(2 * COUNT);
        let (_s, _sender) = connect(&engine, "S");
        let (_r, mut receiver) = connect(&engine, "R");

        let acker = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let mut acks = Vec::new();
                for _ in 0..COUNT {
                    let frame = receiver.recv_timeout(WAIT).await.unwrap();
                    let engine = Arc::clone(&engine);
                    acks.push(tokio::spawn(async move {
                        engine
                            .handle_ack("R", Frame::ack_received(frame.id.unwrap()))
                            .await
                    }));
                }
                acks
            })
        };

        let sends: Vec<_> = (0..COUNT)
            .map(|i| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine
                        .handle_send("S", Frame::send_message("R", format!("m{i}")))
                        .await
                })
            })
            .collect();

        let mut ids = Vec::new();
        for send in sends {
            let outcome = send.await.unwrap().unwrap();
            assert_eq!(outcome.delivery, Delivery::Live);
            ids.push(outcome.id);
        }
        for ack in acker.await.unwrap() {
            assert!(matches!(
                ack.await.unwrap().unwrap(),
                AckOutcome::Acknowledged { .. }
            ));
        }

        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), COUNT);
        for id in ids {
            let message = store.inner.get(id).await.unwrap();
            assert_eq!(message.status, MessageStatus::Received);
            assert!(message.delivered_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_sweep_for_offline_identity_is_empty() {
        let (engine, _store) = engine_with(8);
        assert_eq!(engine.sweep("nobody").await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_on_connect_runs_in_background() {
        let (engine, store) = engine_with(8);
        let outcome = engine
            .handle_send("S", Frame::send_message("R", "hi"))
            .await
            .unwrap();

        let (_r, mut receiver) = connect(&engine, "R");
        let report = engine.on_connect("R").await.unwrap();
        assert_eq!(report.redelivered, 1);
        assert_eq!(receiver.recv_timeout(WAIT).await.unwrap().id, Some(outcome.id));
        assert_eq!(status_of(&store, outcome.id).await, MessageStatus::Sent);
    }
}
