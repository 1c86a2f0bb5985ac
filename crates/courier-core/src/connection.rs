//! Live connections.
//!
//! A [`Connection`] ties an authenticated identity to a transport session and
//! its outbound [`Mailbox`]. Closing a connection only fires a signal; the
//! drain and reader tasks observe it and finish on their own, so closing
//! never blocks the caller.

use courier_protocol::Frame;
use courier_transport::{ConnectionId, FrameSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::mailbox::{Enqueue, Mailbox};
use crate::message::Identity;

/// One-shot, level-triggered close signal shared by a connection's tasks.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// A live transport session for one identity.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    mailbox: Mailbox,
    shutdown: Shutdown,
}

impl Connection {
    /// Open a connection over `sink`, spawning its mailbox drain task.
    pub fn open(
        identity: impl Into<Identity>,
        sink: Box<dyn FrameSink>,
        mailbox_capacity: usize,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let id = ConnectionId::generate();
        let shutdown = Shutdown::new();
        let (mailbox, drain) =
            Mailbox::spawn(id.to_string(), sink, mailbox_capacity, shutdown.clone());

        let connection = Arc::new(Self {
            id,
            identity: identity.into(),
            mailbox,
            shutdown,
        });
        (connection, drain)
    }

    /// Transport session ID.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Owning identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Outbound mailbox.
    #[must_use]
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Queue a frame for this peer without waiting.
    pub fn enqueue(&self, frame: Frame) -> Enqueue {
        if self.is_closed() {
            return Enqueue::Closed;
        }
        self.mailbox.enqueue(frame)
    }

    /// Queue a frame, waiting up to `timeout` for mailbox capacity.
    pub async fn enqueue_timeout(&self, frame: Frame, timeout: Duration) -> Enqueue {
        if self.is_closed() {
            return Enqueue::Closed;
        }
        self.mailbox.enqueue_timeout(frame, timeout).await
    }

    /// Ask the connection's tasks to stop. Returns immediately.
    pub fn close(&self) {
        self.shutdown.trigger();
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Wait until the connection is closed from any side.
    pub async fn closed(&self) {
        self.shutdown.wait().await;
    }
}
