//! Bounded outbound mailboxes.
//!
//! Each live connection owns one mailbox: a bounded queue plus a drain task
//! that performs the actual network writes. Producers never wait on the
//! network; when the queue is full they are told so immediately.

use courier_protocol::Frame;
use courier_transport::FrameSink;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::connection::Shutdown;

/// Default mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 10;

/// Result of handing a frame to a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The frame is queued for writing.
    Accepted,
    /// The queue is at capacity.
    Full,
    /// The drain task has stopped.
    Closed,
}

impl Enqueue {
    /// Whether the frame was queued.
    #[must_use]
    pub fn is_accepted(self) -> bool {
        self == Enqueue::Accepted
    }
}

/// Producer side of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: mpsc::Sender<Frame>,
    capacity: usize,
}

impl Mailbox {
    /// Create a mailbox and spawn its drain task.
    ///
    /// The drain task writes queued frames to `sink` in FIFO order. It stops
    /// when `shutdown` fires or on the first write failure, and in the latter
    /// case fires `shutdown` itself so the rest of the connection tears down.
    pub fn spawn(
        label: impl Into<String>,
        sink: Box<dyn FrameSink>,
        capacity: usize,
        shutdown: Shutdown,
    ) -> (Self, JoinHandle<()>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let task = tokio::spawn(drain(label.into(), rx, sink, shutdown));
        (Self { tx, capacity }, task)
    }

    /// Queue a frame without waiting.
    pub fn enqueue(&self, frame: Frame) -> Enqueue {
        match self.tx.try_send(frame) {
            Ok(()) => Enqueue::Accepted,
            Err(TrySendError::Full(_)) => Enqueue::Full,
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Queue a frame, waiting up to `timeout` for capacity.
    ///
    /// Only for background work; request paths use [`Mailbox::enqueue`].
    pub async fn enqueue_timeout(&self, frame: Frame, timeout: Duration) -> Enqueue {
        match self.tx.send_timeout(frame, timeout).await {
            Ok(()) => Enqueue::Accepted,
            Err(SendTimeoutError::Timeout(_)) => Enqueue::Full,
            Err(SendTimeoutError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Number of frames waiting to be written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Whether no frames are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued frames.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the drain task has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn drain(
    label: String,
    mut rx: mpsc::Receiver<Frame>,
    mut sink: Box<dyn FrameSink>,
    shutdown: Shutdown,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            next = rx.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };

        trace!(connection = %label, event = %frame.event_type, "Writing frame");
        if let Err(e) = sink.send(&frame).await {
            warn!(connection = %label, error = %e, "Write failed, closing connection");
            break;
        }
    }

    rx.close();
    shutdown.trigger();
    if let Err(e) = sink.close().await {
        debug!(connection = %label, error = %e, "Error closing transport");
    }
    debug!(connection = %label, "Mailbox drained");
}
