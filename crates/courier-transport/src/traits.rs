//! Transport abstraction traits for Courier.
//!
//! A live connection is split into two halves: a [`FrameSource`] owned by the
//! connection's reader task and a [`FrameSink`] owned by its mailbox drain
//! task. Neither half is shared, so neither needs internal locking.

use async_trait::async_trait;
use courier_protocol::Frame;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Counter mixed into generated IDs so two connections accepted in the same
/// nanosecond still differ.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for one transport session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Message exceeds the configured size limit.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Observed size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] courier_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the reader can skip the offending frame and keep reading.
    ///
    /// Malformed and oversized frames are dropped; everything else means the
    /// transport itself is unusable.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Protocol(e) => e.is_recoverable(),
            TransportError::MessageTooLarge { .. } => true,
            _ => false,
        }
    }
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame to the peer.
    ///
    /// May suspend for as long as the peer is slow to read.
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Remote address of the peer, if known.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}
