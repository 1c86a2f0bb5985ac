//! In-process transport.
//!
//! [`channel`] returns the two server-side halves of a connection plus a
//! [`MemoryPeer`] that plays the client. Useful for exercising the delivery
//! engine without sockets.

use async_trait::async_trait;
use courier_protocol::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::traits::{FrameSink, FrameSource, TransportError};

type Inbound = Result<Frame, TransportError>;

/// Create a connected in-memory transport.
#[must_use]
pub fn channel() -> (MemorySink, MemorySource, MemoryPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let fail_writes = Arc::new(AtomicBool::new(false));
    let closed = Arc::new(AtomicBool::new(false));

    let sink = MemorySink {
        outbound: outbound_tx,
        fail_writes: Arc::clone(&fail_writes),
        closed: Arc::clone(&closed),
    };
    let source = MemorySource { inbound: inbound_rx };
    let peer = MemoryPeer {
        inbound: Some(inbound_tx),
        outbound: outbound_rx,
        fail_writes,
        closed,
    };

    (sink, source, peer)
}

/// Server-side write half.
#[derive(Debug)]
pub struct MemorySink {
    outbound: mpsc::UnboundedSender<Frame>,
    fail_writes: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("peer unreachable".into()));
        }
        self.outbound
            .send(frame.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Server-side read half.
#[derive(Debug)]
pub struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.inbound.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

/// Client side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbound: mpsc::UnboundedReceiver<Frame>,
    fail_writes: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Send a frame to the server. Returns `false` once disconnected.
    pub fn send(&self, frame: Frame) -> bool {
        self.push(Ok(frame))
    }

    /// Deliver a read error (or a malformed frame) to the server.
    pub fn send_error(&self, error: TransportError) -> bool {
        self.push(Err(error))
    }

    fn push(&self, item: Inbound) -> bool {
        self.inbound
            .as_ref()
            .map_or(false, |tx| tx.send(item).is_ok())
    }

    /// Receive the next frame the server wrote, waiting at most `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive a frame the server already wrote, without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }

    /// Make every subsequent server write fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Close the client side; the server's reader sees end of stream.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Whether the server closed its write half.
    #[must_use]
    pub fn is_closed_by_server(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
