//! Inbound dispatch.
//!
//! One [`Dispatcher::serve`] call runs per accepted connection. It owns the
//! read half of the transport, registers the connection, kicks off the
//! reconnect sweeps and then routes every inbound frame to the engine until
//! the peer goes away or the connection is superseded.

use crate::connection::Connection;
use crate::engine::{AckOutcome, DeliveryEngine, EngineError, SendOutcome};
use crate::message::Identity;
use crate::metrics;
use courier_protocol::{EventType, Frame};
use courier_transport::{ConnectionId, FrameSink, FrameSource};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What happened to a single inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A `send_message` was stored.
    Sent(SendOutcome),
    /// An `ack_received` was processed.
    Acked(AckOutcome),
    /// The frame was not meant for the server and was dropped.
    Ignored,
}

/// Summary of a finished connection.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Transport session ID.
    pub connection_id: ConnectionId,
    /// Frames handled successfully (including ignored ones).
    pub frames_handled: u64,
    /// Frames that failed to decode or were rejected by the engine.
    pub frames_rejected: u64,
}

/// Routes inbound frames from live connections to the delivery engine.
#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<DeliveryEngine>,
}

impl Dispatcher {
    /// Create a dispatcher over `engine`.
    #[must_use]
    pub fn new(engine: Arc<DeliveryEngine>) -> Self {
        Self { engine }
    }

    /// The engine frames are routed to.
    #[must_use]
    pub fn engine(&self) -> &Arc<DeliveryEngine> {
        &self.engine
    }

    /// Serve one connection for `identity` until it ends.
    ///
    /// Frames are handled strictly one at a time, in arrival order. A frame
    /// that is already being handled always runs to completion; the close
    /// signal is only observed between frames.
    pub async fn serve(
        &self,
        identity: impl Into<Identity>,
        sink: Box<dyn FrameSink>,
        mut source: Box<dyn FrameSource>,
    ) -> SessionSummary {
        let identity = identity.into();
        let remote = source.remote_addr().unwrap_or_else(|| "unknown".to_string());
        let (connection, drain) = Connection::open(
            identity.clone(),
            sink,
            self.engine.config().mailbox_capacity,
        );

        if self
            .engine
            .registry()
            .register(Arc::clone(&connection))
            .is_some()
        {
            metrics::record_superseded();
        }
        metrics::record_connection();
        info!(
            identity = %identity,
            connection = %connection.id(),
            remote = %remote,
            "Connection established"
        );

        self.engine.on_connect(&identity);

        let mut summary = SessionSummary {
            connection_id: connection.id().clone(),
            frames_handled: 0,
            frames_rejected: 0,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = connection.closed() => {
                    debug!(connection = %connection.id(), "Connection closed");
                    break;
                }
                next = source.recv() => next,
            };

            match next {
                Ok(Some(frame)) => {
                    let start = Instant::now();
                    let event = frame.event_type.clone();
                    metrics::record_frame(event.as_str());

                    match self.dispatch(&identity, frame).await {
                        Ok(_) => summary.frames_handled += 1,
                        Err(e) => {
                            summary.frames_rejected += 1;
                            metrics::record_error(e.kind());
                            warn!(
                                identity = %identity,
                                event = %event,
                                error = %e,
                                "Frame rejected"
                            );
                        }
                    }
                    metrics::record_latency(start.elapsed().as_secs_f64());
                }
                Ok(None) => {
                    debug!(connection = %connection.id(), "Peer disconnected");
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    summary.frames_rejected += 1;
                    metrics::record_error("decode");
                    warn!(connection = %connection.id(), error = %e, "Skipping malformed frame");
                }
                Err(e) => {
                    metrics::record_error("transport");
                    warn!(connection = %connection.id(), error = %e, "Read failed");
                    break;
                }
            }
        }

        self.engine.registry().remove_if_current(&connection);
        connection.close();
        if let Err(e) = drain.await {
            warn!(connection = %connection.id(), error = %e, "Mailbox task failed");
        }
        metrics::record_disconnection();

        info!(
            identity = %identity,
            connection = %connection.id(),
            handled = summary.frames_handled,
            rejected = summary.frames_rejected,
            "Connection closed"
        );
        summary
    }

    /// Route a single frame from `identity`.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for frames it rejects.
    pub async fn dispatch(&self, identity: &str, frame: Frame) -> Result<Dispatched, EngineError> {
        match frame.event_type {
            EventType::SendMessage => self
                .engine
                .handle_send(identity, frame)
                .await
                .map(Dispatched::Sent),
            EventType::AckReceived => self
                .engine
                .handle_ack(identity, frame)
                .await
                .map(Dispatched::Acked),
            EventType::ReceiveMessage | EventType::Acknowledgment => {
                warn!(identity = %identity, event = %frame.event_type, "Ignoring server-only event");
                Ok(Dispatched::Ignored)
            }
            EventType::Unknown(ref name) => {
                debug!(identity = %identity, event = %name, "Ignoring unknown event");
                Ok(Dispatched::Ignored)
            }
        }
    }
}
