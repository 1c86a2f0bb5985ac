//! WebSocket transport implementation.
//!
//! Wraps an upgraded axum [`WebSocket`] and splits it into a [`FrameSink`]
//! and a [`FrameSource`]. Text messages carry one JSON frame each; binary
//! messages carry length-prefixed MessagePack frames and may be split or
//! batched arbitrarily.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use courier_protocol::{codec, Frame, ProtocolError, WireFormat};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, trace, warn};

use crate::traits::{FrameSink, FrameSource, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Encoding for outbound frames.
    pub wire_format: WireFormat,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            wire_format: WireFormat::Json,
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// Split an upgraded socket into its write and read halves.
#[must_use]
pub fn split(
    socket: WebSocket,
    config: &WebSocketConfig,
    remote_addr: Option<String>,
) -> (WebSocketSink, WebSocketSource) {
    let (sink, stream) = socket.split();
    (
        WebSocketSink {
            sink,
            wire_format: config.wire_format,
            closed: false,
        },
        WebSocketSource {
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: config.max_message_size,
            remote_addr,
        },
    )
}

/// Write half of a WebSocket connection.
pub struct WebSocketSink {
    sink: SplitSink<WebSocket, Message>,
    wire_format: WireFormat,
    closed: bool,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match self.wire_format {
            WireFormat::Json => Message::Text(codec::encode_json(frame)?),
            WireFormat::MessagePack => Message::Binary(codec::encode(frame)?.to_vec()),
        };

        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}

/// Read half of a WebSocket connection.
pub struct WebSocketSource {
    stream: SplitStream<WebSocket>,
    read_buffer: BytesMut,
    max_message_size: usize,
    remote_addr: Option<String>,
}

impl WebSocketSource {
    /// Decode the next buffered binary frame.
    ///
    /// A length prefix that can never be satisfied leaves the buffer
    /// misaligned, so it is discarded along with whatever follows it.
    fn next_buffered(&mut self) -> Result<Option<Frame>, TransportError> {
        match codec::decode_from(&mut self.read_buffer) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                if !e.is_recoverable() {
                    self.read_buffer.clear();
                }
                Err(e.into())
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<(), TransportError> {
        if size > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                size, self.max_message_size
            );
            return Err(TransportError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        // Binary messages may have carried more than one frame
        if let Some(frame) = self.next_buffered()? {
            return Ok(Some(frame));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    // Each text message stands alone, so an oversized one is
                    // skipped like any other bad frame
                    return codec::decode_json(&text).map(Some).map_err(|e| match e {
                        ProtocolError::FrameTooLarge(size) => TransportError::MessageTooLarge {
                            size,
                            max: codec::MAX_FRAME_SIZE,
                        },
                        other => other.into(),
                    });
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = self.check_size(self.read_buffer.len() + data.len()) {
                        // The partial frame can never complete; drop it so
                        // the next message starts on a fresh prefix
                        self.read_buffer.clear();
                        return Err(e);
                    }
                    self.read_buffer.extend_from_slice(&data);

                    if let Some(frame) = self.next_buffered()? {
                        return Ok(Some(frame));
                    }
                    trace!(buffered = self.read_buffer.len(), "Partial binary frame");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pongs are answered by the protocol layer
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_config_default() {
        let config = WebSocketConfig::default();
        assert_eq!(config.wire_format, WireFormat::Json);
        assert_eq!(config.max_message_size, 64 * 1024);
    }
}
