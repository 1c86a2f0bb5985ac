//! # courier-transport
//!
//! Transport abstraction layer for the Courier delivery engine.
//!
//! - **WebSocket** - axum upgrade, JSON text or MessagePack binary frames
//! - **Memory** - in-process channel pair for tests and embedding
//!
//! ## Transport Abstraction
//!
//! Every transport is split into a [`FrameSource`] (read by the connection's
//! dispatcher) and a [`FrameSink`] (written by its mailbox drain task).
//!
//! ```rust,ignore
//! use courier_transport::FrameSource;
//!
//! async fn read_all(mut source: Box<dyn FrameSource>) {
//!     while let Ok(Some(frame)) = source.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{ConnectionId, FrameSink, FrameSource, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketSink, WebSocketSource};
