//! # courier-protocol
//!
//! Wire protocol definitions for the Courier chat delivery engine.
//!
//! Frames are flat records tagged by `event_type`:
//!
//! - `send_message` / `ack_received` - sent by clients
//! - `receive_message` / `acknowledgment` - emitted by the server
//!
//! Unrecognized tags decode into [`EventType::Unknown`] instead of failing.
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Frame};
//!
//! let frame = Frame::send_message("bob", "hi").with_temp_id("t1");
//!
//! let text = codec::encode_json(&frame).unwrap();
//! let decoded = codec::decode_json(&text).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError, WireFormat};
pub use frames::{EventType, Frame, MessageId, MessageStatus};
