//! # courier-core
//!
//! Real-time delivery for two-party conversations.
//!
//! - **Registry** - which identity is online, on which connection
//! - **Mailbox** - bounded per-connection outbound queue and its writer task
//! - **Engine** - live vs deferred delivery and the acknowledgment protocol
//! - **Dispatcher** - per-connection reader that feeds the engine
//! - **Store** - the persistence port, with an in-memory implementation
//!
//! ## Architecture
//!
//! ```text
//!              ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!  transport ─▶│ Dispatcher  │────▶│   Engine    │────▶│    Store    │
//!              └─────────────┘     └─────────────┘     └─────────────┘
//!                                         │
//!                                         ▼
//!                                  ┌─────────────┐     ┌─────────────┐
//!                                  │  Registry   │────▶│   Mailbox   │─▶ transport
//!                                  └─────────────┘     └─────────────┘
//! ```

pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod mailbox;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod store;

pub use connection::{Connection, Shutdown};
pub use dispatcher::{Dispatched, Dispatcher, SessionSummary};
pub use engine::{
    AckOutcome, Delivery, DeliveryEngine, EngineConfig, EngineError, SendOutcome, SweepReport,
};
pub use mailbox::{Enqueue, Mailbox, DEFAULT_MAILBOX_CAPACITY};
pub use memory::MemoryStore;
pub use message::{Identity, Message};
pub use registry::ConnectionRegistry;
pub use store::{MessageStore, StoreError, StoreResult};
