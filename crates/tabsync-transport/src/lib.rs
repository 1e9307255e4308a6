//! Delivery channels between contexts.
//!
//! Provides:
//! - Broadcast bus (same-origin publish/subscribe)
//! - Storage-event side channel (fallback when no bus exists)
//! - Frame messaging (parent and child embedded frames)
//! - `TransportSelector` - Picks and arms the transports of one context

pub mod bus;
pub mod frame;
pub mod host;
pub mod selector;
pub mod storage_events;

pub use bus::{BroadcastHub, BusChannel, BusTransport};
pub use frame::{FrameError, FrameNode, FrameTransport};
pub use host::HostEnvironment;
pub use selector::{MessageHandler, TransportSelector};
pub use storage_events::StorageEventTransport;
