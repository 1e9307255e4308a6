//! Core abstractions for cross-context state synchronization.
//!
//! This crate provides the fundamental building blocks:
//! - `SyncMessage` - The unit of propagation between contexts
//! - `OriginId` - Per-context sender identity
//! - `SyncConfig` - Tunable channel names and time windows
//! - `Clock` - Millisecond wall clock, swappable in tests
//! - `ensure_plain` - Rejects values JSON cannot carry losslessly
//! - Transport and key-value storage traits

pub mod clock;
pub mod config;
pub mod message;
pub mod plain;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use message::{FrameEnvelope, MessageKind, OriginId, SyncMessage};
pub use plain::ensure_plain;
pub use traits::{
    Delivery, InboundSink, KvStore, StorageError, StorageEvent, StorageWatcher, Transport,
    TransportError, TransportKind,
};
