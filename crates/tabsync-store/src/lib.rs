//! Durable storage for tabsync contexts.
//!
//! Provides:
//! - `PersistenceAdapter` - Load/save store snapshots merged over defaults
//! - Storage implementations (memory)

pub mod persist;
pub mod storage;

pub use persist::PersistenceAdapter;
#[cfg(feature = "memory")]
pub use storage::MemoryStorage;
