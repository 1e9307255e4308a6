//! Cross-context store synchronization engine.
//!
//! Provides:
//! - `SyncContext` - Everything one context needs, built from its host capabilities
//! - `MessageRouter` - Throttled outbound path, deduplicating inbound path
//! - `SyncCoordinator` - Per-store callbacks and feedback-loop suppression
//! - `Scheduler` - The context's single-threaded job queue
//! - `ObservableStore` / `SyncedStore` - Reactive containers wired into sync

pub mod context;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod synced;

pub use context::{SyncContext, SyncContextBuilder};
pub use coordinator::{ChangeOutcome, RemoteUpdate, Subscription, SyncCoordinator};
pub use error::SyncError;
pub use router::{Admission, BroadcastOutcome, MessageRouter};
pub use scheduler::Scheduler;
pub use store::ObservableStore;
pub use synced::SyncedStore;
