//! Core traits for transports and durable storage.

use std::fmt;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::SyncMessage;

/// Which concrete channel carried a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Same-origin publish/subscribe bus.
    Bus,
    /// Durable-storage change notifications.
    StorageEvents,
    /// Cross-frame message passing.
    Frames,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bus => "broadcast-bus",
            Self::StorageEvents => "storage-events",
            Self::Frames => "frames",
        };
        f.write_str(name)
    }
}

/// One inbound message and the transport that delivered it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub via: TransportKind,
    pub message: SyncMessage,
}

/// Shared inbound pipe every armed transport forwards into.
pub type InboundSink = mpsc::UnboundedSender<Delivery>;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
    #[error("Transport closed")]
    Closed,
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A concrete delivery channel between contexts.
///
/// Sends are fire-and-forget. `listen` spawns the forwarding task onto
/// the current Tokio runtime.
pub trait Transport: Send + Sync {
    /// Which channel this is.
    fn kind(&self) -> TransportKind;

    /// Deliver a message to every other reachable context.
    ///
    /// # Errors
    /// Returns error if the channel is closed or rejects the message.
    fn send(&self, message: &SyncMessage) -> Result<(), TransportError>;

    /// Start forwarding inbound messages into `sink`.
    ///
    /// # Errors
    /// Returns error if the transport is closed or already listening.
    fn listen(&self, sink: InboundSink) -> Result<(), TransportError>;

    /// Release channels and listeners. Safe to call more than once.
    fn close(&self);
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Quota exceeded writing {key}: {needed} bytes over a {quota} byte quota")]
    QuotaExceeded {
        key: String,
        needed: usize,
        quota: usize,
    },
    #[error("Storage unavailable")]
    Unavailable,
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Change notification fired by a write to a shared key-value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
    /// Handle that performed the write.
    pub writer: u64,
}

/// Stream of change notifications caused by other handles.
pub struct StorageWatcher {
    rx: broadcast::Receiver<StorageEvent>,
    own_writer: u64,
}

impl StorageWatcher {
    #[must_use]
    pub const fn new(rx: broadcast::Receiver<StorageEvent>, own_writer: u64) -> Self {
        Self { rx, own_writer }
    }

    /// Next event written by some other handle, or `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.writer == self.own_writer => {}
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Storage watcher lagged, {skipped} events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Synchronous string key-value store shared by the contexts of one origin.
///
/// Writes through one handle notify watchers of every other handle.
pub trait KvStore: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one.
    ///
    /// # Errors
    /// Returns error on quota exhaustion or if the store is unavailable.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a value. Deleting a missing key is not an error.
    ///
    /// # Errors
    /// Returns error if the store is unavailable.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Subscribe to writes made through other handles.
    fn watch(&self) -> StorageWatcher;
}
