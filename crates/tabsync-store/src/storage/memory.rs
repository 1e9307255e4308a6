//! In-memory origin storage.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tabsync_core::{KvStore, StorageError, StorageEvent, StorageWatcher};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

struct Shared {
    entries: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
    next_writer: AtomicU64,
    available: AtomicBool,
    quota_bytes: Option<usize>,
}

/// In-memory key-value store shared by every context of one origin.
///
/// Each context gets its own handle via [`MemoryStorage::handle`]; a write
/// through one handle fires a [`StorageEvent`] for the watchers of all the
/// others. Data is lost when the last handle is dropped.
pub struct MemoryStorage {
    shared: Arc<Shared>,
    writer: u64,
}

impl MemoryStorage {
    /// Create a new, unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a store that rejects writes once keys plus values exceed `bytes`.
    #[must_use]
    pub fn with_quota(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(quota_bytes: Option<usize>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(HashMap::new()),
                events,
                next_writer: AtomicU64::new(1),
                available: AtomicBool::new(true),
                quota_bytes,
            }),
            writer: 0,
        }
    }

    /// Another handle onto the same data, as seen by a different context.
    #[must_use]
    pub fn handle(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            writer: self.shared.next_writer.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Toggle availability; every operation fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::Release);
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.shared.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::Unavailable)
        }
    }

    fn notify(&self, key: &str, new_value: Option<String>) {
        let _ = self.shared.events.send(StorageEvent {
            key: key.to_string(),
            new_value,
            writer: self.writer,
        });
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn used_bytes(entries: &HashMap<String, String>) -> usize {
    entries.iter().map(|(k, v)| k.len() + v.len()).sum()
}

impl KvStore for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.ensure_available()?;
        Ok(self
            .shared
            .entries
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.ensure_available()?;
        {
            let mut entries = self
                .shared
                .entries
                .write()
                .map_err(|e| StorageError::Internal(e.to_string()))?;

            if entries.get(key).is_some_and(|old| old == value) {
                return Ok(());
            }

            if let Some(quota) = self.shared.quota_bytes {
                let replaced = entries.get(key).map_or(0, |old| key.len() + old.len());
                let needed = used_bytes(&entries) - replaced + key.len() + value.len();
                if needed > quota {
                    return Err(StorageError::QuotaExceeded {
                        key: key.to_string(),
                        needed,
                        quota,
                    });
                }
            }

            entries.insert(key.to_string(), value.to_string());
        }
        self.notify(key, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_available()?;
        let removed = self
            .shared
            .entries
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(key);
        if removed.is_some() {
            self.notify(key, None);
        }
        Ok(())
    }

    fn watch(&self) -> StorageWatcher {
        StorageWatcher::new(self.shared.events.subscribe(), self.writer)
    }
}
