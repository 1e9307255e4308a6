//! Storage-event side channel.
//!
//! Writes the message under a fixed key and deletes it again shortly
//! after. Other contexts pick the message up from the change
//! notification, not from the stored value.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tabsync_core::{
    Delivery, InboundSink, KvStore, OriginId, SyncMessage, Transport, TransportError,
    TransportKind,
};
use tokio::task::JoinHandle;

/// Fallback transport over a shared [`KvStore`].
pub struct StorageEventTransport {
    storage: Arc<dyn KvStore>,
    key: String,
    cleanup_delay: Duration,
    origin_id: OriginId,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StorageEventTransport {
    #[must_use]
    pub fn new(
        storage: Arc<dyn KvStore>,
        key: impl Into<String>,
        cleanup_delay: Duration,
        origin_id: OriginId,
    ) -> Self {
        Self {
            storage,
            key: key.into(),
            cleanup_delay,
            origin_id,
            task: Mutex::new(None),
        }
    }

    fn schedule_cleanup(&self) {
        let storage = Arc::clone(&self.storage);
        let key = self.key.clone();
        let delay = self.cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = storage.remove(&key) {
                tracing::debug!("Failed to clear {key}: {e}");
            }
        });
    }
}

impl Transport for StorageEventTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StorageEvents
    }

    fn send(&self, message: &SyncMessage) -> Result<(), TransportError> {
        let text = message.to_json()?;
        self.storage.set(&self.key, &text)?;
        self.schedule_cleanup();
        Ok(())
    }

    fn listen(&self, sink: InboundSink) -> Result<(), TransportError> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(TransportError::Unavailable("already listening".to_string()));
        }

        let mut watcher = self.storage.watch();
        let key = self.key.clone();
        let own = self.origin_id.clone();
        *task = Some(tokio::spawn(async move {
            while let Some(event) = watcher.recv().await {
                if event.key != key {
                    continue;
                }
                let Some(text) = event.new_value else {
                    continue;
                };
                let message = match SyncMessage::from_json(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!("Failed to parse sync message from storage: {e}");
                        continue;
                    }
                };
                if message.origin_id() == &own {
                    continue;
                }
                let delivery = Delivery {
                    via: TransportKind::StorageEvents,
                    message,
                };
                if sink.send(delivery).is_err() {
                    break;
                }
            }
        }));
        drop(task);
        Ok(())
    }

    fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for StorageEventTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tabsync_store::MemoryStorage;
    use tokio::sync::mpsc;

    use super::*;

    const KEY: &str = "music-player-sync-message";

    fn transport(storage: MemoryStorage, origin: &OriginId) -> StorageEventTransport {
        StorageEventTransport::new(
            Arc::new(storage),
            KEY,
            Duration::from_millis(100),
            origin.clone(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_and_cleans_up() {
        let origin = MemoryStorage::new();
        let reader = origin.handle();
        let a_id = OriginId::generate();
        let a = transport(origin.handle(), &a_id);
        let b = transport(origin.handle(), &OriginId::generate());

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.listen(tx).unwrap();

        let msg = SyncMessage::store_update("settings", json!({"quality": "hires"}), 5, a_id);
        a.send(&msg).unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.via, TransportKind::StorageEvents);
        assert_eq!(got.message, msg);
        assert!(reader.get(KEY).unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(reader.get(KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_ignores_other_keys_and_garbage() {
        let origin = MemoryStorage::new();
        let writer = origin.handle();
        let b = transport(origin.handle(), &OriginId::generate());

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.listen(tx).unwrap();

        writer.set("theme", "dark").unwrap();
        writer.set(KEY, "{garbage").unwrap();
        let msg = SyncMessage::store_update("theme", json!({}), 9, OriginId::generate());
        writer.set(KEY, &msg.to_json().unwrap()).unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.message.timestamp(), 9);
    }

    #[tokio::test]
    async fn test_quota_failure_surfaces() {
        let origin = MemoryStorage::with_quota(8);
        let a = transport(origin.handle(), &OriginId::generate());
        let msg = SyncMessage::store_update("theme", json!({}), 1, OriginId::generate());
        let err = tokio_test::assert_err!(a.send(&msg));
        assert!(matches!(err, TransportError::Storage(_)));
    }
}
