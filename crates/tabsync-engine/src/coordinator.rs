//! Per-store subscription registry and feedback-loop suppression.

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tabsync_core::Delivery;
use tabsync_store::PersistenceAdapter;

use crate::{Admission, BroadcastOutcome, MessageRouter, Scheduler, SyncError};

/// Callback applying a remote snapshot to the local store.
pub type RemoteUpdate = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// What happened to one local change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// The change was caused by applying a remote update; not re-sent.
    Suppressed,
    /// The change went to the outbound path.
    Broadcast {
        persisted: bool,
        outcome: BroadcastOutcome,
    },
}

#[derive(Default)]
struct StoreEntry {
    /// Remote applies in flight; non-zero means suppressed.
    suppressed: u32,
    callbacks: Vec<(u64, RemoteUpdate)>,
    persist_key: Option<String>,
}

/// Routes remote snapshots to stores and local changes to the router.
///
/// While a remote snapshot is being applied to a store, that store is
/// suppressed: local change notifications for it are dropped. The mark is
/// lifted by a job queued on the scheduler after the apply, so change
/// notifications the apply itself queued still see it.
pub struct SyncCoordinator {
    router: Arc<MessageRouter>,
    scheduler: Scheduler,
    persistence: Option<PersistenceAdapter>,
    stores: Mutex<HashMap<String, StoreEntry>>,
    next_id: AtomicU64,
    self_ref: Weak<Self>,
}

impl SyncCoordinator {
    #[must_use]
    pub fn new(
        router: Arc<MessageRouter>,
        scheduler: Scheduler,
        persistence: Option<PersistenceAdapter>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            router,
            scheduler,
            persistence,
            stores: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        })
    }

    /// Register a callback for remote updates of `store`.
    ///
    /// The callback stays registered until the returned handle is dropped.
    pub fn register<F>(&self, store: &str, on_remote_update: F) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_inner(store, None, Arc::new(on_remote_update))
    }

    /// Like [`register`](Self::register), also persisting every local
    /// change of `store` under `persist_key`.
    pub fn register_persisted<F>(
        &self,
        store: &str,
        persist_key: &str,
        on_remote_update: F,
    ) -> Subscription
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_inner(store, Some(persist_key), Arc::new(on_remote_update))
    }

    fn register_inner(
        &self,
        store: &str,
        persist_key: Option<&str>,
        callback: RemoteUpdate,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut stores = self.stores.lock();
        let entry = stores.entry(store.to_string()).or_default();
        entry.callbacks.push((id, callback));
        if let Some(key) = persist_key {
            if entry.persist_key.as_deref().is_some_and(|k| k != key) {
                tracing::warn!("Store {store} re-registered with persist key {key}");
            }
            entry.persist_key = Some(key.to_string());
        }
        drop(stores);

        tracing::debug!(store, "Registered sync callback");
        Subscription {
            coordinator: self.self_ref.clone(),
            store: store.to_string(),
            id,
            active: true,
        }
    }

    fn unregister(&self, store: &str, id: u64) {
        if let Some(entry) = self.stores.lock().get_mut(store) {
            entry.callbacks.retain(|(cid, _)| *cid != id);
        }
    }

    /// Whether `store` is currently applying a remote update.
    #[must_use]
    pub fn is_suppressed(&self, store: &str) -> bool {
        self.stores
            .lock()
            .get(store)
            .is_some_and(|e| e.suppressed > 0)
    }

    /// Propagate a local change of `store`.
    ///
    /// Dropped while the store is suppressed. Otherwise the snapshot is
    /// persisted (if the store has a persist key) and broadcast. Must be
    /// called inside a Tokio runtime.
    ///
    /// # Errors
    /// Returns error if `snapshot` is not plain data; nothing is persisted
    /// or sent then.
    pub fn notify_local_change<T: Serialize + ?Sized>(
        &self,
        store: &str,
        snapshot: &T,
    ) -> Result<ChangeOutcome, SyncError> {
        let persist_key = {
            let stores = self.stores.lock();
            let entry = stores.get(store);
            if entry.is_some_and(|e| e.suppressed > 0) {
                tracing::trace!(store, "Change caused by remote update, not re-broadcasting");
                return Ok(ChangeOutcome::Suppressed);
            }
            entry.and_then(|e| e.persist_key.clone())
        };

        let payload = MessageRouter::encode(snapshot).inspect_err(|e| {
            tracing::error!("Skipping sync of {store}: {e}");
        })?;

        let persisted = match (&self.persistence, persist_key) {
            (Some(persistence), Some(key)) => persistence.save(&key, &payload),
            _ => false,
        };
        let outcome = self.router.broadcast_value(store, payload);
        Ok(ChangeOutcome::Broadcast { persisted, outcome })
    }

    /// Inbound path: filter, then apply.
    pub fn receive(&self, delivery: Delivery) {
        let message = delivery.message;
        match self.router.admit(&message) {
            Admission::Accept => {
                tracing::trace!(
                    store = message.store_name(),
                    via = %delivery.via,
                    "Applying remote update"
                );
                self.apply_remote(message.store_name(), message.payload());
            }
            Admission::SelfEcho | Admission::Duplicate => {}
        }
    }

    /// Apply a remote snapshot to every callback of `store` under suppression.
    pub fn apply_remote(&self, store: &str, payload: &Value) {
        let callbacks: Vec<RemoteUpdate> = {
            let mut stores = self.stores.lock();
            let Some(entry) = stores.get_mut(store) else {
                tracing::trace!(store, "No subscribers for remote update");
                return;
            };
            entry.suppressed += 1;
            entry.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        for callback in callbacks {
            match std::panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Sync callback for {store} failed: {e:#}"),
                Err(_) => tracing::error!("Sync callback for {store} panicked"),
            }
        }

        let coordinator = self.self_ref.clone();
        let name = store.to_string();
        let queued = self.scheduler.defer(move || {
            if let Some(coordinator) = coordinator.upgrade() {
                coordinator.release(&name);
            }
        });
        if !queued {
            self.release(store);
        }
    }

    fn release(&self, store: &str) {
        if let Some(entry) = self.stores.lock().get_mut(store) {
            entry.suppressed = entry.suppressed.saturating_sub(1);
        }
    }

    #[must_use]
    pub const fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

/// Registration handle; dropping it removes the callback.
pub struct Subscription {
    coordinator: Weak<SyncCoordinator>,
    store: String,
    id: u64,
    active: bool,
}

impl Subscription {
    #[must_use]
    pub fn store(&self) -> &str {
        &self.store
    }

    /// Remove the callback now.
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    /// Keep the callback registered for the coordinator's lifetime.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn remove(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.unregister(&self.store, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use std::time::Duration;

    use serde_json::json;
    use tabsync_core::{KvStore, OriginId, SyncConfig, SyncMessage, SystemClock, TransportKind};
    use tabsync_store::MemoryStorage;
    use tabsync_transport::{BroadcastHub, HostEnvironment, TransportSelector};
    use tokio::sync::mpsc;

    use super::*;

    fn coordinator(storage: Option<Arc<MemoryStorage>>) -> Arc<SyncCoordinator> {
        coordinator_on(&HostEnvironment::new(), storage)
    }

    fn coordinator_on(
        host: &HostEnvironment,
        storage: Option<Arc<MemoryStorage>>,
    ) -> Arc<SyncCoordinator> {
        let config = SyncConfig::default();
        let origin = OriginId::generate();
        let selector = TransportSelector::new(host, &config, &origin);
        let router = MessageRouter::new(origin, Arc::new(SystemClock::new()), config, selector);
        let persistence = storage.map(|s| PersistenceAdapter::new(s));
        SyncCoordinator::new(router, Scheduler::spawn(), persistence)
    }

    fn remote(store: &str, ts: u64, payload: Value) -> Delivery {
        Delivery {
            via: TransportKind::Bus,
            message: SyncMessage::store_update(store, payload, ts, OriginId::generate()),
        }
    }

    #[tokio::test]
    async fn test_suppressed_until_next_turn() {
        let coord = coordinator(None);
        let seen = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let seen = Arc::clone(&seen);
            coord.register("theme", move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        coord.apply_remote("theme", &json!({"isDark": true}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(coord.is_suppressed("theme"));
        assert_eq!(
            coord.notify_local_change("theme", &json!({"isDark": true})).unwrap(),
            ChangeOutcome::Suppressed
        );

        coord.scheduler().flush().await;
        assert!(!coord.is_suppressed("theme"));
    }

    #[tokio::test]
    async fn test_suppression_is_per_store() {
        let coord = coordinator(None);
        let _a = coord.register("theme", |_| Ok(()));
        let _b = coord.register("player", |_| Ok(()));

        coord.apply_remote("theme", &json!({}));
        assert!(coord.is_suppressed("theme"));
        assert!(!coord.is_suppressed("player"));
        assert!(matches!(
            coord.notify_local_change("player", &json!({"volume": 1})).unwrap(),
            ChangeOutcome::Broadcast { .. }
        ));
    }

    #[tokio::test]
    async fn test_failing_callback_does_not_block_others() {
        let coord = coordinator(None);
        let reached = Arc::new(AtomicUsize::new(0));

        let _fails = coord.register("playlist", |_| Err(anyhow::anyhow!("bad payload")));
        let _panics = coord.register("playlist", |_| panic!("subscriber bug"));
        let _ok = {
            let reached = Arc::clone(&reached);
            coord.register("playlist", move |_| {
                reached.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        coord.receive(remote("playlist", 1, json!({"playlists": []})));
        coord.receive(remote("playlist", 2, json!({"playlists": []})));
        assert_eq!(reached.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_applies_once() {
        let coord = coordinator(None);
        let applied = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let applied = Arc::clone(&applied);
            coord.register("player", move |_| {
                applied.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        let first = remote("player", 77, json!({"volume": 0.5}));
        let mut second = first.clone();
        second.via = TransportKind::StorageEvents;

        coord.receive(first);
        coord.receive(second);
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_own_message_is_not_applied() {
        let coord = coordinator(None);
        let applied = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let applied = Arc::clone(&applied);
            coord.register("theme", move |_| {
                applied.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        let own = coord.router().origin_id().clone();
        coord.receive(Delivery {
            via: TransportKind::StorageEvents,
            message: SyncMessage::store_update("theme", json!({}), 5, own),
        });
        assert_eq!(applied.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_delivery() {
        let coord = coordinator(None);
        let applied = Arc::new(AtomicUsize::new(0));
        let sub = {
            let applied = Arc::clone(&applied);
            coord.register("theme", move |_| {
                applied.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };

        coord.receive(remote("theme", 1, json!({})));
        sub.unsubscribe();
        coord.receive(remote("theme", 2, json!({})));
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_change_persists_under_key() {
        let storage = Arc::new(MemoryStorage::new());
        let coord = coordinator(Some(Arc::clone(&storage)));
        let _sub = coord.register_persisted("settings", "music-player-settings", |_| Ok(()));

        let outcome = coord
            .notify_local_change("settings", &json!({"quality": "hires"}))
            .unwrap();
        assert_eq!(
            outcome,
            ChangeOutcome::Broadcast {
                persisted: true,
                outcome: BroadcastOutcome::Scheduled,
            }
        );

        assert_eq!(
            storage.get("music-player-settings").unwrap().as_deref(),
            Some(r#"{"quality":"hires"}"#)
        );
    }

    #[tokio::test]
    async fn test_suppressed_change_is_not_persisted() {
        let storage = Arc::new(MemoryStorage::new());
        let coord = coordinator(Some(Arc::clone(&storage)));
        let _sub = coord.register_persisted("settings", "music-player-settings", |_| Ok(()));

        coord.apply_remote("settings", &json!({"quality": "sky"}));
        coord
            .notify_local_change("settings", &json!({"quality": "sky"}))
            .unwrap();

        assert_eq!(storage.get("music-player-settings").unwrap(), None);
    }

    #[derive(Serialize)]
    struct Player {
        volume: f64,
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_finite_snapshot_is_neither_saved_nor_sent() {
        let hub = BroadcastHub::new();
        let storage = Arc::new(MemoryStorage::new());
        let coord = coordinator_on(
            &HostEnvironment::new().with_bus(hub.clone()),
            Some(Arc::clone(&storage)),
        );
        let _sub = coord.register_persisted("player", "music-player-player", |_| Ok(()));

        let peer_config = SyncConfig::default();
        let peer_origin = OriginId::generate();
        let peer = TransportSelector::new(
            &HostEnvironment::new().with_bus(hub),
            &peer_config,
            &peer_origin,
        );
        let (tx, mut inbound) = mpsc::unbounded_channel();
        peer.on_message(move |d| {
            let _ = tx.send(d);
        });

        let result = coord.notify_local_change("player", &Player { volume: f64::NAN });
        assert!(matches!(result, Err(SyncError::NotPlainData(_))));
        assert!(!coord.router().has_pending("player"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(inbound.try_recv().is_err());
        assert_eq!(storage.get("music-player-player").unwrap(), None);

        coord
            .notify_local_change("player", &Player { volume: 0.5 })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(inbound.try_recv().unwrap().message.payload(), &json!({"volume": 0.5}));
        assert_eq!(
            storage.get("music-player-player").unwrap().as_deref(),
            Some(r#"{"volume":0.5}"#)
        );
    }
}
