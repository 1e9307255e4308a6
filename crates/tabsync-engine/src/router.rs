//! Outbound and inbound message pipeline.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tabsync_core::{Clock, OriginId, SyncConfig, SyncMessage};
use tabsync_transport::TransportSelector;
use tokio::task::JoinHandle;

use crate::{SyncError, dedup::RecentKeys};

/// What happened to one `broadcast` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// Opened a throttle window; the snapshot goes out when it closes.
    Scheduled,
    /// Replaced the pending snapshot of an open window.
    Coalesced,
    /// The router is shut down.
    Dropped,
}

/// Verdict on one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New message from another context; apply it.
    Accept,
    /// Sent by this very context.
    SelfEcho,
    /// Same store and timestamp already processed within the window.
    Duplicate,
}

/// Per-store send and receive bookkeeping.
struct Lane {
    last_send_time: Option<u64>,
    pending: Option<Value>,
    flush: Option<JoinHandle<()>>,
    recent: RecentKeys,
}

impl Lane {
    fn new(config: &SyncConfig) -> Self {
        Self {
            last_send_time: None,
            pending: None,
            flush: None,
            recent: RecentKeys::new(config.dedup_window_ms, config.dedup_capacity),
        }
    }
}

/// Owns the single message pipeline of one context.
///
/// Outbound: encode, coalesce within the throttle window, stamp with
/// timestamp and origin, fan out. Inbound: drop self echoes and
/// duplicates, record the dedup key.
pub struct MessageRouter {
    origin_id: OriginId,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    selector: TransportSelector,
    lanes: Mutex<HashMap<String, Lane>>,
    shut_down: AtomicBool,
    self_ref: Weak<Self>,
}

impl MessageRouter {
    #[must_use]
    pub fn new(
        origin_id: OriginId,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
        selector: TransportSelector,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            origin_id,
            clock,
            config,
            selector,
            lanes: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    #[must_use]
    pub const fn origin_id(&self) -> &OriginId {
        &self.origin_id
    }

    #[must_use]
    pub const fn selector(&self) -> &TransportSelector {
        &self.selector
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Encode `data` as plain data.
    ///
    /// # Errors
    /// Returns [`SyncError::NotPlainData`] if `data` cannot be represented.
    pub fn encode<T: Serialize + ?Sized>(data: &T) -> Result<Value, SyncError> {
        SyncMessage::encode_payload(data).map_err(SyncError::NotPlainData)
    }

    /// Broadcast a snapshot of `store` to every other context.
    ///
    /// Must be called inside a Tokio runtime; the flush timer is a spawned task.
    ///
    /// # Errors
    /// Returns error if `data` is not plain data; nothing is queued then.
    pub fn broadcast<T: Serialize + ?Sized>(
        &self,
        store: &str,
        data: &T,
    ) -> Result<BroadcastOutcome, SyncError> {
        let payload = Self::encode(data).inspect_err(|e| {
            tracing::error!("Skipping broadcast of {store}: {e}");
        })?;
        Ok(self.broadcast_value(store, payload))
    }

    /// Broadcast an already encoded snapshot.
    ///
    /// Calls within one throttle window collapse into a single message
    /// carrying the latest snapshot, sent when the window closes.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn broadcast_value(&self, store: &str, payload: Value) -> BroadcastOutcome {
        if self.is_shut_down() {
            return BroadcastOutcome::Dropped;
        }

        let mut lanes = self.lanes.lock();
        let lane = lanes
            .entry(store.to_string())
            .or_insert_with(|| Lane::new(&self.config));
        lane.pending = Some(payload);

        if lane.flush.is_some() {
            tracing::trace!("Coalescing {store} update into pending broadcast");
            return BroadcastOutcome::Coalesced;
        }

        let router = self.self_ref.clone();
        let name = store.to_string();
        let window = self.config.throttle_window();
        lane.flush = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(router) = router.upgrade() {
                router.flush(&name);
            }
        }));
        BroadcastOutcome::Scheduled
    }

    fn flush(&self, store: &str) {
        let payload = {
            let mut lanes = self.lanes.lock();
            let Some(lane) = lanes.get_mut(store) else {
                return;
            };
            lane.flush = None;
            lane.pending.take()
        };
        let Some(payload) = payload else {
            return;
        };
        if self.is_shut_down() {
            return;
        }

        let now = self.clock.now_millis();
        let message = SyncMessage::store_update(store, payload, now, self.origin_id.clone());
        let accepted = self.selector.send(&message);
        if let Some(lane) = self.lanes.lock().get_mut(store) {
            lane.last_send_time = Some(now);
        }
        tracing::debug!(store, timestamp = now, transports = accepted, "Broadcast sent");
    }

    /// Decide whether an inbound message should be applied.
    ///
    /// Accepting records the dedup key, so a second delivery of the same
    /// message over another transport is reported as a duplicate.
    pub fn admit(&self, message: &SyncMessage) -> Admission {
        if message.origin_id() == &self.origin_id {
            tracing::trace!("Ignoring own {} message", message.store_name());
            return Admission::SelfEcho;
        }

        let now = self.clock.now_millis();
        let (store, timestamp) = message.dedup_key();
        let mut lanes = self.lanes.lock();
        let lane = lanes
            .entry(store)
            .or_insert_with(|| Lane::new(&self.config));
        if lane.recent.insert(timestamp, now) {
            Admission::Accept
        } else {
            tracing::debug!(store = message.store_name(), timestamp, "Dropping duplicate message");
            Admission::Duplicate
        }
    }

    /// Timestamp of the last message actually sent for `store`.
    #[must_use]
    pub fn last_send_time(&self, store: &str) -> Option<u64> {
        self.lanes.lock().get(store).and_then(|l| l.last_send_time)
    }

    /// Whether a snapshot of `store` is waiting for its window to close.
    #[must_use]
    pub fn has_pending(&self, store: &str) -> bool {
        self.lanes
            .lock()
            .get(store)
            .is_some_and(|l| l.pending.is_some())
    }

    /// Cancel pending broadcasts and release every transport.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for lane in self.lanes.lock().values_mut() {
            if let Some(flush) = lane.flush.take() {
                flush.abort();
            }
            lane.pending = None;
        }
        self.selector.destroy();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use serde_json::json;
    use tabsync_core::{Delivery, ManualClock, SystemClock};
    use tabsync_transport::{BroadcastHub, HostEnvironment};
    use tokio::sync::mpsc;

    use super::*;

    fn router_on(hub: &BroadcastHub) -> Arc<MessageRouter> {
        let config = SyncConfig::default();
        let origin = OriginId::generate();
        let selector =
            TransportSelector::new(&HostEnvironment::new().with_bus(hub.clone()), &config, &origin);
        MessageRouter::new(origin, Arc::new(SystemClock::new()), config, selector)
    }

    fn listen(router: &MessageRouter) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        router.selector().on_message(move |d| {
            let _ = tx.send(d);
        });
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_last_snapshot() {
        let hub = BroadcastHub::new();
        let sender = router_on(&hub);
        let receiver = router_on(&hub);
        let mut inbound = listen(&receiver);

        assert_eq!(
            sender.broadcast("player", &json!({"volume": 0})).unwrap(),
            BroadcastOutcome::Scheduled
        );
        for volume in 1..10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(
                sender.broadcast("player", &json!({"volume": volume})).unwrap(),
                BroadcastOutcome::Coalesced
            );
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        let first = inbound.try_recv().unwrap();
        assert_eq!(first.message.payload(), &json!({"volume": 9}));
        assert!(inbound.try_recv().is_err());
        assert!(sender.last_send_time("player").is_some());
        assert!(!sender.has_pending("player"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_send_separately() {
        let hub = BroadcastHub::new();
        let sender = router_on(&hub);
        let receiver = router_on(&hub);
        let mut inbound = listen(&receiver);

        sender.broadcast("theme", &json!({"isDark": true})).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        sender.broadcast("theme", &json!({"isDark": false})).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(inbound.try_recv().unwrap().message.payload()["isDark"], true);
        assert_eq!(inbound.try_recv().unwrap().message.payload()["isDark"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stores_throttle_independently() {
        let hub = BroadcastHub::new();
        let sender = router_on(&hub);
        let receiver = router_on(&hub);
        let mut inbound = listen(&receiver);

        sender.broadcast("theme", &json!({"isDark": true})).unwrap();
        sender.broadcast("settings", &json!({"quality": "hires"})).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut stores = vec![
            inbound.try_recv().unwrap().message.store_name().to_string(),
            inbound.try_recv().unwrap().message.store_name().to_string(),
        ];
        stores.sort();
        assert_eq!(stores, vec!["settings", "theme"]);
    }

    #[tokio::test]
    async fn test_non_plain_data_is_rejected_without_sending() {
        let hub = BroadcastHub::new();
        let sender = router_on(&hub);

        let mut bad: HashMap<(u8, u8), u8> = HashMap::new();
        bad.insert((1, 1), 1);

        assert!(matches!(
            sender.broadcast("player", &bad),
            Err(SyncError::NotPlainData(_))
        ));
        assert!(!sender.has_pending("player"));
    }

    #[tokio::test]
    async fn test_admit_filters_self_and_duplicates() {
        let clock = Arc::new(ManualClock::new(10_000));
        let config = SyncConfig::default();
        let origin = OriginId::generate();
        let selector = TransportSelector::new(&HostEnvironment::new(), &config, &origin);
        let router = MessageRouter::new(origin.clone(), clock.clone(), config, selector);

        let own = SyncMessage::store_update("theme", json!({}), 1, origin);
        assert_eq!(router.admit(&own), Admission::SelfEcho);

        let remote = SyncMessage::store_update("theme", json!({}), 2, OriginId::generate());
        assert_eq!(router.admit(&remote), Admission::Accept);
        assert_eq!(router.admit(&remote), Admission::Duplicate);

        let other_store = SyncMessage::store_update("player", json!({}), 2, OriginId::generate());
        assert_eq!(router.admit(&other_store), Admission::Accept);

        clock.advance(1_000);
        assert_eq!(router.admit(&remote), Admission::Accept);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending() {
        let hub = BroadcastHub::new();
        let sender = router_on(&hub);
        let receiver = router_on(&hub);
        let mut inbound = listen(&receiver);

        sender.broadcast("theme", &json!({"isDark": true})).unwrap();
        sender.shutdown();
        sender.shutdown();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(inbound.try_recv().is_err());
        assert_eq!(
            sender.broadcast("theme", &json!({})).unwrap(),
            BroadcastOutcome::Dropped
        );
    }
}
