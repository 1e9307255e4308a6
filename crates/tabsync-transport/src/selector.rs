//! Transport selection and fan-out.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::{Mutex, RwLock};
use tabsync_core::{
    Delivery, InboundSink, OriginId, SyncConfig, SyncMessage, Transport, TransportKind,
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{BusTransport, FrameTransport, HostEnvironment, StorageEventTransport};

/// Callback invoked once per inbound message.
pub type MessageHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Owns every armed transport of one context.
///
/// At construction the broadcast bus is preferred as primary transport;
/// without it the storage-event side channel takes over. The frame
/// transport is armed independently of that choice. All inbound traffic
/// is merged into one handler pipeline.
pub struct TransportSelector {
    primary: Option<Box<dyn Transport>>,
    failover: Option<StorageEventTransport>,
    frames: Option<FrameTransport>,
    handlers: Arc<RwLock<Vec<MessageHandler>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl TransportSelector {
    /// Select and arm transports for a context.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(host: &HostEnvironment, config: &SyncConfig, origin_id: &OriginId) -> Self {
        let (sink, inbound) = mpsc::unbounded_channel();

        let primary = Self::arm_bus(host, config, &sink)
            .or_else(|| Self::arm_storage_events(host, config, origin_id, &sink));
        if primary.is_none() {
            tracing::warn!("No same-origin transport available, only frames will sync");
        }

        let failover = match (&primary, &host.storage) {
            (Some(p), Some(storage)) if p.kind() == TransportKind::Bus => {
                Some(StorageEventTransport::new(
                    Arc::clone(storage),
                    config.fallback_key.as_str(),
                    config.fallback_cleanup_delay(),
                    origin_id.clone(),
                ))
            }
            _ => None,
        };

        let frames = host.frame.clone().and_then(|node| {
            let transport = FrameTransport::new(
                node,
                config.frame_source.as_str(),
                origin_id.clone(),
                config.allow_cross_origin_frames,
            );
            match transport.listen(sink.clone()) {
                Ok(()) => Some(transport),
                Err(e) => {
                    tracing::warn!(target: "tabsync::frames", "Frame transport unavailable: {e}");
                    None
                }
            }
        });
        drop(sink);

        let handlers: Arc<RwLock<Vec<MessageHandler>>> = Arc::new(RwLock::new(Vec::new()));
        let pump = tokio::spawn(Self::pump(inbound, Arc::clone(&handlers)));

        Self {
            primary,
            failover,
            frames,
            handlers,
            pump: Mutex::new(Some(pump)),
            destroyed: AtomicBool::new(false),
        }
    }

    fn arm_bus(
        host: &HostEnvironment,
        config: &SyncConfig,
        sink: &InboundSink,
    ) -> Option<Box<dyn Transport>> {
        let hub = host.bus.as_ref()?;
        let bus = match BusTransport::acquire(hub, &config.channel_name) {
            Ok(bus) => bus,
            Err(e) => {
                tracing::warn!("Broadcast bus unavailable, falling back: {e}");
                return None;
            }
        };
        match bus.listen(sink.clone()) {
            Ok(()) => {
                tracing::info!("Cross-context sync enabled (broadcast bus)");
                Some(Box::new(bus))
            }
            Err(e) => {
                tracing::warn!("Broadcast bus listen failed, falling back: {e}");
                None
            }
        }
    }

    fn arm_storage_events(
        host: &HostEnvironment,
        config: &SyncConfig,
        origin_id: &OriginId,
        sink: &InboundSink,
    ) -> Option<Box<dyn Transport>> {
        let storage = host.storage.as_ref()?;
        let transport = StorageEventTransport::new(
            Arc::clone(storage),
            config.fallback_key.as_str(),
            config.fallback_cleanup_delay(),
            origin_id.clone(),
        );
        match transport.listen(sink.clone()) {
            Ok(()) => {
                tracing::info!("Cross-context sync enabled (storage events)");
                Some(Box::new(transport))
            }
            Err(e) => {
                tracing::warn!("Storage-event transport listen failed: {e}");
                None
            }
        }
    }

    async fn pump(
        mut inbound: mpsc::UnboundedReceiver<Delivery>,
        handlers: Arc<RwLock<Vec<MessageHandler>>>,
    ) {
        while let Some(delivery) = inbound.recv().await {
            let current: Vec<MessageHandler> = handlers.read().clone();
            for handler in current {
                handler(delivery.clone());
            }
        }
    }

    /// Transports currently armed for sending and receiving.
    #[must_use]
    pub fn active(&self) -> Vec<TransportKind> {
        if self.is_destroyed() {
            return Vec::new();
        }
        self.primary
            .iter()
            .map(|t| t.kind())
            .chain(self.frames.iter().map(Transport::kind))
            .collect()
    }

    /// Fan a message out over every armed transport.
    ///
    /// A failure on one transport never stops the others. Returns how many
    /// transports accepted the message.
    pub fn send(&self, message: &SyncMessage) -> usize {
        if self.is_destroyed() {
            tracing::debug!("Dropping send on destroyed selector");
            return 0;
        }

        let mut accepted = 0;
        if let Some(primary) = &self.primary {
            match primary.send(message) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tracing::error!("{} send failed: {e}", primary.kind());
                    if let Some(failover) = &self.failover {
                        match failover.send(message) {
                            Ok(()) => accepted += 1,
                            Err(e) => tracing::error!("Storage-event failover failed: {e}"),
                        }
                    }
                }
            }
        }

        if let Some(frames) = &self.frames {
            match frames.send(message) {
                Ok(()) => accepted += 1,
                Err(e) => tracing::warn!(target: "tabsync::frames", "Frame send failed: {e}"),
            }
        }

        accepted
    }

    /// Register a handler for inbound messages from any transport.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(Delivery) + Send + Sync + 'static,
    {
        if self.is_destroyed() {
            return;
        }
        self.handlers.write().push(Arc::new(handler));
    }

    /// Release every transport and listener. Safe to call more than once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(primary) = &self.primary {
            primary.close();
        }
        if let Some(failover) = &self.failover {
            failover.close();
        }
        if let Some(frames) = &self.frames {
            frames.close();
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.handlers.write().clear();
        tracing::debug!("Transport selector destroyed");
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl Drop for TransportSelector {
    fn drop(&mut self) {
        self.destroy();
    }
}
