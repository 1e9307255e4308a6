//! One synchronizing context and its wiring.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde::Serialize;
use tabsync_core::{Clock, OriginId, SyncConfig, SystemClock, TransportKind};
use tabsync_store::PersistenceAdapter;
use tabsync_transport::{HostEnvironment, TransportSelector};

use crate::{BroadcastOutcome, MessageRouter, Scheduler, SyncCoordinator, SyncError};

/// Builder for [`SyncContext`].
pub struct SyncContextBuilder {
    host: HostEnvironment,
    config: SyncConfig,
    clock: Option<Arc<dyn Clock>>,
    origin_id: Option<OriginId>,
}

impl SyncContextBuilder {
    #[must_use]
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a fixed identity instead of a generated one.
    #[must_use]
    pub fn origin_id(mut self, origin_id: OriginId) -> Self {
        self.origin_id = Some(origin_id);
        self
    }

    /// Arm transports, start the scheduler and wire the inbound path.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// Returns error if the config is invalid.
    pub fn build(self) -> Result<SyncContext, SyncError> {
        self.config.validate()?;

        let origin_id = self.origin_id.unwrap_or_else(OriginId::generate);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);

        let scheduler = Scheduler::spawn();
        let selector = TransportSelector::new(&self.host, &self.config, &origin_id);
        let router = MessageRouter::new(origin_id.clone(), clock, self.config, selector);
        let persistence = self.host.storage.clone().map(PersistenceAdapter::new);
        let coordinator =
            SyncCoordinator::new(Arc::clone(&router), scheduler.clone(), persistence.clone());

        let inbound = Arc::downgrade(&coordinator);
        let queue = scheduler.clone();
        router.selector().on_message(move |delivery| {
            let coordinator = inbound.clone();
            queue.defer(move || {
                if let Some(coordinator) = coordinator.upgrade() {
                    coordinator.receive(delivery);
                }
            });
        });

        tracing::info!(origin = %origin_id, transports = ?router.selector().active(), "Sync context ready");

        Ok(SyncContext {
            origin_id,
            scheduler,
            router,
            coordinator,
            persistence,
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Everything one context (tab, window, frame) needs to stay in sync.
///
/// Constructed once per context and handed to every store that syncs;
/// independent instances never share state, so tests can run several
/// side by side.
pub struct SyncContext {
    origin_id: OriginId,
    scheduler: Scheduler,
    router: Arc<MessageRouter>,
    coordinator: Arc<SyncCoordinator>,
    persistence: Option<PersistenceAdapter>,
    shut_down: AtomicBool,
}

impl SyncContext {
    #[must_use]
    pub fn builder(host: HostEnvironment) -> SyncContextBuilder {
        SyncContextBuilder {
            host,
            config: SyncConfig::default(),
            clock: None,
            origin_id: None,
        }
    }

    /// Build with the default config.
    ///
    /// # Errors
    /// Returns error if the context cannot be built.
    pub fn new(host: HostEnvironment) -> Result<Self, SyncError> {
        Self::builder(host).build()
    }

    #[must_use]
    pub const fn origin_id(&self) -> &OriginId {
        &self.origin_id
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        self.router.config()
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub const fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    #[must_use]
    pub const fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    #[must_use]
    pub const fn persistence(&self) -> Option<&PersistenceAdapter> {
        self.persistence.as_ref()
    }

    #[must_use]
    pub fn transports(&self) -> Vec<TransportKind> {
        self.router.selector().active()
    }

    /// Broadcast a snapshot directly, bypassing suppression and persistence.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// Returns error if the context is shut down or `data` is not plain data.
    pub fn broadcast<T: Serialize + ?Sized>(
        &self,
        store: &str,
        data: &T,
    ) -> Result<BroadcastOutcome, SyncError> {
        if self.is_shut_down() {
            return Err(SyncError::Shutdown);
        }
        self.router.broadcast(store, data)
    }

    /// Wait until every queued job of this context has run.
    pub async fn settle(&self) {
        self.scheduler.flush().await;
    }

    /// Release transports, cancel pending broadcasts and stop the scheduler.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.router.shutdown();
        self.scheduler.stop();
        tracing::info!(origin = %self.origin_id, "Sync context shut down");
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
