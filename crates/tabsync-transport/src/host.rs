//! Runtime capabilities of one context.

use std::sync::Arc;

use tabsync_core::KvStore;

use crate::{BroadcastHub, FrameNode};

/// What the hosting runtime offers a context.
///
/// Each capability is optional; the transport selector arms whatever is
/// present and degrades around whatever is not.
#[derive(Clone, Default)]
pub struct HostEnvironment {
    /// Same-origin broadcast bus.
    pub bus: Option<BroadcastHub>,
    /// Origin-wide durable key-value store.
    pub storage: Option<Arc<dyn KvStore>>,
    /// This context's place in a frame tree.
    pub frame: Option<FrameNode>,
}

impl HostEnvironment {
    /// A context with no capabilities.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_bus(mut self, hub: BroadcastHub) -> Self {
        self.bus = Some(hub);
        self
    }

    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn KvStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    #[must_use]
    pub fn with_frame(mut self, frame: FrameNode) -> Self {
        self.frame = Some(frame);
        self
    }
}
