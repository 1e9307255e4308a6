//! Same-origin broadcast bus.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use futures::StreamExt;
use parking_lot::Mutex;
use tabsync_core::{Delivery, InboundSink, SyncMessage, Transport, TransportError, TransportKind};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
struct BusFrame {
    from: u64,
    message: SyncMessage,
}

struct HubInner {
    enabled: bool,
    channels: Mutex<HashMap<String, broadcast::Sender<BusFrame>>>,
    next_id: AtomicU64,
}

/// Publish/subscribe bus shared by the contexts of one origin.
///
/// A hub stands in for the runtime capability: contexts that should not
/// have a bus get no hub, and [`BroadcastHub::disabled`] builds one whose
/// channels cannot be opened.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// Create a working hub.
    #[must_use]
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Create a hub whose `open` always fails.
    #[must_use]
    pub fn disabled() -> Self {
        Self::build(false)
    }

    fn build(enabled: bool) -> Self {
        Self {
            inner: Arc::new(HubInner {
                enabled,
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a handle on the named channel.
    ///
    /// # Errors
    /// Returns error if the hub is disabled or the name is empty.
    pub fn open(&self, name: &str) -> Result<BusChannel, TransportError> {
        if !self.inner.enabled {
            return Err(TransportError::Unavailable(
                "broadcast bus is not supported here".to_string(),
            ));
        }
        if name.is_empty() {
            return Err(TransportError::Unavailable(
                "broadcast channel name is empty".to_string(),
            ));
        }

        let sender = self
            .inner
            .channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();

        Ok(BusChannel {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            sender,
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One context's handle on a named bus channel.
///
/// Posts reach every other listening handle of the same name, never the
/// posting handle itself.
pub struct BusChannel {
    id: u64,
    name: String,
    sender: broadcast::Sender<BusFrame>,
    closed: AtomicBool,
}

impl BusChannel {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post a message to the other listeners.
    ///
    /// # Errors
    /// Returns error if this handle has been closed.
    pub fn post(&self, message: &SyncMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        // No receivers just means nobody else is listening yet.
        let _ = self.sender.send(BusFrame {
            from: self.id,
            message: message.clone(),
        });
        Ok(())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Primary transport over a [`BusChannel`].
pub struct BusTransport {
    channel: BusChannel,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BusTransport {
    /// Acquire the named channel from the hub.
    ///
    /// # Errors
    /// Returns error if the hub cannot open the channel.
    pub fn acquire(hub: &BroadcastHub, name: &str) -> Result<Self, TransportError> {
        Ok(Self {
            channel: hub.open(name)?,
            task: Mutex::new(None),
        })
    }
}

impl Transport for BusTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bus
    }

    fn send(&self, message: &SyncMessage) -> Result<(), TransportError> {
        self.channel.post(message)
    }

    fn listen(&self, sink: InboundSink) -> Result<(), TransportError> {
        if self.channel.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(TransportError::Unavailable("already listening".to_string()));
        }

        let own_id = self.channel.id;
        let mut frames = BroadcastStream::new(self.channel.sender.subscribe());
        *task = Some(tokio::spawn(async move {
            while let Some(item) = frames.next().await {
                match item {
                    Ok(frame) if frame.from == own_id => {}
                    Ok(frame) => {
                        let delivery = Delivery {
                            via: TransportKind::Bus,
                            message: frame.message,
                        };
                        if sink.send(delivery).is_err() {
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!("Broadcast bus lagged, {skipped} messages skipped");
                    }
                }
            }
        }));
        drop(task);
        Ok(())
    }

    fn close(&self) {
        self.channel.close();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for BusTransport {
    fn drop(&mut self) {
        self.close();
    }
}
