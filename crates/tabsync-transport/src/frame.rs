//! Embedded-frame messaging.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use serde_json::Value;
use tabsync_core::{
    Delivery, FrameEnvelope, InboundSink, OriginId, SyncMessage, Transport, TransportError,
    TransportKind,
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

/// Frame delivery error.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame is closed")]
    Closed,
    #[error("Frame origin {target} differs from {sender}")]
    OriginMismatch { sender: String, target: String },
}

struct FrameInner {
    origin: String,
    inbox_tx: mpsc::UnboundedSender<Value>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    parent: Mutex<Option<Weak<FrameInner>>>,
    children: Mutex<Vec<Weak<FrameInner>>>,
    closed: AtomicBool,
}

/// A window's position in a tree of embedded frames.
///
/// Every node has an inbox of plain JSON values; the page may exchange
/// arbitrary traffic through it, not only sync envelopes.
#[derive(Clone)]
pub struct FrameNode {
    inner: Arc<FrameInner>,
}

impl FrameNode {
    /// Create a top-level frame served from `origin`.
    #[must_use]
    pub fn new(origin: impl Into<String>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(FrameInner {
                origin: origin.into(),
                inbox_tx,
                inbox_rx: Mutex::new(Some(inbox_rx)),
                parent: Mutex::new(None),
                children: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Embed `child` inside this frame.
    pub fn attach_child(&self, child: &Self) {
        *child.inner.parent.lock() = Some(Arc::downgrade(&self.inner));
        self.inner.children.lock().push(Arc::downgrade(&child.inner));
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// The embedding frame, if this one is embedded and it is still alive.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.inner
            .parent
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Self { inner })
    }

    /// Live child frames.
    #[must_use]
    pub fn children(&self) -> Vec<Self> {
        let mut children = self.inner.children.lock();
        children.retain(|c| c.strong_count() > 0);
        children
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Self { inner })
            .collect()
    }

    /// Post a value into this frame's inbox.
    ///
    /// # Errors
    /// Returns error if the frame has been closed.
    pub fn post_message(&self, value: Value) -> Result<(), FrameError> {
        if self.is_closed() {
            return Err(FrameError::Closed);
        }
        self.inner
            .inbox_tx
            .send(value)
            .map_err(|_| FrameError::Closed)
    }

    /// Take the inbox receiver. Only the first caller gets it.
    #[must_use]
    pub fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<Value>> {
        self.inner.inbox_rx.lock().take()
    }

    /// Close the frame; later posts to it fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Secondary transport over the frame tree.
///
/// Sends are best effort: each destination frame is tried on its own and
/// failures are logged under the `tabsync::frames` target, never returned.
pub struct FrameTransport {
    node: FrameNode,
    source: String,
    origin_id: OriginId,
    allow_cross_origin: bool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FrameTransport {
    #[must_use]
    pub fn new(
        node: FrameNode,
        source: impl Into<String>,
        origin_id: OriginId,
        allow_cross_origin: bool,
    ) -> Self {
        Self {
            node,
            source: source.into(),
            origin_id,
            allow_cross_origin,
            task: Mutex::new(None),
        }
    }

    fn destinations(&self) -> Vec<(&'static str, FrameNode)> {
        let mut out: Vec<_> = self.node.parent().map(|p| ("parent", p)).into_iter().collect();
        out.extend(self.node.children().into_iter().map(|c| ("child", c)));
        out
    }

    fn post_to(&self, target: &FrameNode, value: Value) -> Result<(), FrameError> {
        if !self.allow_cross_origin && target.origin() != self.node.origin() {
            return Err(FrameError::OriginMismatch {
                sender: self.node.origin().to_string(),
                target: target.origin().to_string(),
            });
        }
        target.post_message(value)
    }
}

impl Transport for FrameTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Frames
    }

    fn send(&self, message: &SyncMessage) -> Result<(), TransportError> {
        let value = FrameEnvelope::new(self.source.as_str(), message.clone()).to_value()?;
        for (relation, target) in self.destinations() {
            if let Err(e) = self.post_to(&target, value.clone()) {
                tracing::warn!(target: "tabsync::frames", "Frame delivery to {relation} failed: {e}");
            }
        }
        Ok(())
    }

    fn listen(&self, sink: InboundSink) -> Result<(), TransportError> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(TransportError::Unavailable("already listening".to_string()));
        }
        let mut inbox = self
            .node
            .take_inbox()
            .ok_or_else(|| TransportError::Unavailable("frame inbox already taken".to_string()))?;

        let source = self.source.clone();
        let own = self.origin_id.clone();
        *task = Some(tokio::spawn(async move {
            while let Some(raw) = inbox.recv().await {
                let Some(message) = FrameEnvelope::open(&raw, &source) else {
                    continue;
                };
                if message.origin_id() == &own {
                    continue;
                }
                let delivery = Delivery {
                    via: TransportKind::Frames,
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

impl Drop for FrameTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    const SOURCE: &str = "music-player-sync";

    fn msg(ts: u64, origin: &OriginId) -> SyncMessage {
        SyncMessage::store_update("player", json!({"volume": 0.7}), ts, origin.clone())
    }

    #[tokio::test]
    async fn test_child_reaches_parent_and_parent_reaches_children() {
        let top = FrameNode::new("https://app.example");
        let left = FrameNode::new("https://app.example");
        let right = FrameNode::new("https://app.example");
        top.attach_child(&left);
        top.attach_child(&right);

        let top_id = OriginId::generate();
        let left_id = OriginId::generate();
        let top_t = FrameTransport::new(top.clone(), SOURCE, top_id.clone(), false);
        let left_t = FrameTransport::new(left.clone(), SOURCE, left_id.clone(), false);
        let right_t = FrameTransport::new(right.clone(), SOURCE, OriginId::generate(), false);

        let (top_tx, mut top_rx) = mpsc::unbounded_channel();
        let (left_tx, mut left_rx) = mpsc::unbounded_channel();
        let (right_tx, mut right_rx) = mpsc::unbounded_channel();
        top_t.listen(top_tx).unwrap();
        left_t.listen(left_tx).unwrap();
        right_t.listen(right_tx).unwrap();

        left_t.send(&msg(1, &left_id)).unwrap();
        assert_eq!(top_rx.recv().await.unwrap().message.timestamp(), 1);

        top_t.send(&msg(2, &top_id)).unwrap();
        assert_eq!(left_rx.recv().await.unwrap().message.timestamp(), 2);
        assert_eq!(right_rx.recv().await.unwrap().message.timestamp(), 2);
    }

    #[tokio::test]
    async fn test_foreign_traffic_is_ignored() {
        let top = FrameNode::new("https://app.example");
        let t = FrameTransport::new(top.clone(), SOURCE, OriginId::generate(), false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        t.listen(tx).unwrap();

        top.post_message(json!({"source": "devtools", "payload": 1})).unwrap();
        top.post_message(json!("plain string")).unwrap();
        let wanted = FrameEnvelope::new(SOURCE, msg(3, &OriginId::generate()))
            .to_value()
            .unwrap();
        top.post_message(wanted).unwrap();

        assert_eq!(rx.recv().await.unwrap().message.timestamp(), 3);
    }

    #[tokio::test]
    async fn test_cross_origin_requires_opt_in() {
        let top = FrameNode::new("https://app.example");
        let embed = FrameNode::new("https://other.example");
        top.attach_child(&embed);
        let mut inbox = embed.take_inbox().unwrap();

        let strict = FrameTransport::new(top.clone(), SOURCE, OriginId::generate(), false);
        strict.send(&msg(1, &OriginId::generate())).unwrap();
        let none = tokio::time::timeout(Duration::from_millis(20), inbox.recv()).await;
        assert!(none.is_err());

        let open = FrameTransport::new(top, SOURCE, OriginId::generate(), true);
        open.send(&msg(2, &OriginId::generate())).unwrap();
        assert!(inbox.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_closed_frame_does_not_fail_send() {
        let top = FrameNode::new("https://app.example");
        let child = FrameNode::new("https://app.example");
        top.attach_child(&child);
        child.close();

        let t = FrameTransport::new(top, SOURCE, OriginId::generate(), false);
        assert!(t.send(&msg(1, &OriginId::generate())).is_ok());
    }

    #[test]
    fn test_dropped_children_are_pruned() {
        let top = FrameNode::new("https://app.example");
        {
            let child = FrameNode::new("https://app.example");
            top.attach_child(&child);
            assert_eq!(top.children().len(), 1);
        }
        assert!(top.children().is_empty());
    }
}
