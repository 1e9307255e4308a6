//! Per-context job queue.
//!
//! A context processes inbound messages, store change notifications and
//! deferred suppression resets one at a time, in enqueue order. "Next
//! scheduling turn" means "behind everything already queued".

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

type Job = Box<dyn FnOnce() + Send>;

struct Inner {
    tx: mpsc::UnboundedSender<Job>,
    pending: AtomicUsize,
    stopped: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Single-consumer FIFO job queue driven by one Tokio task.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Start the driver task on the current runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let inner = Arc::new(Inner {
            tx,
            pending: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            driver: Mutex::new(None),
        });
        let driver = tokio::spawn(Self::drive(rx, Arc::downgrade(&inner)));
        *inner.driver.lock() = Some(driver);
        Self { inner }
    }

    async fn drive(mut rx: mpsc::UnboundedReceiver<Job>, inner: std::sync::Weak<Inner>) {
        while let Some(job) = rx.recv().await {
            if let Some(inner) = inner.upgrade() {
                inner.pending.fetch_sub(1, Ordering::AcqRel);
            }
            if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::error!("Scheduled job panicked");
            }
        }
    }

    /// Queue a job behind everything already queued.
    ///
    /// Returns `false` if the scheduler has been stopped.
    pub fn defer<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopped() {
            return false;
        }
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        if self.inner.tx.send(Box::new(job)).is_err() {
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Wait until the queue has drained, including jobs queued by jobs.
    pub async fn flush(&self) {
        loop {
            let (done_tx, done_rx) = oneshot::channel();
            if !self.defer(move || {
                let _ = done_tx.send(());
            }) {
                return;
            }
            if done_rx.await.is_err() {
                return;
            }
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                return;
            }
        }
    }

    /// Number of queued jobs not yet started.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Stop accepting jobs and abort the driver. Safe to call more than once.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(driver) = self.inner.driver.lock().take() {
            driver.abort();
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}
