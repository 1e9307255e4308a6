//! Reactive value container.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::{Mutex, RwLock};

use crate::Scheduler;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    name: String,
    value: RwLock<T>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    notify_queued: AtomicBool,
    next_id: AtomicU64,
    scheduler: Scheduler,
}

/// A named value with change listeners.
///
/// Listeners do not run inside the mutation. The first mutation of a turn
/// queues one notification job on the scheduler; every listener then sees
/// the value as it stands when that job runs, so a burst of mutations in
/// one turn yields one notification.
pub struct ObservableStore<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ObservableStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> ObservableStore<T> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Remove a listener added with [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, id: u64) {
        self.inner.listeners.lock().retain(|(lid, _)| *lid != id);
    }
}

impl<T> ObservableStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(name: impl Into<String>, initial: T, scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                value: RwLock::new(initial),
                listeners: Mutex::new(Vec::new()),
                notify_queued: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                scheduler,
            }),
        }
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        *self.inner.value.write() = value;
        self.changed();
    }

    /// Mutate the value in place.
    pub fn update<F: FnOnce(&mut T)>(&self, mutate: F) {
        let mut value = self.inner.value.write();
        mutate(&mut *value);
        drop(value);
        self.changed();
    }

    /// Add a change listener. Returns an id for `unsubscribe`.
    pub fn subscribe<F>(&self, listener: F) -> u64
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    fn changed(&self) {
        if self.inner.notify_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        let queued = self.inner.scheduler.defer(move || {
            if let Some(inner) = inner.upgrade() {
                Self::notify(&inner);
            }
        });
        if !queued {
            self.inner.notify_queued.store(false, Ordering::Release);
        }
    }

    fn notify(inner: &Inner<T>) {
        inner.notify_queued.store(false, Ordering::Release);
        let value = inner.value.read().clone();
        let listeners: Vec<Listener<T>> = inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&value);
        }
    }
}
