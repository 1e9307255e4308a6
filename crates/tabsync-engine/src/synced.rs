//! Stores kept in sync across contexts.

use std::sync::Arc;

use anyhow::Context as _;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{ObservableStore, Subscription, SyncContext};

/// An [`ObservableStore`] wired into a [`SyncContext`].
///
/// On attach the value is loaded from persistence (merged over the given
/// default). Local changes are persisted and broadcast; remote snapshots
/// are merged over the current value and applied without echoing back.
pub struct SyncedStore<T> {
    store: ObservableStore<T>,
    listener: u64,
    _subscription: Subscription,
}

impl<T> SyncedStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Attach a store named `name` to `ctx`.
    ///
    /// With a `persist_key`, the initial value comes from durable storage
    /// and every local change is saved there.
    #[must_use]
    pub fn attach(ctx: &SyncContext, name: &str, persist_key: Option<&str>, default: T) -> Self {
        let initial = match (persist_key, ctx.persistence()) {
            (Some(key), Some(persistence)) => persistence.load_as(key, default),
            _ => default,
        };
        let store = ObservableStore::new(name, initial, ctx.scheduler().clone());

        let coordinator = Arc::downgrade(ctx.coordinator());
        let store_name = name.to_string();
        let listener = store.subscribe(move |value: &T| {
            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };
            if let Err(e) = coordinator.notify_local_change(&store_name, value) {
                tracing::warn!("Local change of {store_name} not synced: {e}");
            }
        });

        let target = store.clone();
        let apply = move |payload: &Value| -> anyhow::Result<()> {
            let merged = merge_snapshot(&target.get(), payload)?;
            target.set(merged);
            Ok(())
        };
        let subscription = match persist_key {
            Some(key) => ctx.coordinator().register_persisted(name, key, apply),
            None => ctx.coordinator().register(name, apply),
        };

        Self {
            store,
            listener,
            _subscription: subscription,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.store.name()
    }

    #[must_use]
    pub fn get(&self) -> T {
        self.store.get()
    }

    pub fn set(&self, value: T) {
        self.store.set(value);
    }

    pub fn update<F: FnOnce(&mut T)>(&self, mutate: F) {
        self.store.update(mutate);
    }

    /// The underlying reactive container, for extra listeners.
    #[must_use]
    pub const fn store(&self) -> &ObservableStore<T> {
        &self.store
    }
}

impl<T> Drop for SyncedStore<T> {
    fn drop(&mut self) {
        self.store.unsubscribe(self.listener);
    }
}

/// Shallow-merge a remote snapshot over the current value.
///
/// Fields the sender did not include keep their local value.
fn merge_snapshot<T>(current: &T, payload: &Value) -> anyhow::Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let merged = match (serde_json::to_value(current)?, payload) {
        (Value::Object(mut base), Value::Object(incoming)) => {
            base.extend(incoming.iter().map(|(k, v)| (k.clone(), v.clone())));
            Value::Object(base)
        }
        (_, incoming) => incoming.clone(),
    };
    serde_json::from_value(merged).context("remote snapshot does not match store schema")
}
