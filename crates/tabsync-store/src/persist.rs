//! Durable snapshot persistence.

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tabsync_core::{KvStore, ensure_plain};

/// Loads and saves store snapshots under fixed keys.
///
/// Neither operation fails from the caller's point of view: read and parse
/// problems fall back to defaults, write problems skip the save. Both are
/// logged.
#[derive(Clone)]
pub struct PersistenceAdapter {
    storage: Arc<dyn KvStore>,
}

impl PersistenceAdapter {
    /// Create an adapter over a storage handle.
    #[must_use]
    pub fn new(storage: Arc<dyn KvStore>) -> Self {
        Self { storage }
    }

    /// Load the snapshot under `key` shallow-merged over `default`.
    ///
    /// Top-level fields missing from the stored blob keep their default,
    /// so snapshots written by an older schema still load.
    #[must_use]
    pub fn load(&self, key: &str, default: Value) -> Value {
        let raw = match self.storage.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return default,
            Err(e) => {
                tracing::error!("Failed to read {key}: {e}");
                return default;
            }
        };

        let saved: Value = match serde_json::from_str(&raw) {
            Ok(saved) => saved,
            Err(e) => {
                tracing::error!("Failed to parse stored {key}: {e}");
                return default;
            }
        };

        merge_over(default, saved, key)
    }

    /// Typed variant of [`load`](Self::load).
    ///
    /// Falls back to `default` if the merged value does not decode as `T`.
    #[must_use]
    pub fn load_as<T>(&self, key: &str, default: T) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        let default_value = match serde_json::to_value(&default) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Default for {key} is not plain data: {e}");
                return default;
            }
        };

        match serde_json::from_value(self.load(key, default_value)) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Stored {key} does not match its schema, using defaults: {e}");
                default
            }
        }
    }

    /// Serialize `value` and write it under `key`, replacing any prior value.
    ///
    /// Returns whether the write happened.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let text = match ensure_plain(value).and_then(|()| serde_json::to_string(value)) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to serialize {key}: {e}");
                return false;
            }
        };

        match self.storage.set(key, &text) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to save {key}: {e}");
                false
            }
        }
    }
}

fn merge_over(default: Value, saved: Value, key: &str) -> Value {
    match (default, saved) {
        (Value::Object(mut base), Value::Object(saved)) => {
            base.extend(saved);
            Value::Object(base)
        }
        (Value::Object(base), other) => {
            tracing::warn!("Stored {key} is not an object ({other}), using defaults");
            Value::Object(base)
        }
        (_, saved) => saved,
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::MemoryStorage;

    fn adapter() -> (PersistenceAdapter, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (PersistenceAdapter::new(storage.clone()), storage)
    }

    #[test]
    fn test_missing_key_returns_default() {
        let (persist, _) = adapter();
        assert_eq!(persist.load("settings", json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_stored_fields_merge_over_defaults() {
        let (persist, storage) = adapter();
        storage.set("settings", r#"{"a":5}"#).unwrap();

        let loaded = persist.load("settings", json!({"a": 1, "b": 2}));
        assert_eq!(loaded, json!({"a": 5, "b": 2}));
    }

    #[test]
    fn test_unparsable_blob_returns_default() {
        let (persist, storage) = adapter();
        storage.set("settings", "{broken").unwrap();
        assert_eq!(persist.load("settings", json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_non_object_blob_keeps_object_default() {
        let (persist, storage) = adapter();
        storage.set("settings", "[1,2]").unwrap();
        assert_eq!(persist.load("settings", json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_save_overwrites() {
        let (persist, storage) = adapter();
        assert!(persist.save("theme", &json!({"isDark": false})));
        assert!(persist.save("theme", &json!({"isDark": true})));
        assert_eq!(
            storage.get("theme").unwrap().as_deref(),
            Some(r#"{"isDark":true}"#)
        );
    }

    #[test]
    fn test_save_over_quota_is_skipped() {
        let storage = Arc::new(MemoryStorage::with_quota(16));
        let persist = PersistenceAdapter::new(storage.clone());

        assert!(!persist.save("playlist", &json!({"songs": ["a very long title"]})));
        assert_eq!(storage.get("playlist").unwrap(), None);
    }

    #[test]
    fn test_save_non_finite_is_skipped() {
        let (persist, storage) = adapter();
        assert!(persist.save("player", &json!({"volume": 0.8})));
        assert!(!persist.save("player", &[f64::NAN]));
        assert_eq!(
            storage.get("player").unwrap().as_deref(),
            Some(r#"{"volume":0.8}"#)
        );
    }

    #[test]
    fn test_read_failure_returns_default() {
        let (persist, storage) = adapter();
        storage.set("settings", r#"{"a":5}"#).unwrap();
        storage.set_available(false);
        assert_eq!(persist.load("settings", json!({"a": 1})), json!({"a": 1}));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Settings {
        quality: String,
        search_type: String,
    }

    #[test]
    fn test_typed_load_fills_new_fields() {
        let (persist, storage) = adapter();
        storage.set("music-player-settings", r#"{"quality":"hires"}"#).unwrap();

        let loaded = persist.load_as(
            "music-player-settings",
            Settings {
                quality: "lossless".into(),
                search_type: "music".into(),
            },
        );
        assert_eq!(loaded.quality, "hires");
        assert_eq!(loaded.search_type, "music");
    }

    #[test]
    fn test_typed_load_schema_mismatch_returns_default() {
        let (persist, storage) = adapter();
        storage.set("music-player-settings", r#"{"quality":7}"#).unwrap();

        let default = Settings {
            quality: "lossless".into(),
            search_type: "music".into(),
        };
        let loaded = persist.load_as(
            "music-player-settings",
            Settings {
                quality: "lossless".into(),
                search_type: "music".into(),
            },
        );
        assert_eq!(loaded, default);
    }
}
