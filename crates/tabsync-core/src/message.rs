//! Sync message wire format.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity of one running context (tab, window or frame).
///
/// Generated once per context lifetime and stamped on every outbound
/// message so a context can recognize its own echoes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginId(String);

impl OriginId {
    /// Generate a fresh identity of the form `tab-<millis>-<random>`.
    #[must_use]
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("tab-{millis}-{}", &random[..9]))
    }

    /// Wrap an existing identifier.
    #[must_use]
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Full snapshot replacement for one named store.
    StoreUpdate,
}

/// The unit of propagation between contexts.
///
/// Immutable once built: fields are only reachable through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    #[serde(rename = "type")]
    kind: MessageKind,
    store_name: String,
    payload: Value,
    timestamp: u64,
    origin_id: OriginId,
}

impl SyncMessage {
    /// Build a store update from an already plain-data payload.
    #[must_use]
    pub fn store_update(
        store_name: impl Into<String>,
        payload: Value,
        timestamp: u64,
        origin_id: OriginId,
    ) -> Self {
        Self {
            kind: MessageKind::StoreUpdate,
            store_name: store_name.into(),
            payload,
            timestamp,
            origin_id,
        }
    }

    /// Encode `data` as plain structured data.
    ///
    /// # Errors
    /// Returns error if `data` has no plain JSON representation
    /// (non-finite floats, non-string map keys, failing `Serialize` impls).
    pub fn encode_payload<T: Serialize + ?Sized>(data: &T) -> Result<Value, serde_json::Error> {
        crate::plain::ensure_plain(data)?;
        serde_json::to_value(data)
    }

    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    #[must_use]
    pub const fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[must_use]
    pub const fn origin_id(&self) -> &OriginId {
        &self.origin_id
    }

    /// Dedup key: `(store_name, timestamp)`.
    #[must_use]
    pub fn dedup_key(&self) -> (String, u64) {
        (self.store_name.clone(), self.timestamp)
    }

    /// Serialize to the JSON text carried by the storage side channel.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from JSON text.
    ///
    /// # Errors
    /// Returns error if the text is not a valid sync message.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Cross-frame envelope.
///
/// The `source` marker lets receivers tell sync traffic apart from any
/// other cross-frame messages the page exchanges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEnvelope {
    pub source: String,
    pub message: SyncMessage,
}

impl FrameEnvelope {
    #[must_use]
    pub fn new(source: impl Into<String>, message: SyncMessage) -> Self {
        Self {
            source: source.into(),
            message,
        }
    }

    /// Extract the sync message from a raw frame value if it carries `source`.
    ///
    /// Returns `None` for foreign traffic and for malformed envelopes.
    #[must_use]
    pub fn open(raw: &Value, source: &str) -> Option<SyncMessage> {
        if raw.get("source").and_then(Value::as_str) != Some(source) {
            return None;
        }
        raw.get("message")
            .and_then(|m| serde_json::from_value(m.clone()).ok())
    }

    /// Convert to a plain value for posting.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
