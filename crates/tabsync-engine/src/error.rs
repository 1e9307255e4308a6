//! Engine error types.

use tabsync_core::ConfigError;
use thiserror::Error;

/// Sync engine error.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Payload is not plain data: {0}")]
    NotPlainData(#[source] serde_json::Error),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Sync context is shut down")]
    Shutdown,
}
