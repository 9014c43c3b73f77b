//! Error types for the relay

use crate::config::ConfigError;
use crate::storage::StorageError;
use thiserror::Error;

/// Relay error type
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
