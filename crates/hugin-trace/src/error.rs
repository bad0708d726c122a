//! Error types for trace collection and storage.

use thiserror::Error;

/// Result type alias for trace operations.
pub type Result<T> = std::result::Result<T, TraceError>;

/// Errors surfaced by the storage layer and configuration loading.
///
/// Event emission never produces one of these: a missing context or an
/// unknown trace id is a silent no-op, not an error.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage backend error (lock poisoning, invalid state).
    #[error("Storage error: {0}")]
    Storage(String),

    /// A completed trace could not be handed to storage.
    #[error("Failed to persist trace {trace_id}: {source}")]
    Persist {
        trace_id: String,
        #[source]
        source: Box<TraceError>,
    },
}

impl From<toml::de::Error> for TraceError {
    fn from(e: toml::de::Error) -> Self {
        TraceError::Config(e.to_string())
    }
}
