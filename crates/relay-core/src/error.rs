//! Error types for the relay-core crate.

/// Errors from loading or saving gateway settings.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Settings that parse but cannot be used
    #[error("Invalid config: {0}")]
    Config(String),
}
