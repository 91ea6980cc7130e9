//! Error types for the relay-provider crate.

/// Errors that can occur in LLM provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned a non-success status
    #[error("API error (HTTP {status}): {body}")]
    ApiError { status: u16, body: String },

    /// Invalid model specified
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// The stream failed as a whole, or the provider reported an in-stream error
    #[error("Stream error: {0}")]
    StreamError(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The caller cancelled the invocation
    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether this error is a cooperative cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }
}
