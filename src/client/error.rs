//! Client error types.

use thiserror::Error;

/// Errors that can occur while talking to the remote chat API.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level failure (connect, timeout, TLS, ...). Retryable;
    /// triggers the cache fallback or offline path.
    #[error("network error: {0}")]
    Network(String),

    /// The remote API answered with a failure status or envelope.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A response envelope could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The event stream dropped mid-response.
    #[error("stream aborted: {0}")]
    StreamAborted(String),
}

impl ClientError {
    /// Create an API error from a status and body.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create a decode error.
    pub fn decode(message: impl ToString) -> Self {
        Self::Decode(message.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Convenience type alias for client results.
pub type Result<T> = std::result::Result<T, ClientError>;
