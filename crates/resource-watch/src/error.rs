//! Error handling for the watch manager.

use thiserror::Error;

/// The main result type used throughout the crate.
pub type WatchResult<T> = Result<T, WatchError>;

/// Errors produced while opening, reading or consuming watch streams.
#[derive(Error, Debug)]
pub enum WatchError {
    /// HTTP request errors (wraps reqwest::Error)
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered the watch request with a non-2xx status
    #[error("Watch request rejected: status={status}, body={body}")]
    Status {
        status: http::StatusCode,
        body: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A request URL could not be built
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// The response body failed mid-stream
    #[error("Stream error: {message}")]
    Stream { message: String },

    /// The manager task has shut down
    #[error("Watch manager has shut down")]
    ManagerClosed,
}

impl WatchError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a mid-stream error.
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    /// Create a non-2xx status error.
    pub fn status(status: http::StatusCode, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = WatchError::config("Invalid URL");
        assert!(matches!(err, WatchError::Config { .. }));

        let err = WatchError::timeout(std::time::Duration::from_secs(5));
        assert!(matches!(err, WatchError::Timeout { .. }));

        let err = WatchError::status(http::StatusCode::FORBIDDEN, "denied");
        assert_eq!(
            err.to_string(),
            "Watch request rejected: status=403 Forbidden, body=denied"
        );
    }
}
