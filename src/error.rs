//! Error types for throttlekit.

use thiserror::Error;

/// Main error type for throttling operations.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// A rate, interval or fraction outside its accepted range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A blocking wait was abandoned through a cancellation token
    #[error("Throttled operation cancelled")]
    Cancelled,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ThrottleError> for std::io::Error {
    fn from(err: ThrottleError) -> Self {
        match err {
            ThrottleError::Io(e) => e,
            ThrottleError::InvalidArgument(_) | ThrottleError::Config(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, err)
            }
            ThrottleError::Cancelled => std::io::Error::new(std::io::ErrorKind::Other, err),
        }
    }
}

/// Result type alias for throttlekit operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
