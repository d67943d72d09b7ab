//! Error types for streamrate.

use thiserror::Error;

/// Main error type for streamrate operations.
#[derive(Error, Debug)]
pub enum StreamRateError {
    /// A rate, resolution, wait or sample parameter is out of range
    #[error("streamrate: invalid parameter: {0}")]
    InvalidParameter(String),

    /// The stream was closed before or during the operation
    #[error("streamrate: closed")]
    Closed,

    /// The underlying sink accepted zero bytes without reporting an error
    #[error("streamrate: zero bytes written")]
    ZeroWrite,

    /// Configuration loading errors
    #[error("streamrate: configuration error: {0}")]
    Config(String),

    /// I/O errors from the underlying source or sink
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamRateError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        StreamRateError::InvalidParameter(msg.into())
    }

    /// Whether this error reports a closed stream.
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamRateError::Closed)
    }
}

impl From<config::ConfigError> for StreamRateError {
    fn from(err: config::ConfigError) -> Self {
        StreamRateError::Config(err.to_string())
    }
}

/// Result type alias for streamrate operations.
pub type Result<T> = std::result::Result<T, StreamRateError>;
