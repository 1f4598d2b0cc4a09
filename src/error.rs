//! Error types for visa1-link.

use thiserror::Error;

/// Main error type for all link operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// I/O error while reading from or writing to the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A packager could not interpret a message or its bytes.
    #[error("Format error: {0}")]
    Format(String),

    /// The exchange finished without a valid response
    /// (NAK, deadline elapsed, checksum mismatch or carrier lost).
    #[error("No response")]
    NoResponse,

    /// The request expired while queued and was never transmitted.
    #[error("Request expired before transmission")]
    Expired,

    /// The caller's wait for a response timed out.
    #[error("Timed out waiting for response")]
    Timeout,

    /// The transport stream was closed by the remote side.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The link worker is gone; the request will never be answered.
    #[error("Link closed")]
    LinkClosed,

    /// A packager or transport panicked during an exchange.
    #[error("Exchange panicked: {0}")]
    Panicked(String),
}

impl LinkError {
    /// Whether the caller may simply queue the request again.
    ///
    /// Handshake failures and expiries are business outcomes of a slow
    /// line, not faults.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::NoResponse | LinkError::Expired | LinkError::Timeout
        )
    }
}

/// Result type alias using LinkError.
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LinkError::NoResponse.is_retryable());
        assert!(LinkError::Expired.is_retryable());
        assert!(LinkError::Timeout.is_retryable());
        assert!(!LinkError::LinkClosed.is_retryable());
        assert!(!LinkError::Format("bad bitmap".into()).is_retryable());
        assert!(!LinkError::Panicked("index out of bounds".into()).is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "line dropped");
        let err: LinkError = io.into();
        assert!(matches!(err, LinkError::Io(_)));
        assert!(err.to_string().contains("line dropped"));
    }
}
