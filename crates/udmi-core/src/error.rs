//! Error types for the UDMI device engine
//!
//! This module defines all error types used throughout the crate.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the device engine
#[derive(Error, Debug)]
pub enum Error {
    /// Transport connect/publish/subscribe failures
    #[error("Transport error: {0}")]
    Transport(String),

    /// Engine configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbound document could not be understood
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Persistent store or message recorder failures
    #[error("Store error: {0}")]
    Store(String),

    /// Local I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A publish did not complete within the wait timeout
    #[error("Publish timed out after {0:?}")]
    PublishTimeout(Duration),

    /// Blob payload failed decoding or hash verification
    #[error("Blob {blob} rejected: {reason}")]
    BlobCorrupt {
        /// Blob name
        blob: String,
        /// Why it was rejected
        reason: String,
    },

    /// Discovery scan failures
    #[error("Scan error ({family}): {message}")]
    Scan {
        /// Address family being scanned
        family: String,
        /// Error message
        message: String,
    },

    /// The controller broke the protocol contract; the device halts
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Unrecoverable engine failure; the device halts
    #[error("Fatal: {0}")]
    Fatal(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid message error
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a blob rejection error
    pub fn blob_corrupt(blob: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BlobCorrupt {
            blob: blob.into(),
            reason: reason.into(),
        }
    }

    /// Create a scan error
    pub fn scan(family: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Scan {
            family: family.into(),
            message: message.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether this error must halt the device instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ProtocolViolation(_) | Error::Fatal(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::protocol_violation("dup").is_fatal());
        assert!(Error::fatal("rollback").is_fatal());
        assert!(!Error::PublishTimeout(Duration::from_secs(10)).is_fatal());
        assert!(!Error::transport("reset").is_fatal());
    }
}
