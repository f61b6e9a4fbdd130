//! Common error types for Outpost.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for Outpost operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The durable store could not complete an I/O operation.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A replay attempt failed in a way that may succeed later
    /// (network error, timeout, 5xx-class response).
    #[error("Transient remote failure: {0}")]
    TransientRemote(String),

    /// The remote service rejected a mutation outright, or its retry
    /// ceiling was exceeded.
    #[error("Permanent remote failure: {0}")]
    PermanentRemote(String),

    /// The reachability probe did not answer in time.
    #[error("Reachability probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Background task coordination failed.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl Error {
    /// Whether a failed replay should be retried on a later drain pass.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransientRemote(_) | Error::Io(_) | Error::ProbeTimeout(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::TransientRemote("503".to_string()).is_transient());
        assert!(Error::ProbeTimeout(Duration::from_secs(5)).is_transient());
        assert!(!Error::PermanentRemote("422".to_string()).is_transient());
        assert!(!Error::StorageUnavailable("disk full".to_string()).is_transient());
    }
}
