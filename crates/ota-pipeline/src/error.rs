//! Error types for the update pipeline

use thiserror::Error;

/// Errors that can occur while acquiring, verifying or committing an update
#[derive(Error, Debug)]
pub enum OtaError {
    /// Caller supplied an unusable argument (bad URL scheme, empty upload, malformed manifest)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Another acquisition job already holds the single-flight slot
    #[error("Busy: {0}")]
    Busy(String),

    /// A staged file, flash slot or other required resource is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Completed transfer did not match the advertised length
    #[error("Size mismatch: expected {expected} bytes, received {received}")]
    SizeMismatch {
        /// Advertised content length
        expected: u64,
        /// Bytes actually received
        received: u64,
    },

    /// Writing to storage or flash failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Image failed structural or checksum verification
    #[error("Verification failed: {0}")]
    VerifyFailed(String),

    /// Could not connect to the download source
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Server answered with an unexpected status, or the stream broke mid-transfer
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// Transfer buffer could not be allocated
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Invariant violation inside the pipeline
    #[error("Internal error: {0}")]
    Internal(String),

    /// Operation was cancelled cooperatively
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration or manifest could not be encoded/decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OtaError {
    /// Whether retrying the same operation later may succeed
    ///
    /// Network and storage hiccups are transient; a bad image or argument is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OtaError::Busy(_)
                | OtaError::ConnectionFailed(_)
                | OtaError::DownloadFailed(_)
                | OtaError::SizeMismatch { .. }
                | OtaError::WriteFailed(_)
                | OtaError::OutOfMemory(_)
                | OtaError::Cancelled
        )
    }

    /// Map a storage error, keeping `NotFound` distinct from write failures
    pub(crate) fn from_storage(err: std::io::Error, what: impl std::fmt::Display) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            OtaError::NotFound(format!("{what}: {err}"))
        } else {
            OtaError::WriteFailed(format!("{what}: {err}"))
        }
    }
}

impl From<serde_json::Error> for OtaError {
    fn from(e: serde_json::Error) -> Self {
        OtaError::Serialization(e.to_string())
    }
}

/// Convenience alias used throughout the crate
pub type OtaResult<T> = Result<T, OtaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_not_found_is_distinct() {
        let err = OtaError::from_storage(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "firmware.bin",
        );
        assert!(matches!(err, OtaError::NotFound(_)));

        let err = OtaError::from_storage(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ro"),
            "firmware.bin",
        );
        assert!(matches!(err, OtaError::WriteFailed(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(OtaError::Cancelled.is_retryable());
        assert!(OtaError::DownloadFailed("reset".into()).is_retryable());
        assert!(!OtaError::VerifyFailed("magic".into()).is_retryable());
        assert!(!OtaError::InvalidArgument("ftp://".into()).is_retryable());
    }

    #[test]
    fn test_size_mismatch_message() {
        let err = OtaError::SizeMismatch {
            expected: 500_000,
            received: 300_000,
        };
        assert_eq!(
            err.to_string(),
            "Size mismatch: expected 500000 bytes, received 300000"
        );
    }
}
