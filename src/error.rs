//! Error types for aax-pipeline
//!
//! This module provides the error taxonomy for the pipeline:
//! - Storage errors (disk space, artifact moves)
//! - Transfer errors (downloads and uploads)
//! - Codec errors (encryption material, conversion, corruption)
//! - Auth and remote-trigger errors
//!
//! The taxonomy drives retry classification: see [`crate::retry::IsRetryable`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for aax-pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for aax-pipeline
///
/// Each variant carries enough context to diagnose the failing stage without
/// access to the original request.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "storage.raw_dir")
        key: Option<String>,
    },

    /// Local storage error (disk space, artifact moves)
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network transfer error (download or upload)
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Codec error (encryption material, conversion, corruption)
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Authentication error
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// Remote processing trigger error
    #[error("trigger error: {0}")]
    Trigger(#[from] TriggerError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Object store error
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task or job not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error represents a cooperative cancellation.
    ///
    /// Cancellations are user-initiated and must never be reported as
    /// pipeline failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Transfer(TransferError::Cancelled))
    }
}

/// Local storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Not enough free space for the operation
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required for the operation
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// Moving an artifact to its stable location failed
    #[error("failed to move {source_path} to {dest_path}: {reason}")]
    MoveFailed {
        /// The source path of the artifact being moved
        source_path: PathBuf,
        /// The destination path where the artifact should land
        dest_path: PathBuf,
        /// The reason the move failed
        reason: String,
    },

    /// Querying free disk space failed
    #[error("failed to check disk space: {0}")]
    SpaceCheckFailed(String),
}

/// Network transfer errors (downloads and uploads)
#[derive(Debug, Error)]
pub enum TransferError {
    /// A transfer already exists for the item
    #[error("transfer already in progress for item {0}")]
    AlreadyInProgress(String),

    /// The transfer was cancelled cooperatively
    #[error("transfer cancelled")]
    Cancelled,

    /// Upload failed with a storage-backend message
    #[error("upload failed: {0}")]
    UploadFailed(String),

    /// Unexpected transfer failure
    #[error("transfer failed: {0}")]
    Unknown(String),
}

/// Codec errors (decrypt + transcode)
#[derive(Debug, Error)]
pub enum CodecError {
    /// Encryption material is missing or malformed
    #[error("invalid encryption material: {0}")]
    InvalidEncryptionMaterial(String),

    /// The external codec failed to convert the artifact
    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    /// The converted artifact failed validation twice in a row
    #[error("converted output failed validation after reconversion")]
    CorruptedOutputAfterReconversion,
}

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// No user is signed in; authenticated calls are impossible
    #[error("no user signed in")]
    NoUserSignedIn,
}

/// Remote processing trigger errors
#[derive(Debug, Error)]
pub enum TriggerError {
    /// The trigger request could not be sent
    #[error("trigger request failed: {0}")]
    RequestFailed(String),

    /// The trigger endpoint rejected the request
    #[error("trigger endpoint returned status {0}")]
    BadStatus(u16),
}

/// Translate low-level write errors into the pipeline taxonomy.
///
/// No-space and too-many-files conditions surface as `InsufficientSpace`
/// so callers see one storage error class regardless of which syscall hit
/// the limit. Everything else unexpected becomes a retryable `Unknown`.
pub(crate) fn translate_write_error(e: std::io::Error, required: u64, available: u64) -> Error {
    let no_space = matches!(
        e.kind(),
        std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded
    ) || matches!(e.raw_os_error(), Some(code) if is_no_space_code(code));

    if no_space {
        Error::Storage(StorageError::InsufficientSpace {
            required,
            available,
        })
    } else {
        Error::Transfer(TransferError::Unknown(e.to_string()))
    }
}

#[cfg(unix)]
fn is_no_space_code(code: i32) -> bool {
    code == libc::ENOSPC || code == libc::EMFILE || code == libc::ENFILE
}

#[cfg(not(unix))]
fn is_no_space_code(_code: i32) -> bool {
    false
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_space_message_carries_both_quantities() {
        let err = Error::Storage(StorageError::InsufficientSpace {
            required: 600_000_000,
            available: 300_000_000,
        });
        let msg = err.to_string();
        assert!(
            msg.contains("600000000"),
            "message should name required bytes: {msg}"
        );
        assert!(
            msg.contains("300000000"),
            "message should name available bytes: {msg}"
        );
    }

    #[test]
    fn cancelled_is_recognised() {
        assert!(Error::Transfer(TransferError::Cancelled).is_cancelled());
        assert!(!Error::Transfer(TransferError::Unknown("x".into())).is_cancelled());
        assert!(!Error::Auth(AuthError::NoUserSignedIn).is_cancelled());
    }

    #[cfg(unix)]
    #[test]
    fn enospc_translates_to_insufficient_space() {
        let io = std::io::Error::from_raw_os_error(libc::ENOSPC);
        let err = translate_write_error(io, 100, 50);
        match err {
            Error::Storage(StorageError::InsufficientSpace {
                required,
                available,
            }) => {
                assert_eq!(required, 100);
                assert_eq!(available, 50);
            }
            other => panic!("expected InsufficientSpace, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn emfile_translates_to_insufficient_space() {
        let io = std::io::Error::from_raw_os_error(libc::EMFILE);
        assert!(matches!(
            translate_write_error(io, 0, 0),
            Error::Storage(StorageError::InsufficientSpace { .. })
        ));
    }

    #[test]
    fn unexpected_io_error_translates_to_unknown_transfer_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            translate_write_error(io, 0, 0),
            Error::Transfer(TransferError::Unknown(_))
        ));
    }

    #[test]
    fn move_failed_names_both_paths() {
        let err = StorageError::MoveFailed {
            source_path: PathBuf::from("/tmp/in.aax"),
            dest_path: PathBuf::from("/books/in.aax"),
            reason: "cross-device".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/in.aax"));
        assert!(msg.contains("/books/in.aax"));
    }

    // The variant message must come from the display attribute, not from a
    // derived error source: PathBuf fields are plain display data here
    #[test]
    fn move_failed_has_no_error_source() {
        use std::error::Error as _;
        let err = Error::Storage(StorageError::MoveFailed {
            source_path: PathBuf::from("/tmp/in.aax"),
            dest_path: PathBuf::from("/books/in.aax"),
            reason: "cross-device".to_string(),
        });
        assert!(err.source().is_some(), "outer wraps the storage error");
        let inner = err.source().unwrap();
        assert!(inner.source().is_none(), "paths are not an error chain");
    }
}
