//! Error types for the VeilDB log layer.

use std::io;
use thiserror::Error;

/// Result type for log-layer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the log layer.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The registry sanity block did not decrypt to the expected text.
    ///
    /// The user supplied a storage key that does not match the one the
    /// registry was created with. No data key is revealed in this case.
    #[error("encryption key mismatch: registry was created with a different storage key")]
    EncryptionKeyMismatch,

    /// A log file's bootstrap header names a data key the registry does not
    /// hold. Indicates registry corruption or loss.
    #[error("invalid data key id: {id}")]
    InvalidDataKeyId {
        /// The unresolved key id.
        id: u64,
    },

    /// A key of unsupported length was supplied.
    #[error("invalid encryption key size: {actual} bytes (expected 16, 24 or 32)")]
    InvalidKeySize {
        /// Actual size in bytes.
        actual: usize,
    },

    /// Checksum mismatch detected in a registry record.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A log suffix is torn or inconsistent and must be truncated back to
    /// the last complete, commit-matched batch.
    #[error("log truncation required")]
    Truncate,

    /// Clean end of a log file.
    #[error("end of log")]
    Eof,

    /// The requested value-log file has gone away (garbage collected).
    /// The caller should re-resolve the pointer through the LSM.
    #[error("retry: value log file has gone away")]
    Retry,

    /// A value pointer addresses bytes past the writable offset.
    #[error("invalid value pointer offset {offset}: beyond writable offset {max}")]
    InvalidPointer {
        /// Offset the pointer asked for.
        offset: u32,
        /// Writable offset of the file at the time of the read.
        max: u32,
    },

    /// On-disk state is structurally invalid.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Operation not permitted in read-only mode.
    #[error("operation not permitted in read-only mode")]
    ReadOnly,

    /// Invalid argument provided to an API.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the argument issue.
        message: String,
    },
}

impl Error {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}
