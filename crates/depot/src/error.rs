//! Error types for storage backends and the transfer protocol.

use thiserror::Error;

/// Errors returned by a [`Storage`](crate::Storage) backend.
///
/// Every backend maps its native failures onto these four kinds. Translating
/// them into a wire-level status is the request handler's job.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No entry exists under the name.
    #[error("file not found: {0}")]
    NotFound(String),
    /// An entry already exists under the name.
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    /// The name failed safety validation.
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    /// Any other backend failure.
    #[error("internal storage error: {0}")]
    Internal(#[from] std::io::Error),
}

impl StorageError {
    /// Build an `Internal` error from a message.
    pub fn internal(msg: impl Into<String>) -> Self {
        StorageError::Internal(std::io::Error::other(msg.into()))
    }

    /// Whether this error means the name has no entry.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Result alias for backend operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Violations of the chunked transfer protocol.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    /// A data frame carried more bytes than the frame cap allows.
    #[error("frame of {size} bytes exceeds the {cap} byte frame cap")]
    FrameTooLarge {
        /// Payload size of the offending frame.
        size: usize,
        /// The cap in force for the session.
        cap: usize,
    },
    /// A metadata frame arrived after the session already had one.
    #[error("metadata frame received after the transfer started")]
    UnexpectedMetadata,
    /// The stream did not open with a metadata frame.
    #[error("first frame must carry the file name")]
    MissingMetadata,
    /// The stream ended without a commit frame.
    #[error("stream ended before the upload was committed")]
    Uncommitted,
    /// A frame arrived after the commit frame.
    #[error("frame received after commit")]
    FrameAfterCommit,
    /// The commit frame declared a size other than the bytes received.
    #[error("commit declared {declared} bytes, received {received}")]
    CommitMismatch {
        /// Size carried by the commit frame.
        declared: u64,
        /// Bytes actually received.
        received: u64,
    },
    /// The persisted size differs from the number of bytes transferred.
    #[error("size mismatch: transferred {transferred} bytes, persisted {persisted}")]
    SizeMismatch {
        /// Bytes counted while framing.
        transferred: u64,
        /// Bytes reported by the sink after persisting.
        persisted: u64,
    },
}
