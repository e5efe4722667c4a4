//! Translation of backend and protocol errors into gRPC statuses.
//!
//! Backend errors never cross the wire as-is: each kind maps to a fixed
//! status code with a readable message, and internal details are logged
//! instead of returned.

use depot::{Operation, StorageError, TransferError};
use tonic::Status;

pub(crate) fn storage_status(op: Operation, err: StorageError) -> Status {
    match err {
        StorageError::NotFound(name) => Status::not_found(format!("file {name} does not exist")),
        StorageError::AlreadyExists(name) => {
            Status::already_exists(format!("file {name} already exists"))
        }
        StorageError::InvalidName(name) => {
            Status::invalid_argument(format!("invalid file name {name:?}"))
        }
        StorageError::Internal(e) => {
            tracing::error!(%op, "Storage failure: {}", e);
            Status::internal(format!("failed to {op} file"))
        }
    }
}

pub(crate) fn transfer_status(err: TransferError) -> Status {
    match err {
        TransferError::SizeMismatch { .. } => {
            tracing::error!("Integrity check failed: {}", err);
            Status::internal("stored size does not match transferred size")
        }
        TransferError::Uncommitted => Status::aborted("upload ended before it was committed"),
        TransferError::CommitMismatch { .. } => Status::data_loss(err.to_string()),
        TransferError::FrameTooLarge { .. }
        | TransferError::UnexpectedMetadata
        | TransferError::MissingMetadata
        | TransferError::FrameAfterCommit => Status::invalid_argument(err.to_string()),
    }
}
