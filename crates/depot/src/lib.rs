//! Depot: a remote store for flat, named files.
//!
//! This crate holds the transport-independent core:
//! - [`Storage`] - the capability set every backend satisfies, with
//!   [`LocalStorage`] (a directory on disk) and [`MemoryStorage`]
//! - [`transfer`] - the chunked frame discipline used by uploads and downloads
//! - [`Metrics`] - an injected observability sink for request handlers
//!
//! The gRPC service and client driver live in `depot-grpc`.

mod error;
mod metrics;
mod name;
mod storage;

pub mod transfer;

pub use error::{StorageError, StorageResult, TransferError};
pub use metrics::{Counters, CountersSnapshot, Metrics, NoopMetrics, Operation};
pub use name::{MAX_NAME_LEN, validate_name};
pub use storage::{BackendConfig, FileInfo, LocalStorage, MemoryStorage, Storage};
