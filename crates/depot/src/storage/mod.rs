//! Storage backends.
//!
//! A backend exposes a flat namespace of named files. The [`Storage`] trait
//! is the whole contract: the request handler only ever calls these
//! operations by name and never sees the backend's own handle.
//!
//! - [`LocalStorage`] - one file per entry directly under a root directory
//! - [`MemoryStorage`] - entries held in a map, for tests and ephemeral use

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

mod local;
mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

/// Attributes of one stored entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Entry name.
    pub name: String,
    /// Content length in bytes.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Last modification time.
    pub mod_time: SystemTime,
    /// Always `false` for entries a backend manages.
    pub dir: bool,
}

/// The capability set every storage backend implements.
///
/// Every operation that takes a name validates it with
/// [`validate_name`](crate::validate_name) before touching any state, so a
/// rejected name has no observable effect.
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Load the full content of `name`.
    async fn read(&self, name: &str) -> StorageResult<Vec<u8>>;

    /// Create `name` holding `data`, returning the size that was persisted.
    ///
    /// Never overwrites: fails with `AlreadyExists` if the name is taken. The
    /// existence check and the create are a single atomic step, and a failed
    /// write leaves no entry behind.
    async fn write(&self, name: &str, data: &[u8]) -> StorageResult<u64>;

    /// Names of all entries.
    async fn list(&self) -> StorageResult<Vec<String>>;

    /// Attributes of `name`.
    async fn stat(&self, name: &str) -> StorageResult<FileInfo>;

    /// Move the entry at `old` to `new`, failing if `new` is taken.
    async fn rename(&self, old: &str, new: &str) -> StorageResult<()>;

    /// Delete `name`.
    async fn remove(&self, name: &str) -> StorageResult<()>;

    /// Release the backend's handle. Calling it again is a no-op.
    async fn close(&self) -> StorageResult<()>;

    /// Whether an entry exists under `name`.
    async fn exists(&self, name: &str) -> StorageResult<bool> {
        match self.stat(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Which backend a server runs on. Chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Files under a directory on the local filesystem.
    Local {
        /// Root directory; must already exist.
        path: PathBuf,
    },
    /// Volatile in-process storage.
    Memory,
}

impl BackendConfig {
    /// Open the configured backend.
    pub async fn open(&self) -> StorageResult<Arc<dyn Storage>> {
        match self {
            BackendConfig::Local { path } => Ok(Arc::new(LocalStorage::open(path).await?)),
            BackendConfig::Memory => Ok(Arc::new(MemoryStorage::new())),
        }
    }
}

impl fmt::Display for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendConfig::Local { path } => write!(f, "local:{}", path.display()),
            BackendConfig::Memory => f.write_str("memory"),
        }
    }
}
