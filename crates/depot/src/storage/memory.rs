//! In-memory storage backend.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{FileInfo, Storage};
use crate::error::{StorageError, StorageResult};
use crate::name::validate_name;

const DEFAULT_MODE: u32 = 0o600;

#[derive(Debug, Clone)]
struct MemoryEntry {
    data: Vec<u8>,
    mod_time: SystemTime,
}

/// Storage backed by a map held in process memory.
///
/// Content is lost when the value is dropped. After [`close`](Storage::close)
/// the map is cleared and every operation fails with `Internal`.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::internal("storage is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, name: &str) -> StorageResult<Vec<u8>> {
        validate_name(name)?;
        self.ensure_open()?;
        let entries = self.entries.read().await;
        entries
            .get(name)
            .map(|e| e.data.clone())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn write(&self, name: &str, data: &[u8]) -> StorageResult<u64> {
        validate_name(name)?;
        self.ensure_open()?;
        let mut entries = self.entries.write().await;
        match entries.entry(name.to_string()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(MemoryEntry {
                    data: data.to_vec(),
                    mod_time: SystemTime::now(),
                });
                Ok(data.len() as u64)
            }
        }
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        self.ensure_open()?;
        let entries = self.entries.read().await;
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn stat(&self, name: &str) -> StorageResult<FileInfo> {
        validate_name(name)?;
        self.ensure_open()?;
        let entries = self.entries.read().await;
        let entry = entries
            .get(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        Ok(FileInfo {
            name: name.to_string(),
            size: entry.data.len() as u64,
            mode: DEFAULT_MODE,
            mod_time: entry.mod_time,
            dir: false,
        })
    }

    async fn rename(&self, old: &str, new: &str) -> StorageResult<()> {
        validate_name(old)?;
        validate_name(new)?;
        self.ensure_open()?;
        let mut entries = self.entries.write().await;
        if !entries.contains_key(old) {
            return Err(StorageError::NotFound(old.to_string()));
        }
        if entries.contains_key(new) {
            return Err(StorageError::AlreadyExists(new.to_string()));
        }
        if let Some(entry) = entries.remove(old) {
            entries.insert(new.to_string(), entry);
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> StorageResult<()> {
        validate_name(name)?;
        self.ensure_open()?;
        let mut entries = self.entries.write().await;
        entries
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.entries.write().await.clear();
        }
        Ok(())
    }
}
