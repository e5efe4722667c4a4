//! Local directory storage backend.
//!
//! Each entry is one regular file directly under the root directory, named
//! exactly as the entry. Attributes come live from filesystem metadata; there
//! is no index.
//!
//! Writes are staged in a hidden subdirectory of the root and then linked
//! into place with no-clobber semantics, so an entry appears whole or not at
//! all and two concurrent writers of one name cannot both succeed.

use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{FileInfo, Storage};
use crate::error::{StorageError, StorageResult};
use crate::name::validate_name;

/// Subdirectory of the root holding in-flight writes. Being a directory, it
/// never shows up as an entry.
const STAGING_DIR: &str = ".depot-staging";

/// Storage rooted at a directory on the local filesystem.
#[derive(Debug)]
pub struct LocalStorage {
    root: PathBuf,
    staging: PathBuf,
    closed: AtomicBool,
}

impl LocalStorage {
    /// Open storage rooted at `root`, which must be an existing directory.
    ///
    /// Leftovers from interrupted writes are discarded.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&root).await?;
        if !meta.is_dir() {
            return Err(StorageError::internal(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let staging = root.join(STAGING_DIR);
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => tracing::debug!("Cleared stale staging area in {}", root.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir(&staging).await?;

        tracing::debug!("Opened local storage at {}", root.display());
        Ok(Self {
            root,
            staging,
            closed: AtomicBool::new(false),
        })
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate `name` and resolve it under the root.
    fn path(&self, name: &str) -> StorageResult<PathBuf> {
        validate_name(name)?;
        if name == STAGING_DIR {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::internal("storage is closed"));
        }
        Ok(self.root.join(name))
    }
}

/// Map an I/O failure on `name` to a storage error. Directories are not
/// entries, so hitting one reads as "not found".
fn map_io(name: &str, err: io::Error) -> StorageError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::IsADirectory => {
            StorageError::NotFound(name.to_string())
        }
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(name.to_string()),
        _ => StorageError::Internal(err),
    }
}

fn join_error(err: tokio::task::JoinError) -> StorageError {
    StorageError::internal(format!("blocking storage task failed: {err}"))
}

#[async_trait]
impl Storage for LocalStorage {
    async fn read(&self, name: &str) -> StorageResult<Vec<u8>> {
        let path = self.path(name)?;
        tokio::fs::read(&path).await.map_err(|e| map_io(name, e))
    }

    async fn write(&self, name: &str, data: &[u8]) -> StorageResult<u64> {
        let target = self.path(name)?;
        let staging = self.staging.clone();
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || -> io::Result<u64> {
            // Created with mode 0600; removed on drop if we bail out early.
            let mut tmp = tempfile::Builder::new()
                .prefix("write-")
                .tempfile_in(&staging)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;

            // Checked before the entry becomes visible.
            let staged = tmp.as_file().metadata()?.len();
            if staged != data.len() as u64 {
                return Err(io::Error::other(format!(
                    "staged {staged} of {} bytes",
                    data.len()
                )));
            }
            tmp.persist_noclobber(&target).map_err(|e| e.error)?;
            Ok(staged)
        })
        .await
        .map_err(join_error)?
        .map_err(|e| map_io(name, e))
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::internal("storage is closed"));
        }

        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            // Follows symlinks, so a link to a directory is skipped too.
            let meta = match tokio::fs::metadata(entry.path()).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if meta.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => tracing::warn!("Skipping non UTF-8 file name {:?}", raw),
            }
        }
        names.sort();
        Ok(names)
    }

    async fn stat(&self, name: &str) -> StorageResult<FileInfo> {
        let path = self.path(name)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| map_io(name, e))?;
        if meta.is_dir() {
            return Err(StorageError::NotFound(name.to_string()));
        }

        Ok(FileInfo {
            name: name.to_string(),
            size: meta.len(),
            mode: mode_bits(&meta),
            mod_time: meta.modified()?,
            dir: false,
        })
    }

    async fn rename(&self, old: &str, new: &str) -> StorageResult<()> {
        let from = self.path(old)?;
        let to = self.path(new)?;

        let meta = tokio::fs::metadata(&from)
            .await
            .map_err(|e| map_io(old, e))?;
        if meta.is_dir() {
            return Err(StorageError::NotFound(old.to_string()));
        }

        tokio::task::spawn_blocking(move || sys::rename_noreplace(&from, &to))
            .await
            .map_err(join_error)?
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => StorageError::NotFound(old.to_string()),
                io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(new.to_string()),
                _ => StorageError::Internal(e),
            })
    }

    async fn remove(&self, name: &str) -> StorageResult<()> {
        let path = self.path(name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| map_io(name, e))
    }

    async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.staging).await {
            tracing::warn!("Failed to remove staging area {}: {}", self.staging.display(), e);
        }
        tracing::debug!("Closed local storage at {}", self.root.display());
        Ok(())
    }
}

#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

mod sys {
    use std::io;
    use std::path::Path;

    /// Rename `from` to `to`, failing with `AlreadyExists` if `to` is taken.
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    pub(super) fn rename_noreplace(from: &Path, to: &Path) -> io::Result<()> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let from_c = CString::new(from.as_os_str().as_bytes())?;
        let to_c = CString::new(to.as_os_str().as_bytes())?;

        // SAFETY: both pointers are NUL-terminated and outlive the call.
        let rc = unsafe {
            libc::renameat2(
                libc::AT_FDCWD,
                from_c.as_ptr(),
                libc::AT_FDCWD,
                to_c.as_ptr(),
                libc::RENAME_NOREPLACE,
            )
        };
        if rc == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // Kernel or filesystem without RENAME_NOREPLACE support.
            Some(libc::EINVAL) | Some(libc::ENOSYS) => checked_rename(from, to),
            _ => Err(err),
        }
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    pub(super) fn rename_noreplace(from: &Path, to: &Path) -> io::Result<()> {
        checked_rename(from, to)
    }

    fn checked_rename(from: &Path, to: &Path) -> io::Result<()> {
        if std::fs::symlink_metadata(to).is_ok() {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        std::fs::rename(from, to)
    }
}
