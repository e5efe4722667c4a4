//! Entry name validation.

use crate::error::{StorageError, StorageResult};

/// Longest accepted name, in bytes. Matches the common filesystem limit.
pub const MAX_NAME_LEN: usize = 255;

/// Check that `name` is a single, safe path segment.
///
/// Rejects the empty string, `.` and `..`, anything containing a path
/// separator (`/` or `\`) or a NUL byte, and names longer than
/// [`MAX_NAME_LEN`] bytes. Backends call this on every name they receive.
pub fn validate_name(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name.len() <= MAX_NAME_LEN
        && !name.contains(['/', '\\', '\0'])
        && !name.contains(std::path::MAIN_SEPARATOR);

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}
