use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error::{FsError, Result};

/// Rejects paths the kernel cannot receive before any syscall is attempted.
pub fn validated_path(path: &Path) -> Result<PathBuf> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(FsError::invalid_argument("path must not be empty"));
    }
    if bytes.contains(&0) {
        return Err(FsError::invalid_argument(format!(
            "path must be a string without null bytes, received {}",
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}
