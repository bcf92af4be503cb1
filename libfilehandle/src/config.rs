use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};

/// Largest file `read_file` accepts (2 GiB - 1).
pub const IO_MAX_LENGTH: u64 = (1 << 31) - 1;
/// Files above this size are read in chunks of this length.
pub const READ_FILE_BUFFER_LENGTH: usize = 512 * 1024;
/// Chunk length used when the size of the source is unknown.
pub const READ_FILE_UNKNOWN_BUFFER_LENGTH: usize = 64 * 1024;
/// Upper bound of a single write issued by `write_file`.
pub const WRITE_FILE_MAX_CHUNK_SIZE: usize = 512 * 1024;

/// Size thresholds used by the whole-file read and write paths.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct IoLimits {
    pub io_max_length: u64,
    pub read_buffer_length: usize,
    pub unknown_size_buffer_length: usize,
    pub write_max_chunk_size: usize,
}

impl Default for IoLimits {
    fn default() -> Self {
        Self {
            io_max_length: IO_MAX_LENGTH,
            read_buffer_length: READ_FILE_BUFFER_LENGTH,
            unknown_size_buffer_length: READ_FILE_UNKNOWN_BUFFER_LENGTH,
            write_max_chunk_size: WRITE_FILE_MAX_CHUNK_SIZE,
        }
    }
}

impl IoLimits {
    pub fn from_json(s: &str) -> Result<Self> {
        let limits: IoLimits = serde_json::from_str(s)
            .map_err(|e| FsError::invalid_argument(format!("io limits: {e}")))?;
        limits.validate()?;
        Ok(limits)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| FsError::os("open", e))?;
        debug!("loading io limits from {}", path.display());
        Self::from_json(&s)
    }

    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("ioMaxLength", self.io_max_length == 0),
            ("readBufferLength", self.read_buffer_length == 0),
            ("unknownSizeBufferLength", self.unknown_size_buffer_length == 0),
            ("writeMaxChunkSize", self.write_max_chunk_size == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((name, _)) => Err(FsError::invalid_argument(format!(
                "{name} must be greater than zero"
            ))),
            None => Ok(()),
        }
    }
}
