#[macro_use]
extern crate log;

pub mod config;
pub mod encoding;
pub mod error;
pub mod fs;
pub mod handle;
pub mod read;
pub mod signal;
pub mod sys;
pub mod util;
pub mod write;

pub use config::IoLimits;
pub use encoding::{Encoding, StringDecoder};
pub use error::{FsError, OsError, Result};
pub use fs::{Fs, Target, close_after};
pub use handle::{FileHandle, HandleLease, ReadResult, ReadvResult};
pub use read::{FileContents, ReadFileOptions};
pub use signal::{AbortController, AbortSignal};
pub use sys::{FileStat, RawFs, SysFs};
pub use util::open_options::OpenFlags;
pub use write::{Chunk, WriteData, WriteFileOptions};

// Test utilities (only compiled during tests)
#[cfg(test)]
pub mod test_utils;
