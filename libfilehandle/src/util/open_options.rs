use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::error::FsError;

bitflags! {
    /// Flags passed to `open(2)` when a handle is created.
    ///
    /// Read-only access is the empty set, matching `O_RDONLY == 0`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for writing only.
        const WRITE_ONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const READ_WRITE = libc::O_RDWR;
        /// Create the file if it does not exist.
        const CREATE = libc::O_CREAT;
        /// Fail if the file exists, together with `CREATE`.
        const EXCLUSIVE = libc::O_EXCL;
        /// Truncate an existing regular file to zero length.
        const TRUNCATE = libc::O_TRUNC;
        /// Every write appends to the end of the file.
        const APPEND = libc::O_APPEND;
        /// Writes complete only once data and metadata reach the device.
        const SYNC = libc::O_SYNC;
        /// Close the descriptor across `execve`.
        const CLOEXEC = libc::O_CLOEXEC;
    }
}

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags::empty();

    /// Keeps unknown bits so platform specific flags survive the round trip.
    pub fn from_raw(bits: i32) -> Self {
        OpenFlags::from_bits_retain(bits)
    }

    pub fn is_writable(&self) -> bool {
        self.intersects(OpenFlags::WRITE_ONLY | OpenFlags::READ_WRITE)
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags::READ_ONLY
    }
}

impl FromStr for OpenFlags {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let write = OpenFlags::TRUNCATE | OpenFlags::CREATE;
        let append = OpenFlags::APPEND | OpenFlags::CREATE;
        let flags = match s {
            "r" => OpenFlags::READ_ONLY,
            "rs" | "sr" => OpenFlags::SYNC,
            "r+" => OpenFlags::READ_WRITE,
            "rs+" | "sr+" => OpenFlags::READ_WRITE | OpenFlags::SYNC,

            "w" => write | OpenFlags::WRITE_ONLY,
            "wx" | "xw" => write | OpenFlags::WRITE_ONLY | OpenFlags::EXCLUSIVE,
            "w+" => write | OpenFlags::READ_WRITE,
            "wx+" | "xw+" => write | OpenFlags::READ_WRITE | OpenFlags::EXCLUSIVE,

            "a" => append | OpenFlags::WRITE_ONLY,
            "ax" | "xa" => append | OpenFlags::WRITE_ONLY | OpenFlags::EXCLUSIVE,
            "as" | "sa" => append | OpenFlags::WRITE_ONLY | OpenFlags::SYNC,
            "a+" => append | OpenFlags::READ_WRITE,
            "ax+" | "xa+" => append | OpenFlags::READ_WRITE | OpenFlags::EXCLUSIVE,
            "as+" | "sa+" => append | OpenFlags::READ_WRITE | OpenFlags::SYNC,

            _ => {
                return Err(FsError::invalid_argument(format!(
                    "flags '{s}' is invalid"
                )));
            }
        };
        Ok(flags)
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#o}", self.bits())
    }
}
