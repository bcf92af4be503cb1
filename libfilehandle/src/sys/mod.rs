//! Syscall boundary.
//!
//! Everything above this module talks to the kernel through [`RawFs`]. The
//! trait takes and returns owned buffers so an implementation is free to move
//! the work onto another thread; [`SysFs`] does exactly that with tokio's
//! blocking pool.

use std::io;
use std::os::fd::RawFd;
use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use crate::util::open_options::OpenFlags;

mod nix_fs;

pub use nix_fs::SysFs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileStat {
    pub fn file_type(&self) -> u32 {
        self.mode & libc::S_IFMT
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == libc::S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == libc::S_IFDIR
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Raw descriptor operations.
///
/// A `position` of `None` uses (and advances) the descriptor's file offset.
/// Implementations report failures as plain `io::Error`s; the handle layer
/// tags them with the syscall name.
#[async_trait]
pub trait RawFs: Send + Sync + 'static {
    async fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> io::Result<RawFd>;

    /// Reads at most `length` bytes into `buf[offset..]`.
    async fn read(
        &self,
        fd: RawFd,
        buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> io::Result<(usize, Vec<u8>)>;

    async fn readv(
        &self,
        fd: RawFd,
        bufs: Vec<Vec<u8>>,
        position: Option<u64>,
    ) -> io::Result<(usize, Vec<Vec<u8>>)>;

    async fn write(&self, fd: RawFd, data: Bytes, position: Option<u64>) -> io::Result<usize>;

    async fn writev(&self, fd: RawFd, bufs: Vec<Bytes>, position: Option<u64>)
    -> io::Result<usize>;

    async fn close(&self, fd: RawFd) -> io::Result<()>;

    async fn fstat(&self, fd: RawFd) -> io::Result<FileStat>;

    async fn fsync(&self, fd: RawFd) -> io::Result<()>;

    async fn fdatasync(&self, fd: RawFd) -> io::Result<()>;

    async fn ftruncate(&self, fd: RawFd, len: u64) -> io::Result<()>;

    async fn fchmod(&self, fd: RawFd, mode: u32) -> io::Result<()>;

    /// `None` leaves the corresponding id unchanged.
    async fn fchown(&self, fd: RawFd, uid: Option<u32>, gid: Option<u32>) -> io::Result<()>;

    async fn futimes(&self, fd: RawFd, atime: SystemTime, mtime: SystemTime) -> io::Result<()>;
}
