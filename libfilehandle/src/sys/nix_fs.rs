use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{BorrowedFd, RawFd};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::{self, Mode};
use nix::sys::time::TimeSpec;
use nix::sys::uio;
use nix::unistd::{self, Gid, Uid};

use super::{FileStat, RawFs};
use crate::util::open_options::OpenFlags;

/// [`RawFs`] backed by the host kernel through `nix`.
///
/// Each call runs on tokio's blocking pool, so a slow disk never stalls the
/// task that issued the request.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysFs;

impl SysFs {
    pub fn new() -> Self {
        SysFs
    }
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

fn retry_eintr<T>(mut f: impl FnMut() -> nix::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other.map_err(io::Error::from),
        }
    }
}

/// Borrows a descriptor for one syscall.
///
/// Callers of [`RawFs`] hold a handle reference for the duration of the call,
/// so the descriptor cannot be closed underneath it.
fn borrowed<'a>(fd: RawFd) -> BorrowedFd<'a> {
    // SAFETY: the handle layer keeps `fd` open until the call returns.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

fn to_offset(position: u64) -> io::Result<libc::off_t> {
    libc::off_t::try_from(position)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "position out of range"))
}

fn to_system_time(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs()) + Duration::from_nanos(nsec as u64)
    }
}

fn to_timespec(t: SystemTime) -> TimeSpec {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => TimeSpec::from_duration(d),
        Err(e) => {
            // tv_nsec stays non-negative; whole seconds absorb the borrow.
            let d = e.duration();
            let (mut sec, mut nsec) = (-(d.as_secs() as i64), d.subsec_nanos() as i64);
            if nsec > 0 {
                sec -= 1;
                nsec = 1_000_000_000 - nsec;
            }
            TimeSpec::new(sec as libc::time_t, nsec as _)
        }
    }
}

#[async_trait]
impl RawFs for SysFs {
    async fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> io::Result<RawFd> {
        let path = path.to_path_buf();
        let oflag = OFlag::from_bits_retain((flags | OpenFlags::CLOEXEC).bits());
        let mode = Mode::from_bits_truncate(mode as libc::mode_t);
        blocking(move || retry_eintr(|| fcntl::open(path.as_path(), oflag, mode))).await
    }

    async fn read(
        &self,
        fd: RawFd,
        mut buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> io::Result<(usize, Vec<u8>)> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "read range exceeds buffer")
            })?;
        let position = position.map(to_offset).transpose()?;
        blocking(move || {
            let dst = &mut buf[offset..end];
            let n = retry_eintr(|| match position {
                Some(pos) => uio::pread(borrowed(fd), dst, pos),
                None => unistd::read(fd, dst),
            })?;
            Ok((n, buf))
        })
        .await
    }

    async fn readv(
        &self,
        fd: RawFd,
        mut bufs: Vec<Vec<u8>>,
        position: Option<u64>,
    ) -> io::Result<(usize, Vec<Vec<u8>>)> {
        let position = position.map(to_offset).transpose()?;
        blocking(move || {
            let mut iov: Vec<IoSliceMut<'_>> = bufs
                .iter_mut()
                .map(|b| IoSliceMut::new(b.as_mut_slice()))
                .collect();
            let n = retry_eintr(|| match position {
                Some(pos) => uio::preadv(borrowed(fd), &mut iov, pos),
                None => uio::readv(borrowed(fd), &mut iov),
            })?;
            drop(iov);
            Ok((n, bufs))
        })
        .await
    }

    async fn write(&self, fd: RawFd, data: Bytes, position: Option<u64>) -> io::Result<usize> {
        let position = position.map(to_offset).transpose()?;
        blocking(move || {
            retry_eintr(|| match position {
                Some(pos) => uio::pwrite(borrowed(fd), &data, pos),
                None => unistd::write(borrowed(fd), &data),
            })
        })
        .await
    }

    async fn writev(
        &self,
        fd: RawFd,
        bufs: Vec<Bytes>,
        position: Option<u64>,
    ) -> io::Result<usize> {
        let position = position.map(to_offset).transpose()?;
        blocking(move || {
            let iov: Vec<IoSlice<'_>> = bufs.iter().map(|b| IoSlice::new(b)).collect();
            retry_eintr(|| match position {
                Some(pos) => uio::pwritev(borrowed(fd), &iov, pos),
                None => uio::writev(borrowed(fd), &iov),
            })
        })
        .await
    }

    async fn close(&self, fd: RawFd) -> io::Result<()> {
        // close(2) must not be retried on EINTR: the descriptor is gone either way.
        blocking(move || unistd::close(fd).map_err(io::Error::from)).await
    }

    async fn fstat(&self, fd: RawFd) -> io::Result<FileStat> {
        blocking(move || {
            let st = stat::fstat(fd)?;
            Ok(FileStat {
                dev: st.st_dev as u64,
                ino: st.st_ino as u64,
                mode: st.st_mode as u32,
                nlink: st.st_nlink as u64,
                uid: st.st_uid,
                gid: st.st_gid,
                rdev: st.st_rdev as u64,
                size: st.st_size as u64,
                blksize: st.st_blksize as u64,
                blocks: st.st_blocks as u64,
                atime: to_system_time(st.st_atime as i64, st.st_atime_nsec as i64),
                mtime: to_system_time(st.st_mtime as i64, st.st_mtime_nsec as i64),
                ctime: to_system_time(st.st_ctime as i64, st.st_ctime_nsec as i64),
            })
        })
        .await
    }

    async fn fsync(&self, fd: RawFd) -> io::Result<()> {
        blocking(move || retry_eintr(|| unistd::fsync(fd))).await
    }

    async fn fdatasync(&self, fd: RawFd) -> io::Result<()> {
        blocking(move || retry_eintr(|| unistd::fdatasync(fd))).await
    }

    async fn ftruncate(&self, fd: RawFd, len: u64) -> io::Result<()> {
        let len = to_offset(len)?;
        blocking(move || retry_eintr(|| unistd::ftruncate(borrowed(fd), len))).await
    }

    async fn fchmod(&self, fd: RawFd, mode: u32) -> io::Result<()> {
        let mode = Mode::from_bits_truncate(mode as libc::mode_t);
        blocking(move || stat::fchmod(fd, mode).map_err(io::Error::from)).await
    }

    async fn fchown(&self, fd: RawFd, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
        let uid = uid.map(Uid::from_raw);
        let gid = gid.map(Gid::from_raw);
        blocking(move || unistd::fchown(fd, uid, gid).map_err(io::Error::from)).await
    }

    async fn futimes(&self, fd: RawFd, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let (atime, mtime) = (to_timespec(atime), to_timespec(mtime));
        blocking(move || stat::futimens(fd, &atime, &mtime).map_err(io::Error::from)).await
    }
}
