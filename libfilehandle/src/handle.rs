//! Reference-counted file handles.
//!
//! A [`FileHandle`] owns one descriptor. Every operation borrows the
//! descriptor for its duration by bumping the handle's reference count, and
//! `close` only drops the handle's own reference. The descriptor is released
//! when the count reaches zero, so closing while a read or write is in flight
//! is safe: the close waits for the operation instead of pulling the
//! descriptor out from under it.

use std::future::Future;
use std::mem;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;

use bytes::Bytes;
use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};

use crate::config::IoLimits;
use crate::encoding::Encoding;
use crate::error::{FsError, OsError, Result};
use crate::read::{self, FileContents, ReadFileOptions};
use crate::sys::{FileStat, RawFs};
use crate::write::{self, WriteData, WriteFileOptions};

type CloseFuture = Shared<BoxFuture<'static, Result<()>>>;

/// Descriptor value of a closed handle.
const CLOSED_FD: RawFd = -1;

struct HandleState {
    fd: RawFd,
    refs: usize,
    closing: Option<CloseFuture>,
    close_tx: Option<oneshot::Sender<Result<()>>>,
    locked: bool,
}

struct HandleInner {
    fs: Arc<dyn RawFs>,
    limits: IoLimits,
    state: Mutex<HandleState>,
}

/// An open file.
///
/// Clones share the same descriptor and lifecycle; cloning does not count
/// as a reference. The descriptor stays open until [`FileHandle::close`] is
/// called and every in-flight operation has finished.
#[derive(Clone)]
pub struct FileHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
pub struct ReadResult {
    pub bytes_read: usize,
    pub buffer: Vec<u8>,
}

#[derive(Debug)]
pub struct ReadvResult {
    pub bytes_read: usize,
    pub buffers: Vec<Vec<u8>>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state();
        f.debug_struct("FileHandle")
            .field("fd", &st.fd)
            .field("refs", &st.refs)
            .field("closing", &st.closing.is_some())
            .field("locked", &st.locked)
            .finish()
    }
}

impl HandleInner {
    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops one reference. Hitting zero hands the descriptor to a close task.
    fn release(self: &Arc<Self>) {
        let mut st = self.state();
        if st.refs == 0 {
            error!("file handle reference released twice");
            return;
        }
        st.refs -= 1;
        if st.refs == 0 {
            let fd = mem::replace(&mut st.fd, CLOSED_FD);
            let tx = st.close_tx.take();
            drop(st);
            spawn_close(Arc::clone(&self.fs), fd, tx, Arc::downgrade(self));
        }
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if st.fd != CLOSED_FD {
            let fd = mem::replace(&mut st.fd, CLOSED_FD);
            warn!("closing file descriptor {fd} on drop, the handle was never closed");
            spawn_close(Arc::clone(&self.fs), fd, st.close_tx.take(), Weak::new());
        }
    }
}

/// Runs the one and only close of `fd` and reports the outcome to the waiters.
///
/// The pending close is cleared on `owner` here rather than by a waiter, so
/// the handle settles even when every `close()` future was dropped.
fn spawn_close(
    fs: Arc<dyn RawFs>,
    fd: RawFd,
    tx: Option<oneshot::Sender<Result<()>>>,
    owner: Weak<HandleInner>,
) {
    let task = async move {
        let res = fs.close(fd).await.map_err(|e| FsError::os("close", e));
        match &res {
            Ok(()) => debug!("closed fd {fd}"),
            Err(e) => warn!("close of fd {fd} failed: {e}"),
        }
        if let Some(inner) = owner.upgrade() {
            inner.state().closing = None;
        }
        if let Some(tx) = tx {
            let _ = tx.send(res);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(rt) => {
            rt.spawn(task);
        }
        Err(_) => error!("no tokio runtime available to close fd {fd}, descriptor leaked"),
    }
}

/// A reference held for the duration of one operation, or longer by a lease.
struct HandleRef {
    inner: Arc<HandleInner>,
    fd: RawFd,
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// Long-lived reference that keeps the handle open and marks it locked.
///
/// Stream adapters hold one of these while they own the handle's read side.
/// Dropping the lease unlocks the handle and releases the reference, which
/// completes a close that was requested in the meantime.
pub struct HandleLease {
    reference: HandleRef,
}

impl HandleLease {
    pub fn fd(&self) -> RawFd {
        self.reference.fd
    }
}

impl std::fmt::Debug for HandleLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleLease")
            .field("fd", &self.reference.fd)
            .finish()
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        self.reference.inner.state().locked = false;
    }
}

impl FileHandle {
    pub(crate) fn new(fs: Arc<dyn RawFs>, limits: IoLimits, fd: RawFd) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                fs,
                limits,
                state: Mutex::new(HandleState {
                    fd,
                    refs: 1,
                    closing: None,
                    close_tx: None,
                    locked: false,
                }),
            }),
        }
    }

    /// The descriptor, or `-1` once the handle is closed.
    pub fn fd(&self) -> RawFd {
        self.inner.state().fd
    }

    pub fn is_closed(&self) -> bool {
        self.fd() == CLOSED_FD
    }

    pub(crate) fn limits(&self) -> &IoLimits {
        &self.inner.limits
    }

    fn acquire(&self, syscall: &'static str) -> Result<HandleRef> {
        let mut st = self.inner.state();
        if st.fd == CLOSED_FD {
            return Err(OsError::closed(syscall).into());
        }
        st.refs += 1;
        Ok(HandleRef {
            inner: Arc::clone(&self.inner),
            fd: st.fd,
        })
    }

    /// Runs `op` against the descriptor while holding a reference to it.
    ///
    /// The reference is released when the operation finishes or when the
    /// returned future is dropped, whichever comes first.
    pub(crate) async fn guarded<T, F, Fut>(&self, syscall: &'static str, op: F) -> Result<T>
    where
        F: FnOnce(RawFd) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let reference = self.acquire(syscall)?;
        let out = op(reference.fd).await;
        drop(reference);
        out
    }

    fn fs(&self) -> &dyn RawFs {
        self.inner.fs.as_ref()
    }

    /// Closes the handle.
    ///
    /// Concurrent callers share one close and all observe its outcome. If
    /// operations are still in flight the descriptor is released once the
    /// last of them finishes. Closing a closed handle succeeds immediately.
    pub async fn close(&self) -> Result<()> {
        let pending = {
            let mut st = self.inner.state();
            if let Some(pending) = &st.closing {
                pending.clone()
            } else if st.fd == CLOSED_FD {
                return Ok(());
            } else {
                let (tx, rx) = oneshot::channel();
                let pending: CloseFuture = rx
                    .map(|outcome| {
                        outcome.unwrap_or_else(|_| {
                            Err(FsError::invalid_state("The FileHandle close was abandoned"))
                        })
                    })
                    .boxed()
                    .shared();
                st.close_tx = Some(tx);
                st.closing = Some(pending.clone());
                debug!(
                    "close requested for fd {} with {} operation(s) in flight",
                    st.fd,
                    st.refs - 1
                );
                drop(st);
                self.inner.release();
                pending
            }
        };

        pending.await
    }

    /// Takes a long-lived reference and locks the handle.
    pub fn lease(&self) -> Result<HandleLease> {
        let mut st = self.inner.state();
        if st.fd == CLOSED_FD {
            return Err(FsError::invalid_state("The FileHandle is closed"));
        }
        if st.closing.is_some() {
            return Err(FsError::invalid_state("The FileHandle is closing"));
        }
        if st.locked {
            return Err(FsError::invalid_state("The FileHandle is locked"));
        }
        st.locked = true;
        st.refs += 1;
        debug!("fd {} leased", st.fd);
        Ok(HandleLease {
            reference: HandleRef {
                inner: Arc::clone(&self.inner),
                fd: st.fd,
            },
        })
    }

    /// Gives up ownership of the descriptor without closing it.
    ///
    /// Fails while any operation, lease or close is outstanding. Afterwards
    /// the handle behaves as closed and the caller is responsible for the
    /// descriptor.
    pub fn detach(&self) -> Result<RawFd> {
        let mut st = self.inner.state();
        if st.fd == CLOSED_FD {
            return Err(FsError::invalid_state("The FileHandle is closed"));
        }
        if st.closing.is_some() || st.refs > 1 {
            return Err(FsError::invalid_state(
                "Cannot transfer FileHandle while in use",
            ));
        }
        st.refs = 0;
        Ok(mem::replace(&mut st.fd, CLOSED_FD))
    }

    pub async fn read(
        &self,
        buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> Result<ReadResult> {
        self.guarded("read", |fd| async move {
            if length == 0 {
                return Ok(ReadResult {
                    bytes_read: 0,
                    buffer: buf,
                });
            }
            if buf.is_empty() {
                return Err(FsError::invalid_argument(
                    "buffer is empty and cannot be written",
                ));
            }
            if offset
                .checked_add(length)
                .is_none_or(|end| end > buf.len())
            {
                return Err(FsError::invalid_argument(format!(
                    "offset {offset} and length {length} exceed buffer of {} bytes",
                    buf.len()
                )));
            }
            let (bytes_read, buffer) = self
                .fs()
                .read(fd, buf, offset, length, position)
                .await
                .map_err(|e| FsError::os("read", e))?;
            Ok(ReadResult { bytes_read, buffer })
        })
        .await
    }

    pub async fn readv(&self, buffers: Vec<Vec<u8>>, position: Option<u64>) -> Result<ReadvResult> {
        self.guarded("readv", |fd| async move {
            let (bytes_read, buffers) = self
                .fs()
                .readv(fd, buffers, position)
                .await
                .map_err(|e| FsError::os("read", e))?;
            Ok(ReadvResult {
                bytes_read,
                buffers,
            })
        })
        .await
    }

    /// Writes `data`, returning how many bytes the kernel accepted.
    pub async fn write(&self, data: impl Into<Bytes>, position: Option<u64>) -> Result<usize> {
        let data = data.into();
        self.guarded("write", |fd| write::write_chunk(self.fs(), fd, data, position))
            .await
    }

    pub async fn writev(&self, buffers: Vec<Bytes>, position: Option<u64>) -> Result<usize> {
        self.guarded("writev", |fd| async move {
            if buffers.is_empty() {
                return Ok(0);
            }
            self.fs()
                .writev(fd, buffers, position)
                .await
                .map_err(|e| FsError::os("write", e))
        })
        .await
    }

    pub async fn stat(&self) -> Result<FileStat> {
        self.guarded("fstat", |fd| async move {
            self.fs().fstat(fd).await.map_err(|e| FsError::os("fstat", e))
        })
        .await
    }

    pub async fn sync(&self) -> Result<()> {
        self.guarded("fsync", |fd| async move {
            self.fs().fsync(fd).await.map_err(|e| FsError::os("fsync", e))
        })
        .await
    }

    pub async fn datasync(&self) -> Result<()> {
        self.guarded("fdatasync", |fd| async move {
            self.fs()
                .fdatasync(fd)
                .await
                .map_err(|e| FsError::os("fdatasync", e))
        })
        .await
    }

    pub async fn truncate(&self, len: u64) -> Result<()> {
        self.guarded("ftruncate", |fd| async move {
            self.fs()
                .ftruncate(fd, len)
                .await
                .map_err(|e| FsError::os("ftruncate", e))
        })
        .await
    }

    pub async fn chmod(&self, mode: u32) -> Result<()> {
        self.guarded("fchmod", |fd| async move {
            if mode > 0o7777 {
                return Err(FsError::invalid_argument(format!(
                    "mode must be at most 0o7777, received {mode:#o}"
                )));
            }
            self.fs()
                .fchmod(fd, mode)
                .await
                .map_err(|e| FsError::os("fchmod", e))
        })
        .await
    }

    pub async fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.guarded("fchown", |fd| async move {
            self.fs()
                .fchown(fd, uid, gid)
                .await
                .map_err(|e| FsError::os("fchown", e))
        })
        .await
    }

    pub async fn utimes(&self, atime: SystemTime, mtime: SystemTime) -> Result<()> {
        self.guarded("futimes", |fd| async move {
            self.fs()
                .futimes(fd, atime, mtime)
                .await
                .map_err(|e| FsError::os("futime", e))
        })
        .await
    }

    /// Reads from the current file position to the end of the file.
    pub async fn read_file(&self, options: &ReadFileOptions) -> Result<FileContents> {
        self.guarded("readFile", |fd| {
            read::read_all(self.fs(), self.limits(), fd, options)
        })
        .await
    }

    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        Ok(self
            .read_file(&ReadFileOptions::default())
            .await?
            .into_bytes())
    }

    pub async fn read_to_string(&self) -> Result<String> {
        let options = ReadFileOptions::default().with_encoding(Encoding::Utf8);
        Ok(self.read_file(&options).await?.into_text())
    }

    /// Writes `data` at the current file position. The handle stays open.
    pub async fn write_file(
        &self,
        data: impl Into<WriteData>,
        options: &WriteFileOptions,
    ) -> Result<()> {
        let data = data.into();
        self.guarded("writeFile", |fd| {
            write::write_all(
                self.fs(),
                self.limits(),
                fd,
                data,
                options.signal(),
                options.encoding(),
            )
        })
        .await
    }

    /// Same as [`FileHandle::write_file`]; the open flags decide whether the
    /// data lands at the end.
    pub async fn append_file(
        &self,
        data: impl Into<WriteData>,
        options: &WriteFileOptions,
    ) -> Result<()> {
        self.write_file(data, options).await
    }
}
