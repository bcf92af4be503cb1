//! In-memory `RawFs` used by the unit tests.
//!
//! Knobs simulate the awkward cases a real kernel produces only occasionally:
//! short reads and writes, a size in `fstat` that disagrees with the data,
//! non-regular files and a failing `close`. Reads can be held at a gate so a
//! test can act while one is in flight.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use crate::sys::{FileStat, RawFs};
use crate::util::open_options::OpenFlags;

/// Unwraps a `Result<_, FsError>`, or returns early from the test when the
/// call needs privileges the process lacks (`EPERM`).
///
/// With `LIBFILEHANDLE_PRIVILEGED=1` a denied call fails the test instead.
#[macro_export]
macro_rules! ok_or_skip_unprivileged {
    ($expr:expr, $what:expr) => {{
        match $expr {
            Ok(v) => v,
            Err(e) if $crate::FsError::code(&e) == "EPERM" => {
                if std::env::var("LIBFILEHANDLE_PRIVILEGED").as_deref() == Ok("1") {
                    panic!("{} denied in privileged run: {}", $what, e);
                }
                eprintln!("skipping {}: {}", $what, e);
                return;
            }
            Err(e) => panic!("{} failed: {:?}", $what, e),
        }
    }};
}

/// Polls `cond` between scheduler yields until it holds.
pub async fn until(cond: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

struct MemFile {
    data: Vec<u8>,
    mode: u32,
    reported_size: Option<u64>,
    atime: SystemTime,
    mtime: SystemTime,
}

struct OpenFile {
    file: Arc<Mutex<MemFile>>,
    pos: u64,
    append: bool,
}

#[derive(Default)]
struct MemState {
    files: HashMap<PathBuf, Arc<Mutex<MemFile>>>,
    open: HashMap<RawFd, OpenFile>,
    next_fd: RawFd,
}

type IoHook = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
pub struct MemFs {
    state: Mutex<MemState>,
    max_read: Option<usize>,
    max_write: Option<usize>,
    fail_close: AtomicBool,
    reads: AtomicUsize,
    reads_started: AtomicUsize,
    writes: AtomicUsize,
    closes: AtomicUsize,
    read_sizes: Mutex<Vec<usize>>,
    write_sizes: Mutex<Vec<usize>>,
    read_gate: Mutex<Option<Arc<Semaphore>>>,
    on_read: Mutex<Option<IoHook>>,
    on_write: Mutex<Option<IoHook>>,
}

fn ebadf() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState {
                next_fd: 3,
                ..MemState::default()
            }),
            ..Self::default()
        }
    }

    /// Every read returns at most `n` bytes.
    pub fn with_max_read(mut self, n: usize) -> Self {
        self.max_read = Some(n);
        self
    }

    /// Every write accepts at most `n` bytes.
    pub fn with_max_write(mut self, n: usize) -> Self {
        self.max_write = Some(n);
        self
    }

    pub fn insert(&self, path: &str, data: &[u8]) {
        self.insert_with_mode(path, data, libc::S_IFREG | 0o644);
    }

    /// A character device: `fstat` reports no usable size.
    pub fn insert_special(&self, path: &str, data: &[u8]) {
        self.insert_with_mode(path, data, libc::S_IFCHR | 0o644);
    }

    fn insert_with_mode(&self, path: &str, data: &[u8], mode: u32) {
        let file = MemFile {
            data: data.to_vec(),
            mode,
            reported_size: None,
            atime: SystemTime::now(),
            mtime: SystemTime::now(),
        };
        self.state
            .lock()
            .unwrap()
            .files
            .insert(PathBuf::from(path), Arc::new(Mutex::new(file)));
    }

    /// Makes `fstat` report `size` regardless of the data held.
    pub fn set_reported_size(&self, path: &str, size: u64) {
        let st = self.state.lock().unwrap();
        st.files[Path::new(path)].lock().unwrap().reported_size = Some(size);
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let st = self.state.lock().unwrap();
        st.files
            .get(Path::new(path))
            .map(|f| f.lock().unwrap().data.clone())
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Holds every read until the returned semaphore gets a permit per read.
    pub fn gate_reads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.read_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Called with the byte count after every read.
    pub fn on_read(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_read.lock().unwrap() = Some(Box::new(hook));
    }

    /// Called with the accepted byte count after every write.
    pub fn on_write(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_write.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn reads_started(&self) -> usize {
        self.reads_started.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn read_sizes(&self) -> Vec<usize> {
        self.read_sizes.lock().unwrap().clone()
    }

    pub fn write_sizes(&self) -> Vec<usize> {
        self.write_sizes.lock().unwrap().clone()
    }

    fn file(&self, fd: RawFd) -> io::Result<Arc<Mutex<MemFile>>> {
        let st = self.state.lock().unwrap();
        st.open.get(&fd).map(|f| f.file.clone()).ok_or_else(ebadf)
    }

    /// Copies up to `dst.len()` bytes at `position` or the descriptor offset.
    fn read_into(&self, fd: RawFd, dst: &mut [u8], position: Option<u64>) -> io::Result<usize> {
        let mut st = self.state.lock().unwrap();
        let open = st.open.get_mut(&fd).ok_or_else(ebadf)?;
        let file = open.file.lock().unwrap();
        let at = position.unwrap_or(open.pos) as usize;
        let available = file.data.len().saturating_sub(at);
        let mut n = dst.len().min(available);
        if let Some(max) = self.max_read {
            n = n.min(max);
        }
        if n > 0 {
            dst[..n].copy_from_slice(&file.data[at..at + n]);
        }
        drop(file);
        if position.is_none() {
            open.pos += n as u64;
        }
        Ok(n)
    }

    fn write_from(&self, fd: RawFd, src: &[u8], position: Option<u64>) -> io::Result<usize> {
        let mut st = self.state.lock().unwrap();
        let open = st.open.get_mut(&fd).ok_or_else(ebadf)?;
        let mut file = open.file.lock().unwrap();
        let mut n = src.len();
        if let Some(max) = self.max_write {
            n = n.min(max);
        }
        let at = match position {
            _ if open.append => file.data.len(),
            Some(p) => p as usize,
            None => open.pos as usize,
        };
        if file.data.len() < at + n {
            file.data.resize(at + n, 0);
        }
        file.data[at..at + n].copy_from_slice(&src[..n]);
        file.mtime = SystemTime::now();
        drop(file);
        if position.is_none() || open.append {
            open.pos = (at + n) as u64;
        }
        Ok(n)
    }

    async fn wait_gate(&self) {
        self.reads_started.fetch_add(1, Ordering::SeqCst);
        let gate = self.read_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
    }

    fn record_read(&self, n: usize) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.read_sizes.lock().unwrap().push(n);
        if let Some(hook) = self.on_read.lock().unwrap().as_ref() {
            hook(n);
        }
    }

    fn record_write(&self, n: usize) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.write_sizes.lock().unwrap().push(n);
        if let Some(hook) = self.on_write.lock().unwrap().as_ref() {
            hook(n);
        }
    }
}

#[async_trait]
impl RawFs for MemFs {
    async fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> io::Result<RawFd> {
        let mut st = self.state.lock().unwrap();
        let file = match st.files.get(path) {
            Some(_) if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) => {
                return Err(io::Error::from_raw_os_error(libc::EEXIST));
            }
            Some(file) => file.clone(),
            None if flags.contains(OpenFlags::CREATE) => {
                let file = Arc::new(Mutex::new(MemFile {
                    data: Vec::new(),
                    mode: libc::S_IFREG | (mode & 0o7777),
                    reported_size: None,
                    atime: SystemTime::now(),
                    mtime: SystemTime::now(),
                }));
                st.files.insert(path.to_path_buf(), file.clone());
                file
            }
            None => return Err(io::Error::from_raw_os_error(libc::ENOENT)),
        };
        if flags.contains(OpenFlags::TRUNCATE) {
            file.lock().unwrap().data.clear();
        }
        let fd = st.next_fd;
        st.next_fd += 1;
        st.open.insert(
            fd,
            OpenFile {
                file,
                pos: 0,
                append: flags.contains(OpenFlags::APPEND),
            },
        );
        Ok(fd)
    }

    async fn read(
        &self,
        fd: RawFd,
        mut buf: Vec<u8>,
        offset: usize,
        length: usize,
        position: Option<u64>,
    ) -> io::Result<(usize, Vec<u8>)> {
        self.wait_gate().await;
        let n = self.read_into(fd, &mut buf[offset..offset + length], position)?;
        self.record_read(n);
        Ok((n, buf))
    }

    async fn readv(
        &self,
        fd: RawFd,
        mut bufs: Vec<Vec<u8>>,
        position: Option<u64>,
    ) -> io::Result<(usize, Vec<Vec<u8>>)> {
        self.wait_gate().await;
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let n = self.read_into(fd, buf, position.map(|p| p + total as u64))?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        self.record_read(total);
        Ok((total, bufs))
    }

    async fn write(&self, fd: RawFd, data: Bytes, position: Option<u64>) -> io::Result<usize> {
        let n = self.write_from(fd, &data, position)?;
        self.record_write(n);
        Ok(n)
    }

    async fn writev(&self, fd: RawFd, bufs: Vec<Bytes>, position: Option<u64>) -> io::Result<usize> {
        let mut total = 0;
        for buf in &bufs {
            let n = self.write_from(fd, buf, position.map(|p| p + total as u64))?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        self.record_write(total);
        Ok(total)
    }

    async fn close(&self, fd: RawFd) -> io::Result<()> {
        let removed = self.state.lock().unwrap().open.remove(&fd);
        removed.ok_or_else(ebadf)?;
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(())
    }

    async fn fstat(&self, fd: RawFd) -> io::Result<FileStat> {
        let file = self.file(fd)?;
        let file = file.lock().unwrap();
        let size = file.reported_size.unwrap_or(file.data.len() as u64);
        Ok(FileStat {
            dev: 0,
            ino: fd as u64,
            mode: file.mode,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            size,
            blksize: 4096,
            blocks: size.div_ceil(512),
            atime: file.atime,
            mtime: file.mtime,
            ctime: file.mtime,
        })
    }

    async fn fsync(&self, fd: RawFd) -> io::Result<()> {
        self.file(fd).map(drop)
    }

    async fn fdatasync(&self, fd: RawFd) -> io::Result<()> {
        self.file(fd).map(drop)
    }

    async fn ftruncate(&self, fd: RawFd, len: u64) -> io::Result<()> {
        let file = self.file(fd)?;
        file.lock().unwrap().data.resize(len as usize, 0);
        Ok(())
    }

    async fn fchmod(&self, fd: RawFd, mode: u32) -> io::Result<()> {
        let file = self.file(fd)?;
        let mut file = file.lock().unwrap();
        file.mode = (file.mode & libc::S_IFMT) | (mode & 0o7777);
        Ok(())
    }

    async fn fchown(&self, fd: RawFd, _uid: Option<u32>, _gid: Option<u32>) -> io::Result<()> {
        self.file(fd).map(drop)
    }

    async fn futimes(&self, fd: RawFd, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let file = self.file(fd)?;
        let mut file = file.lock().unwrap();
        file.atime = atime;
        file.mtime = mtime;
        Ok(())
    }
}
