//! Path-level entry points.
//!
//! [`Fs`] opens handles and runs one-shot whole-file operations. A one-shot
//! operation on a path opens a transient handle and always closes it again,
//! whether the operation succeeded or not.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::IoLimits;
use crate::error::{FsError, Result};
use crate::handle::FileHandle;
use crate::read::{FileContents, ReadFileOptions};
use crate::signal::check_aborted;
use crate::sys::{RawFs, SysFs};
use crate::util::open_options::OpenFlags;
use crate::util::path::validated_path;
use crate::write::{WriteData, WriteFileOptions};

/// Where a whole-file operation reads from or writes to.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// Opened for the operation and closed afterwards.
    Path(&'a Path),
    /// Used as is; the caller keeps it open.
    Handle(&'a FileHandle),
}

impl<'a> From<&'a Path> for Target<'a> {
    fn from(p: &'a Path) -> Self {
        Target::Path(p)
    }
}

impl<'a> From<&'a PathBuf> for Target<'a> {
    fn from(p: &'a PathBuf) -> Self {
        Target::Path(p.as_path())
    }
}

impl<'a> From<&'a str> for Target<'a> {
    fn from(p: &'a str) -> Self {
        Target::Path(Path::new(p))
    }
}

impl<'a> From<&'a FileHandle> for Target<'a> {
    fn from(h: &'a FileHandle) -> Self {
        Target::Handle(h)
    }
}

/// Awaits `op`, then closes `handle` no matter how `op` ended.
///
/// A close failure is only reported when the operation itself succeeded;
/// when both fail the result carries both errors.
pub async fn close_after<T>(
    handle: &FileHandle,
    op: impl Future<Output = Result<T>>,
) -> Result<T> {
    let res = op.await;
    let closed = handle.close().await;
    match (res, closed) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(close)) => Err(close),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close)) => {
            debug!("close after failed operation also failed: {close}");
            Err(FsError::aggregate(e, close))
        }
    }
}

#[derive(Clone)]
pub struct Fs {
    raw: Arc<dyn RawFs>,
    limits: IoLimits,
}

impl std::fmt::Debug for Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fs").field("limits", &self.limits).finish()
    }
}

impl Default for Fs {
    fn default() -> Self {
        Self::system()
    }
}

impl Fs {
    pub fn new(raw: impl RawFs) -> Self {
        Self {
            raw: Arc::new(raw),
            limits: IoLimits::default(),
        }
    }

    pub fn with_limits(raw: impl RawFs, limits: IoLimits) -> Result<Self> {
        Self::from_shared(Arc::new(raw), limits)
    }

    /// Builds an `Fs` over a backend that is also used elsewhere.
    pub fn from_shared(raw: Arc<dyn RawFs>, limits: IoLimits) -> Result<Self> {
        limits.validate()?;
        Ok(Self { raw, limits })
    }

    /// The host filesystem with default limits.
    pub fn system() -> Self {
        Self::new(SysFs::new())
    }

    pub fn limits(&self) -> &IoLimits {
        &self.limits
    }

    /// Opens `path`. The caller owns the returned handle and must close it.
    pub async fn open(
        &self,
        path: impl AsRef<Path>,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<FileHandle> {
        let path = validated_path(path.as_ref())?;
        let fd = self
            .raw
            .open(&path, flags, mode)
            .await
            .map_err(|e| FsError::os("open", e))?;
        debug!("opened {} as fd {fd} (flags {flags})", path.display());
        Ok(FileHandle::new(Arc::clone(&self.raw), self.limits, fd))
    }

    pub async fn read_file<'a>(
        &self,
        target: impl Into<Target<'a>>,
        options: &ReadFileOptions,
    ) -> Result<FileContents> {
        match target.into() {
            Target::Handle(handle) => handle.read_file(options).await,
            Target::Path(path) => {
                check_aborted(options.signal())?;
                let flag = options.flag().unwrap_or(OpenFlags::READ_ONLY);
                let handle = self.open(path, flag, 0o666).await?;
                close_after(&handle, handle.read_file(options)).await
            }
        }
    }

    /// Replaces the contents of a path, or writes at the current position of
    /// a handle.
    pub async fn write_file<'a>(
        &self,
        target: impl Into<Target<'a>>,
        data: impl Into<WriteData>,
        options: &WriteFileOptions,
    ) -> Result<()> {
        self.write_with_default_flag(target.into(), data.into(), options, truncate_flags())
            .await
    }

    pub async fn append_file<'a>(
        &self,
        target: impl Into<Target<'a>>,
        data: impl Into<WriteData>,
        options: &WriteFileOptions,
    ) -> Result<()> {
        self.write_with_default_flag(target.into(), data.into(), options, append_flags())
            .await
    }

    async fn write_with_default_flag(
        &self,
        target: Target<'_>,
        data: WriteData,
        options: &WriteFileOptions,
        default_flag: OpenFlags,
    ) -> Result<()> {
        // Text is encoded before the file is touched, so a bad payload
        // leaves an existing file alone.
        let data = match data {
            WriteData::Text(text) => WriteData::Bytes(options.encoding().encode(&text)?.into()),
            other => other,
        };
        match target {
            Target::Handle(handle) => handle.write_file(data, options).await,
            Target::Path(path) => {
                check_aborted(options.signal())?;
                let flag = options.flag().unwrap_or(default_flag);
                let handle = self.open(path, flag, options.mode()).await?;
                close_after(&handle, handle.write_file(data, options)).await
            }
        }
    }

    /// Truncates or extends the file at `path` to `len` bytes.
    pub async fn truncate(&self, path: impl AsRef<Path>, len: u64) -> Result<()> {
        let handle = self.open(path, OpenFlags::READ_WRITE, 0o666).await?;
        close_after(&handle, handle.truncate(len)).await
    }
}

fn truncate_flags() -> OpenFlags {
    OpenFlags::WRITE_ONLY | OpenFlags::CREATE | OpenFlags::TRUNCATE
}

fn append_flags() -> OpenFlags {
    OpenFlags::WRITE_ONLY | OpenFlags::CREATE | OpenFlags::APPEND
}
