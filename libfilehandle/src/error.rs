use std::io;
use std::sync::Arc;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

/// A failed syscall, tagged with the name of the call that failed.
///
/// The underlying `io::Error` sits behind an `Arc` so that one close outcome
/// can be handed to every caller awaiting it.
#[derive(Debug, Clone, Error)]
#[error("{source}, {syscall}")]
pub struct OsError {
    syscall: &'static str,
    #[source]
    source: Arc<io::Error>,
}

impl OsError {
    pub fn new(syscall: &'static str, source: io::Error) -> Self {
        Self {
            syscall,
            source: Arc::new(source),
        }
    }

    /// `EBADF` raised when an operation reaches a handle that is already closed.
    pub fn closed(syscall: &'static str) -> Self {
        Self::new(syscall, io::Error::from_raw_os_error(libc::EBADF))
    }

    pub fn syscall(&self) -> &'static str {
        self.syscall
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        self.source.raw_os_error()
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

#[derive(Debug, Clone, Error)]
pub enum FsError {
    #[error(transparent)]
    Os(#[from] OsError),

    #[error("The operation was aborted")]
    Aborted { reason: Option<String> },

    #[error("File size ({size}) is greater than {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    /// The stream feeding a write failed; nothing after the failure was written.
    #[error("write source failed: {0}")]
    Source(#[source] Arc<io::Error>),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation failed and closing the transient handle failed too.
    #[error("{operation}")]
    Aggregate {
        operation: Box<FsError>,
        close: Box<FsError>,
    },
}

impl FsError {
    pub fn os(syscall: &'static str, source: io::Error) -> Self {
        FsError::Os(OsError::new(syscall, source))
    }

    pub fn source(err: io::Error) -> Self {
        FsError::Source(Arc::new(err))
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        FsError::InvalidArgument(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        FsError::InvalidState(msg.into())
    }

    /// Joins an operation failure with the failure of the close that followed it.
    pub fn aggregate(operation: FsError, close: FsError) -> Self {
        FsError::Aggregate {
            operation: Box::new(operation),
            close: Box::new(close),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FsError::Os(e) => e.raw_os_error().map(errno_name).unwrap_or("EIO"),
            FsError::Aborted { .. } => "ABORT_ERR",
            FsError::FileTooLarge { .. } => "ERR_FS_FILE_TOO_LARGE",
            FsError::Source(e) => e.raw_os_error().map(errno_name).unwrap_or("ERR_WRITE_SOURCE"),
            FsError::InvalidState(_) => "ERR_INVALID_STATE",
            FsError::InvalidArgument(_) => "ERR_INVALID_ARG_VALUE",
            FsError::Aggregate { operation, .. } => operation.code(),
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            FsError::Os(e) => e.raw_os_error(),
            FsError::Source(e) => e.raw_os_error(),
            FsError::Aggregate { operation, .. } => operation.raw_os_error(),
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, FsError::Aborted { .. })
    }
}

impl From<FsError> for io::Error {
    fn from(err: FsError) -> Self {
        let kind = match &err {
            FsError::Os(e) => {
                if let Some(errno) = e.raw_os_error() {
                    return io::Error::from_raw_os_error(errno);
                }
                e.kind()
            }
            FsError::Aborted { .. } => io::ErrorKind::Interrupted,
            FsError::FileTooLarge { .. } => io::ErrorKind::FileTooLarge,
            FsError::Source(e) => e.kind(),
            FsError::InvalidState(_) => io::ErrorKind::Other,
            FsError::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            FsError::Aggregate { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

fn errno_name(errno: i32) -> &'static str {
    match errno {
        libc::ENOENT => "ENOENT",
        libc::EACCES => "EACCES",
        libc::EPERM => "EPERM",
        libc::EBADF => "EBADF",
        libc::EEXIST => "EEXIST",
        libc::EISDIR => "EISDIR",
        libc::ENOTDIR => "ENOTDIR",
        libc::EINVAL => "EINVAL",
        libc::EMFILE => "EMFILE",
        libc::ENOSPC => "ENOSPC",
        libc::EROFS => "EROFS",
        libc::EAGAIN => "EAGAIN",
        libc::EINTR => "EINTR",
        _ => "EIO",
    }
}
