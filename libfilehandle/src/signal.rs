//! Cooperative cancellation for whole-file reads and writes.
//!
//! An [`AbortSignal`] never interrupts a syscall in flight. The read and write
//! loops poll it between syscalls and bail out with [`FsError::Aborted`].

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{FsError, Result};

const TIMEOUT_REASON: &str = "The operation was aborted due to timeout";

#[derive(Debug, Default)]
struct SignalInner {
    token: CancellationToken,
    reason: OnceLock<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

impl AbortSignal {
    /// A signal that aborts by itself once `duration` has elapsed.
    ///
    /// The timer runs on the current tokio runtime, or on a dedicated thread
    /// when called outside of one.
    pub fn timeout(duration: Duration) -> AbortSignal {
        let controller = AbortController::new();
        let signal = controller.signal();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    tokio::time::sleep(duration).await;
                    controller.abort(TIMEOUT_REASON);
                });
            }
            Err(_) => {
                debug!("no tokio runtime, timing out abort signal on a thread");
                std::thread::spawn(move || {
                    std::thread::sleep(duration);
                    controller.abort(TIMEOUT_REASON);
                });
            }
        }
        signal
    }

    pub fn aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<&str> {
        self.inner.reason.get().map(String::as_str)
    }

    /// Resolves once the signal fires.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.aborted() {
            return Err(FsError::Aborted {
                reason: self.reason().map(str::to_owned),
            });
        }
        Ok(())
    }
}

/// Checks an optional signal; `None` never aborts.
pub(crate) fn check_aborted(signal: Option<&AbortSignal>) -> Result<()> {
    signal.map_or(Ok(()), AbortSignal::check)
}

#[derive(Debug, Clone, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fires the signal. Only the first reason is kept.
    pub fn abort(&self, reason: impl Into<String>) {
        let inner = &self.signal.inner;
        if inner.reason.set(reason.into()).is_ok() {
            debug!("abort signal fired: {}", inner.reason.get().map_or("", String::as_str));
        }
        inner.token.cancel();
    }
}
