//! Whole-file writes.
//!
//! Data goes out in sub-writes of at most `write_max_chunk_size` bytes. Each
//! sub-write continues from wherever the previous one stopped, so a kernel
//! that accepts fewer bytes than offered never loses or repeats data.

use std::io;
use std::os::fd::RawFd;

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};

use crate::config::IoLimits;
use crate::encoding::Encoding;
use crate::error::{FsError, Result};
use crate::signal::{AbortSignal, check_aborted};
use crate::sys::RawFs;
use crate::util::open_options::OpenFlags;

/// One piece of a streamed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Bytes(Bytes),
    Text(String),
}

impl Chunk {
    fn into_bytes(self, encoding: Encoding) -> Result<Bytes> {
        match self {
            Chunk::Bytes(b) => Ok(b),
            Chunk::Text(s) => Ok(Bytes::from(encoding.encode(&s)?)),
        }
    }
}

impl From<Bytes> for Chunk {
    fn from(b: Bytes) -> Self {
        Chunk::Bytes(b)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(v: Vec<u8>) -> Self {
        Chunk::Bytes(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Chunk {
    fn from(s: &'static [u8]) -> Self {
        Chunk::Bytes(Bytes::from_static(s))
    }
}

impl From<String> for Chunk {
    fn from(s: String) -> Self {
        Chunk::Text(s)
    }
}

impl From<&str> for Chunk {
    fn from(s: &str) -> Self {
        Chunk::Text(s.to_owned())
    }
}

/// Payload of `write_file` and `append_file`.
pub enum WriteData {
    Bytes(Bytes),
    Text(String),
    /// Chunks pulled one at a time. An `Err` item fails the write.
    Stream(BoxStream<'static, io::Result<Chunk>>),
}

impl WriteData {
    /// A fallible source such as a pipe or socket.
    pub fn stream<S, C>(chunks: S) -> Self
    where
        S: Stream<Item = io::Result<C>> + Send + 'static,
        C: Into<Chunk> + 'static,
    {
        WriteData::Stream(chunks.map_ok(Into::into).boxed())
    }

    pub fn chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Chunk> + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::stream(stream::iter(chunks).map(Ok))
    }
}

impl std::fmt::Debug for WriteData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteData::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            WriteData::Text(s) => f.debug_tuple("Text").field(&s.len()).finish(),
            WriteData::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for WriteData {
    fn from(b: Bytes) -> Self {
        WriteData::Bytes(b)
    }
}

impl From<Vec<u8>> for WriteData {
    fn from(v: Vec<u8>) -> Self {
        WriteData::Bytes(Bytes::from(v))
    }
}

impl From<&'static [u8]> for WriteData {
    fn from(s: &'static [u8]) -> Self {
        WriteData::Bytes(Bytes::from_static(s))
    }
}

impl From<String> for WriteData {
    fn from(s: String) -> Self {
        WriteData::Text(s)
    }
}

impl From<&str> for WriteData {
    fn from(s: &str) -> Self {
        WriteData::Text(s.to_owned())
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteFileOptions {
    pub(crate) encoding: Option<Encoding>,
    pub(crate) mode: Option<u32>,
    pub(crate) flag: Option<OpenFlags>,
    pub(crate) signal: Option<AbortSignal>,
}

impl WriteFileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoding of text payloads. Defaults to UTF-8.
    pub fn encoding(&self) -> Encoding {
        self.encoding.unwrap_or_default()
    }

    /// Permission bits for a newly created file. Defaults to `0o666`.
    pub fn mode(&self) -> u32 {
        self.mode.unwrap_or(0o666)
    }

    pub fn flag(&self) -> Option<OpenFlags> {
        self.flag
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_flag(mut self, flag: OpenFlags) -> Self {
        self.flag = Some(flag);
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn signal(&self) -> Option<&AbortSignal> {
        self.signal.as_ref()
    }
}

/// One write syscall. Empty data never reaches the kernel.
pub(crate) async fn write_chunk(
    fs: &dyn RawFs,
    fd: RawFd,
    data: Bytes,
    position: Option<u64>,
) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    fs.write(fd, data, position)
        .await
        .map_err(|e| FsError::os("write", e))
}

/// Tracks how much of a buffer the kernel has accepted so far.
struct WriteCursor {
    data: Bytes,
    written: usize,
}

impl WriteCursor {
    fn new(data: Bytes) -> Self {
        Self { data, written: 0 }
    }

    fn is_done(&self) -> bool {
        self.written >= self.data.len()
    }

    fn next_chunk(&self, max: usize) -> Bytes {
        let end = self.data.len().min(self.written + max);
        self.data.slice(self.written..end)
    }

    fn advance(&mut self, accepted: usize) -> Result<()> {
        if accepted == 0 {
            return Err(FsError::os(
                "write",
                io::Error::new(io::ErrorKind::WriteZero, "write accepted no data"),
            ));
        }
        self.written = self.data.len().min(self.written + accepted);
        Ok(())
    }
}

/// Writes everything in `data` at the current file position.
pub(crate) async fn write_all(
    fs: &dyn RawFs,
    limits: &IoLimits,
    fd: RawFd,
    data: WriteData,
    signal: Option<&AbortSignal>,
    encoding: Encoding,
) -> Result<()> {
    check_aborted(signal)?;
    let max = limits.write_max_chunk_size;
    match data {
        WriteData::Stream(mut chunks) => {
            let mut total = 0usize;
            loop {
                check_aborted(signal)?;
                let Some(chunk) = chunks.try_next().await.map_err(|e| {
                    debug!("fd {fd}: write source failed after {total} bytes: {e}");
                    FsError::source(e)
                })?
                else {
                    break;
                };
                check_aborted(signal)?;
                let mut cursor = WriteCursor::new(chunk.into_bytes(encoding)?);
                while !cursor.is_done() {
                    let n = write_chunk(fs, fd, cursor.next_chunk(max), None).await?;
                    cursor.advance(n)?;
                    total += n;
                    check_aborted(signal)?;
                }
            }
            trace!("fd {fd}: wrote {total} bytes from stream");
            Ok(())
        }
        WriteData::Bytes(bytes) => write_buffer(fs, fd, bytes, max, signal).await,
        WriteData::Text(text) => {
            let bytes = Bytes::from(encoding.encode(&text)?);
            write_buffer(fs, fd, bytes, max, signal).await
        }
    }
}

async fn write_buffer(
    fs: &dyn RawFs,
    fd: RawFd,
    data: Bytes,
    max: usize,
    signal: Option<&AbortSignal>,
) -> Result<()> {
    let len = data.len();
    let mut cursor = WriteCursor::new(data);
    while !cursor.is_done() {
        check_aborted(signal)?;
        let n = write_chunk(fs, fd, cursor.next_chunk(max), None).await?;
        cursor.advance(n)?;
    }
    trace!("fd {fd}: wrote {len} bytes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::signal::AbortController;
    use crate::test_utils::MemFs;

    async fn open(mem: &MemFs) -> RawFd {
        mem.open(Path::new("/out"), "w".parse().unwrap(), 0o666)
            .await
            .unwrap()
    }

    fn limits(chunk: usize) -> IoLimits {
        IoLimits {
            write_max_chunk_size: chunk,
            ..IoLimits::default()
        }
    }

    #[tokio::test]
    async fn test_buffer_split_into_bounded_writes() {
        let mem = MemFs::new();
        let fd = open(&mem).await;
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        write_all(&mem, &limits(64), fd, data.clone().into(), None, Encoding::Utf8)
            .await
            .unwrap();
        assert_eq!(mem.contents("/out").unwrap(), data);
        assert_eq!(mem.writes(), 16);
        assert!(mem.write_sizes().iter().all(|&n| n <= 64));
    }

    #[tokio::test]
    async fn test_partial_writes_resume_at_accepted_offset() {
        let mem = MemFs::new().with_max_write(7);
        let fd = open(&mem).await;
        let data: Vec<u8> = (0..100u8).collect();
        write_all(&mem, &limits(32), fd, data.clone().into(), None, Encoding::Utf8)
            .await
            .unwrap();
        assert_eq!(mem.contents("/out").unwrap(), data);
        assert_eq!(mem.writes(), 15);
    }

    #[tokio::test]
    async fn test_empty_buffer_issues_no_write() {
        let mem = MemFs::new();
        let fd = open(&mem).await;
        write_all(&mem, &limits(8), fd, "".into(), None, Encoding::Utf8)
            .await
            .unwrap();
        assert_eq!(mem.writes(), 0);
    }

    #[tokio::test]
    async fn test_write_accepting_nothing_fails() {
        let mem = MemFs::new().with_max_write(0);
        let fd = open(&mem).await;
        let err = write_all(&mem, &limits(8), fd, "abc".into(), None, Encoding::Utf8)
            .await
            .unwrap_err();
        match err {
            FsError::Os(e) => assert_eq!(e.kind(), io::ErrorKind::WriteZero),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_chunks_with_encoding() {
        let mem = MemFs::new();
        let fd = open(&mem).await;
        let data = WriteData::chunks(vec![
            Chunk::from("6869"),
            Chunk::from(&b"!"[..]),
            Chunk::from(String::new()),
        ]);
        write_all(&mem, &limits(8), fd, data, None, Encoding::Hex)
            .await
            .unwrap();
        assert_eq!(mem.contents("/out").unwrap(), b"hi!");
    }

    #[tokio::test]
    async fn test_stream_source_error_fails_write() {
        let mem = MemFs::new();
        let fd = open(&mem).await;
        let data = WriteData::stream(stream::iter(vec![
            Ok(Chunk::from("first ")),
            Err(io::Error::from(io::ErrorKind::BrokenPipe)),
            Ok(Chunk::from("never")),
        ]));
        let err = write_all(&mem, &limits(16), fd, data, None, Encoding::Utf8)
            .await
            .unwrap_err();
        match &err {
            FsError::Source(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(mem.contents("/out").unwrap(), b"first ");
    }

    #[tokio::test]
    async fn test_abort_between_sub_writes() {
        let mem = Arc::new(MemFs::new());
        let fd = open(&mem).await;
        let controller = AbortController::new();
        let hook = controller.clone();
        mem.on_write(move |_| hook.abort("enough"));

        let err = write_all(
            mem.as_ref(),
            &limits(4),
            fd,
            "abcdefghijkl".into(),
            Some(&controller.signal()),
            Encoding::Utf8,
        )
        .await
        .unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(mem.writes(), 1);
        assert_eq!(mem.contents("/out").unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_abort_before_next_stream_chunk() {
        let mem = Arc::new(MemFs::new());
        let fd = open(&mem).await;
        let controller = AbortController::new();
        let hook = controller.clone();
        mem.on_write(move |_| hook.abort("enough"));

        let data = WriteData::chunks(["one", "two"]);
        let err = write_all(
            mem.as_ref(),
            &limits(16),
            fd,
            data,
            Some(&controller.signal()),
            Encoding::Utf8,
        )
        .await
        .unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(mem.contents("/out").unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_already_aborted_writes_nothing() {
        let mem = MemFs::new();
        let fd = open(&mem).await;
        let controller = AbortController::new();
        controller.abort("early");
        let err = write_all(
            &mem,
            &limits(16),
            fd,
            "abc".into(),
            Some(&controller.signal()),
            Encoding::Utf8,
        )
        .await
        .unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(mem.writes(), 0);
    }
}
