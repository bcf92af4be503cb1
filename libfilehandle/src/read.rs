//! Whole-file reads.
//!
//! Regular files are read into one buffer sized from `fstat`, in chunks when
//! they are large. Files whose size is unknown (pipes, character devices,
//! procfs entries reporting zero) are read into fixed-size buffers that are
//! concatenated at the end.

use std::mem;
use std::os::fd::RawFd;

use crate::config::IoLimits;
use crate::encoding::{Encoding, StringDecoder};
use crate::error::{FsError, Result};
use crate::signal::{AbortSignal, check_aborted};
use crate::sys::RawFs;
use crate::util::open_options::OpenFlags;

/// What `read_file` produced: raw bytes, or text when an encoding was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContents {
    Bytes(Vec<u8>),
    Text(String),
}

impl FileContents {
    /// Raw bytes; text is returned as its UTF-8 bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            FileContents::Bytes(b) => b,
            FileContents::Text(s) => s.into_bytes(),
        }
    }

    /// Text; raw bytes are decoded as UTF-8.
    pub fn into_text(self) -> String {
        match self {
            FileContents::Bytes(b) => Encoding::Utf8.decode(&b),
            FileContents::Text(s) => s,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FileContents::Bytes(b) => b.len(),
            FileContents::Text(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadFileOptions {
    pub(crate) encoding: Option<Encoding>,
    pub(crate) flag: Option<OpenFlags>,
    pub(crate) signal: Option<AbortSignal>,
}

impl ReadFileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` returns raw bytes.
    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    pub fn flag(&self) -> Option<OpenFlags> {
        self.flag
    }

    pub fn signal(&self) -> Option<&AbortSignal> {
        self.signal.as_ref()
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
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
}

/// Reads `fd` from its current position to end of file.
pub(crate) async fn read_all(
    fs: &dyn RawFs,
    limits: &IoLimits,
    fd: RawFd,
    options: &ReadFileOptions,
) -> Result<FileContents> {
    let signal = options.signal();
    let mut decoder = options.encoding.map(StringDecoder::new);

    check_aborted(signal)?;
    let stat = fs.fstat(fd).await.map_err(|e| FsError::os("fstat", e))?;
    check_aborted(signal)?;

    let mut size = 0u64;
    let mut length = 0u64;
    if stat.is_file() {
        size = stat.size;
        length = if decoder.is_some() {
            size.min(limits.read_buffer_length as u64)
        } else {
            size
        };
    }
    if length == 0 {
        length = limits.unknown_size_buffer_length as u64;
    }
    let too_large = || FsError::FileTooLarge {
        size,
        limit: limits.io_max_length,
    };
    if size > limits.io_max_length {
        return Err(too_large());
    }
    let mut length = usize::try_from(length).map_err(|_| too_large())?;
    let size = usize::try_from(size).map_err(|_| too_large())?;

    let chunked = length > limits.read_buffer_length;
    debug!("fd {fd}: reading file of size {size}, buffer {length}, chunked {chunked}");

    let mut buffer = vec![0u8; length];
    let mut buffers: Vec<Vec<u8>> = Vec::new();
    let mut text = String::new();
    let mut offset = 0usize;
    let mut total = 0usize;

    loop {
        check_aborted(signal)?;

        if chunked {
            length = (size - total).min(limits.read_buffer_length);
        }

        let (bytes_read, buf) = fs
            .read(fd, buffer, offset, length, None)
            .await
            .map_err(|e| FsError::os("read", e))?;
        buffer = buf;
        total += bytes_read;
        trace!("fd {fd}: read {bytes_read} bytes, {total} so far");

        if bytes_read == 0 || total == size || (bytes_read != buffer.len() && !chunked) {
            let single_read = bytes_read == total;
            buffer.truncate(if chunked { total } else { bytes_read });

            let Some(decoder) = decoder.as_mut() else {
                if size == 0 && !single_read {
                    buffers.push(buffer);
                    return Ok(FileContents::Bytes(buffers.concat()));
                }
                return Ok(FileContents::Bytes(buffer));
            };
            text.push_str(&decoder.end(&buffer));
            return Ok(FileContents::Text(text));
        }

        match decoder.as_mut() {
            Some(decoder) => text.push_str(&decoder.write(&buffer)),
            None if size != 0 => offset = total,
            None => buffers.push(mem::replace(
                &mut buffer,
                vec![0u8; limits.unknown_size_buffer_length],
            )),
        }
    }
}
