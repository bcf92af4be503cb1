//! Text encodings accepted by the whole-file read/write paths.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

use crate::error::{FsError, Result};

const REPLACEMENT: char = '\u{FFFD}';

/// Decoder for base64 input as it appears in the wild: padding optional.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Utf16Le,
    Latin1,
    Ascii,
    Base64,
    Hex,
}

impl FromStr for Encoding {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        let encoding = match s.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Encoding::Utf8,
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Encoding::Utf16Le,
            "latin1" | "binary" => Encoding::Latin1,
            "ascii" => Encoding::Ascii,
            "base64" => Encoding::Base64,
            "hex" => Encoding::Hex,
            _ => {
                return Err(FsError::invalid_argument(format!(
                    "unknown encoding: {s}"
                )));
            }
        };
        Ok(encoding)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Encoding::Utf8 => "utf8",
            Encoding::Utf16Le => "utf16le",
            Encoding::Latin1 => "latin1",
            Encoding::Ascii => "ascii",
            Encoding::Base64 => "base64",
            Encoding::Hex => "hex",
        };
        f.write_str(name)
    }
}

impl Encoding {
    /// Converts text into the bytes that end up on disk.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Utf16Le => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
            // One byte per UTF-16 code unit, high byte dropped.
            Encoding::Latin1 | Encoding::Ascii => {
                Ok(text.encode_utf16().map(|unit| unit as u8).collect())
            }
            Encoding::Base64 => {
                let cleaned: String = text
                    .chars()
                    .filter(|c| !c.is_ascii_whitespace())
                    .map(|c| match c {
                        '-' => '+',
                        '_' => '/',
                        c => c,
                    })
                    .collect();
                LENIENT_BASE64
                    .decode(cleaned.trim_end_matches('='))
                    .map_err(|e| FsError::invalid_argument(format!("invalid base64 data: {e}")))
            }
            Encoding::Hex => {
                let valid = text
                    .bytes()
                    .take_while(u8::is_ascii_hexdigit)
                    .count();
                hex::decode(&text[..valid - valid % 2])
                    .map_err(|e| FsError::invalid_argument(format!("invalid hex data: {e}")))
            }
        }
    }

    /// Decodes a complete byte sequence in one go.
    pub fn decode(&self, bytes: &[u8]) -> String {
        StringDecoder::new(*self).end(bytes)
    }
}

/// Incremental decoder that carries incomplete characters between calls.
///
/// Feeding a multi-byte character one byte at a time yields the character
/// once its last byte arrives, never replacement characters for the pieces.
#[derive(Debug, Clone)]
pub struct StringDecoder {
    encoding: Encoding,
    pending: Vec<u8>,
}

impl StringDecoder {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            pending: Vec::new(),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn write(&mut self, input: &[u8]) -> String {
        match self.encoding {
            Encoding::Utf8 => {
                let data = self.take_pending(input);
                decode_utf8(&data, &mut self.pending)
            }
            Encoding::Utf16Le => {
                let data = self.take_pending(input);
                decode_utf16le(&data, &mut self.pending)
            }
            Encoding::Base64 => {
                let data = self.take_pending(input);
                let keep = data.len() % 3;
                let (whole, rest) = data.split_at(data.len() - keep);
                self.pending.extend_from_slice(rest);
                STANDARD.encode(whole)
            }
            Encoding::Latin1 => input.iter().map(|&b| b as char).collect(),
            Encoding::Ascii => input.iter().map(|&b| (b & 0x7f) as char).collect(),
            Encoding::Hex => hex::encode(input),
        }
    }

    /// Decodes the final piece of input and flushes whatever is still held back.
    pub fn end(&mut self, input: &[u8]) -> String {
        let mut out = self.write(input);
        if !self.pending.is_empty() {
            match self.encoding {
                Encoding::Utf8 => out.push(REPLACEMENT),
                // A lone trailing byte carries no code unit.
                Encoding::Utf16Le if self.pending.len() >= 2 => out.push(REPLACEMENT),
                Encoding::Base64 => out.push_str(&STANDARD.encode(&self.pending)),
                _ => {}
            }
            self.pending.clear();
        }
        out
    }

    fn take_pending(&mut self, input: &[u8]) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(input);
        data
    }
}

fn decode_utf8(mut data: &[u8], pending: &mut Vec<u8>) -> String {
    let mut out = String::with_capacity(data.len());
    loop {
        match std::str::from_utf8(data) {
            Ok(s) => {
                out.push_str(s);
                return out;
            }
            Err(e) => {
                let (valid, rest) = data.split_at(e.valid_up_to());
                out.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(bad) => {
                        out.push(REPLACEMENT);
                        data = &rest[bad..];
                    }
                    None => {
                        // Incomplete sequence at the end: wait for more input.
                        pending.extend_from_slice(rest);
                        return out;
                    }
                }
            }
        }
    }
}

fn decode_utf16le(data: &[u8], pending: &mut Vec<u8>) -> String {
    let mut end = data.len() - data.len() % 2;
    if end >= 2 {
        let last = u16::from_le_bytes([data[end - 2], data[end - 1]]);
        if (0xD800..=0xDBFF).contains(&last) {
            end -= 2;
        }
    }
    pending.extend_from_slice(&data[end..]);
    let units = data[..end]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(REPLACEMENT))
        .collect()
}
