//! Canonical CBOR decoder.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Upper bound on array element counts accepted from input.
const MAX_CONTAINER_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Upper bound on byte and text string lengths accepted from input.
const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

/// Arrays nested deeper than this are rejected.
const MAX_NESTING: usize = 64;

/// Decodes exactly one value from `bytes`.
///
/// # Errors
///
/// Returns an error for malformed or non-canonical input, for CBOR types
/// outside [`Value`], and for trailing bytes.
pub fn decode(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.read()?;
    match decoder.remaining() {
        0 => Ok(value),
        count => Err(CodecError::TrailingBytes { count }),
    }
}

/// A strict reader over canonical CBOR input.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    /// Returns the number of unread bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Reads the next value.
    ///
    /// # Errors
    ///
    /// See [`decode`].
    pub fn read(&mut self) -> CodecResult<Value> {
        let initial = self.byte()?;
        let major = initial >> 5;
        let info = initial & 0x1f;

        match major {
            0 => {
                let n = self.argument(info)?;
                i64::try_from(n)
                    .map(Value::Integer)
                    .map_err(|_| CodecError::decoding_failed("integer exceeds i64"))
            }
            1 => {
                let n = self.argument(info)?;
                i64::try_from(n)
                    .map(|n| Value::Integer(-1 - n))
                    .map_err(|_| CodecError::decoding_failed("integer below i64::MIN"))
            }
            2 => {
                let len = self.length(info, MAX_BYTES_LENGTH)?;
                Ok(Value::Bytes(self.take(len)?.to_vec()))
            }
            3 => {
                let len = self.length(info, MAX_BYTES_LENGTH)?;
                let raw = self.take(len)?;
                let text = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Value::Text(text.to_string()))
            }
            4 => self.array(info),
            5 => Err(CodecError::unsupported_type("map")),
            6 => Err(CodecError::unsupported_type("tag")),
            _ => self.simple(info),
        }
    }

    fn array(&mut self, info: u8) -> CodecResult<Value> {
        let len = self.length(info, MAX_CONTAINER_ELEMENTS)?;
        if self.depth >= MAX_NESTING {
            return Err(CodecError::decoding_failed("arrays nested too deeply"));
        }
        self.depth += 1;
        // Every element takes at least one byte.
        let mut items = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            items.push(self.read()?);
        }
        self.depth -= 1;
        Ok(Value::Array(items))
    }

    fn simple(&mut self, info: u8) -> CodecResult<Value> {
        match info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 => Ok(Value::Null),
            25..=27 => Err(CodecError::FloatForbidden),
            31 => Err(CodecError::IndefiniteLengthForbidden),
            other => Err(CodecError::unsupported_type(format!("simple value {other}"))),
        }
    }

    fn length(&mut self, info: u8, max: u64) -> CodecResult<usize> {
        let claimed = self.argument(info)?;
        if claimed > max {
            return Err(CodecError::SizeLimitExceeded {
                claimed,
                max_allowed: max,
            });
        }
        usize::try_from(claimed).map_err(|_| CodecError::SizeLimitExceeded {
            claimed,
            max_allowed: max,
        })
    }

    fn argument(&mut self, info: u8) -> CodecResult<u64> {
        let (value, floor) = match info {
            0..=23 => return Ok(u64::from(info)),
            24 => (u64::from(self.byte()?), 24),
            25 => (u64::from(u16::from_be_bytes(self.array_of::<2>()?)), 0x100),
            26 => (u64::from(u32::from_be_bytes(self.array_of::<4>()?)), 0x1_0000),
            27 => (u64::from_be_bytes(self.array_of::<8>()?), 0x1_0000_0000),
            31 => return Err(CodecError::IndefiniteLengthForbidden),
            _ => return Err(CodecError::decoding_failed("reserved additional info")),
        };
        if value < floor {
            return Err(CodecError::non_canonical(format!(
                "{value} could be encoded in fewer bytes"
            )));
        }
        Ok(value)
    }

    fn byte(&mut self) -> CodecResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let slice = self.data.get(self.pos..end).ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn array_of<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}
