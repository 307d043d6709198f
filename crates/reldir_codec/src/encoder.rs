//! Canonical CBOR encoder.
//!
//! Output is deterministic: integers and lengths always take their shortest
//! form and nothing is indefinite-length, so equal values always produce
//! equal bytes.

use crate::value::Value;

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;

const FALSE: u8 = 0xf4;
const TRUE: u8 = 0xf5;
const NULL: u8 = 0xf6;

/// Encodes a value to canonical CBOR bytes.
#[must_use]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut encoder = Encoder::default();
    encoder.write(value);
    encoder.into_bytes()
}

/// An append-only canonical CBOR writer.
#[derive(Debug, Default)]
pub struct Encoder {
    buffer: Vec<u8>,
}

impl Encoder {
    /// Creates an encoder with room for `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Appends one value.
    pub fn write(&mut self, value: &Value) {
        match value {
            Value::Null => self.buffer.push(NULL),
            Value::Bool(b) => self.buffer.push(if *b { TRUE } else { FALSE }),
            Value::Integer(n) => self.write_integer(*n),
            Value::Bytes(bytes) => {
                self.write_head(MAJOR_BYTES, bytes.len() as u64);
                self.buffer.extend_from_slice(bytes);
            }
            Value::Text(text) => {
                self.write_head(MAJOR_TEXT, text.len() as u64);
                self.buffer.extend_from_slice(text.as_bytes());
            }
            Value::Array(items) => {
                self.write_head(MAJOR_ARRAY, items.len() as u64);
                for item in items {
                    self.write(item);
                }
            }
        }
    }

    /// Returns the bytes written so far.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    #[allow(clippy::cast_sign_loss)]
    fn write_integer(&mut self, n: i64) {
        if n >= 0 {
            self.write_head(MAJOR_UNSIGNED, n as u64);
        } else {
            // -1 encodes as argument 0, i64::MIN as i64::MAX.
            self.write_head(MAJOR_NEGATIVE, !(n as u64));
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_head(&mut self, major: u8, argument: u64) {
        let major = major << 5;
        if argument < 24 {
            self.buffer.push(major | argument as u8);
        } else if argument <= u64::from(u8::MAX) {
            self.buffer.extend_from_slice(&[major | 24, argument as u8]);
        } else if argument <= u64::from(u16::MAX) {
            self.buffer.push(major | 25);
            self.buffer
                .extend_from_slice(&(argument as u16).to_be_bytes());
        } else if argument <= u64::from(u32::MAX) {
            self.buffer.push(major | 26);
            self.buffer
                .extend_from_slice(&(argument as u32).to_be_bytes());
        } else {
            self.buffer.push(major | 27);
            self.buffer.extend_from_slice(&argument.to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_use_shortest_form() {
        assert_eq!(encode(&Value::Integer(0)), [0x00]);
        assert_eq!(encode(&Value::Integer(23)), [0x17]);
        assert_eq!(encode(&Value::Integer(24)), [0x18, 24]);
        assert_eq!(encode(&Value::Integer(1000)), [0x19, 0x03, 0xe8]);
        assert_eq!(encode(&Value::Integer(-1)), [0x20]);
        assert_eq!(encode(&Value::Integer(-500)), [0x39, 0x01, 0xf3]);
        assert_eq!(
            encode(&Value::Integer(i64::MIN)),
            [0x3b, 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn simple_values() {
        assert_eq!(encode(&Value::Null), [0xf6]);
        assert_eq!(encode(&Value::Bool(true)), [0xf5]);
        assert_eq!(encode(&Value::Bool(false)), [0xf4]);
    }

    #[test]
    fn strings_and_arrays() {
        assert_eq!(encode(&Value::text("user")), b"\x64user");
        assert_eq!(encode(&Value::Bytes(vec![1, 2])), [0x42, 1, 2]);
        assert_eq!(
            encode(&Value::Array(vec![Value::Integer(1), Value::text("a")])),
            [0x82, 0x01, 0x61, b'a']
        );
    }

    #[test]
    fn deterministic() {
        let value = Value::Array(vec![
            Value::text("folder"),
            Value::text("root"),
            Value::Array(vec![Value::Integer(1_700_000_000), Value::Integer(0)]),
        ]);
        assert_eq!(encode(&value), encode(&value.clone()));
    }
}
