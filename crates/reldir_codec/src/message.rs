//! Positional record encoding.
//!
//! A message is encoded as an array whose positions are its fields. New
//! fields are only ever appended, so a reader skips positions it does not
//! know and fills positions a writer did not send with their defaults.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// A record with a positional binary form.
pub trait Message: Sized {
    /// Name used in error messages.
    const NAME: &'static str;

    /// Converts the record into its positional array.
    fn to_value(&self) -> Value;

    /// Rebuilds the record from its positional array.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an array or a field has the
    /// wrong type.
    fn from_value(value: Value) -> CodecResult<Self>;
}

/// Sequential reader over the fields of one message.
#[derive(Debug)]
pub struct Fields {
    message: &'static str,
    items: std::vec::IntoIter<Value>,
    index: usize,
}

impl Fields {
    /// Starts reading the fields of message `M`.
    ///
    /// # Errors
    ///
    /// Returns `FieldType` if `value` is not an array.
    pub fn of<M: Message>(value: Value) -> CodecResult<Self> {
        match value {
            Value::Array(items) => Ok(Self {
                message: M::NAME,
                items: items.into_iter(),
                index: 0,
            }),
            other => Err(CodecError::FieldType {
                message: M::NAME,
                index: 0,
                expected: "array",
                found: other.type_name(),
            }),
        }
    }

    fn next(&mut self) -> (usize, Value) {
        let index = self.index;
        self.index += 1;
        (index, self.items.next().unwrap_or(Value::Null))
    }

    fn mismatch(&self, index: usize, expected: &'static str, found: &Value) -> CodecError {
        CodecError::FieldType {
            message: self.message,
            index,
            expected,
            found: found.type_name(),
        }
    }

    /// Reads a text field; absent reads as empty.
    ///
    /// # Errors
    ///
    /// `FieldType` for a non-text value.
    pub fn text(&mut self) -> CodecResult<String> {
        match self.next() {
            (_, Value::Text(s)) => Ok(s),
            (_, Value::Null) => Ok(String::new()),
            (index, other) => Err(self.mismatch(index, "text", &other)),
        }
    }

    /// Reads a byte-string field; absent reads as empty.
    ///
    /// # Errors
    ///
    /// `FieldType` for a non-bytes value.
    pub fn bytes(&mut self) -> CodecResult<Vec<u8>> {
        match self.next() {
            (_, Value::Bytes(b)) => Ok(b),
            (_, Value::Null) => Ok(Vec::new()),
            (index, other) => Err(self.mismatch(index, "bytes", &other)),
        }
    }

    /// Reads an integer field; absent reads as zero.
    ///
    /// # Errors
    ///
    /// `FieldType` for a non-integer value.
    pub fn integer(&mut self) -> CodecResult<i64> {
        match self.next() {
            (_, Value::Integer(n)) => Ok(n),
            (_, Value::Null) => Ok(0),
            (index, other) => Err(self.mismatch(index, "integer", &other)),
        }
    }

    /// Reads a boolean field; absent reads as false.
    ///
    /// # Errors
    ///
    /// `FieldType` for a non-boolean value.
    pub fn boolean(&mut self) -> CodecResult<bool> {
        match self.next() {
            (_, Value::Bool(b)) => Ok(b),
            (_, Value::Null) => Ok(false),
            (index, other) => Err(self.mismatch(index, "bool", &other)),
        }
    }

    /// Reads an optional field with a custom conversion.
    ///
    /// # Errors
    ///
    /// Whatever `convert` returns.
    pub fn optional<T>(
        &mut self,
        convert: impl FnOnce(Value) -> CodecResult<T>,
    ) -> CodecResult<Option<T>> {
        match self.next() {
            (_, Value::Null) => Ok(None),
            (_, value) => convert(value).map(Some),
        }
    }

    /// Reads an embedded message; absent reads as `None`.
    ///
    /// # Errors
    ///
    /// Errors from the embedded message.
    pub fn message<M: Message>(&mut self) -> CodecResult<Option<M>> {
        self.optional(M::from_value)
    }

    /// Reads a repeated embedded message; absent reads as empty.
    ///
    /// # Errors
    ///
    /// `FieldType` for a non-array value or errors from the elements.
    pub fn repeated<M: Message>(&mut self) -> CodecResult<Vec<M>> {
        match self.next() {
            (_, Value::Array(items)) => items.into_iter().map(M::from_value).collect(),
            (_, Value::Null) => Ok(Vec::new()),
            (index, other) => Err(self.mismatch(index, "array", &other)),
        }
    }
}

/// Converts a list of messages into an array value.
pub fn repeated<M: Message>(items: &[M]) -> Value {
    Value::Array(items.iter().map(Message::to_value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Tag {
        name: String,
        weight: i64,
    }

    impl Message for Tag {
        const NAME: &'static str = "Tag";

        fn to_value(&self) -> Value {
            Value::Array(vec![Value::text(&self.name), Value::Integer(self.weight)])
        }

        fn from_value(value: Value) -> CodecResult<Self> {
            let mut f = Fields::of::<Self>(value)?;
            Ok(Self {
                name: f.text()?,
                weight: f.integer()?,
            })
        }
    }

    #[test]
    fn missing_trailing_fields_take_defaults() {
        let tag = Tag::from_value(Value::Array(vec![Value::text("a")])).unwrap();
        assert_eq!(
            tag,
            Tag {
                name: "a".into(),
                weight: 0
            }
        );
    }

    #[test]
    fn unknown_trailing_fields_are_ignored() {
        let value = Value::Array(vec![
            Value::text("a"),
            Value::Integer(2),
            Value::text("added later"),
        ]);
        assert_eq!(Tag::from_value(value).unwrap().weight, 2);
    }

    #[test]
    fn wrong_field_type_names_the_position() {
        let value = Value::Array(vec![Value::text("a"), Value::text("heavy")]);
        assert_eq!(
            Tag::from_value(value),
            Err(CodecError::FieldType {
                message: "Tag",
                index: 1,
                expected: "integer",
                found: "text",
            })
        );
        assert!(Tag::from_value(Value::Integer(1)).is_err());
    }

    #[test]
    fn repeated_messages() {
        let tags = vec![
            Tag {
                name: "a".into(),
                weight: 1,
            },
            Tag {
                name: "b".into(),
                weight: 2,
            },
        ];
        let mut f = Fields::of::<Tag>(Value::Array(vec![repeated(&tags)])).unwrap();
        assert_eq!(f.repeated::<Tag>().unwrap(), tags);
        assert!(f.repeated::<Tag>().unwrap().is_empty());
    }
}
