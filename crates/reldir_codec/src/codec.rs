//! Pluggable value codecs.
//!
//! Stored values are read and written through a [`Codec`], so the same
//! typed access code serves every schema generation: the JSON layouts of
//! older databases and the current binary layout.

use crate::decoder::decode;
use crate::encoder::encode;
use crate::error::CodecResult;
use crate::message::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Marshals values of type `T` to and from bytes.
pub trait Codec<T> {
    /// Encodes a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented.
    fn encode(value: &T) -> CodecResult<Vec<u8>>;

    /// Decodes a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding of `T`.
    fn decode(bytes: &[u8]) -> CodecResult<T>;
}

/// The compact binary encoding (canonical CBOR positional arrays).
#[derive(Debug, Clone, Copy, Default)]
pub struct Binary;

impl<T: Message> Codec<T> for Binary {
    fn encode(value: &T) -> CodecResult<Vec<u8>> {
        Ok(encode(&value.to_value()))
    }

    fn decode(bytes: &[u8]) -> CodecResult<T> {
        T::from_value(decode(bytes)?)
    }
}

/// The textual encoding (JSON with camelCase field names).
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl<T: Serialize + DeserializeOwned> Codec<T> for Json {
    fn encode(value: &T) -> CodecResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(bytes: &[u8]) -> CodecResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Uninterpreted bytes, for values such as the manifest body.
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

impl Codec<Vec<u8>> for Raw {
    fn encode(value: &Vec<u8>) -> CodecResult<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(bytes: &[u8]) -> CodecResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;
    use crate::message::Fields;
    use crate::value::Value;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Ref {
        object_type: String,
        object_id: String,
    }

    impl Message for Ref {
        const NAME: &'static str = "Ref";

        fn to_value(&self) -> Value {
            Value::Array(vec![
                Value::text(&self.object_type),
                Value::text(&self.object_id),
            ])
        }

        fn from_value(value: Value) -> CodecResult<Self> {
            let mut f = Fields::of::<Self>(value)?;
            Ok(Self {
                object_type: f.text()?,
                object_id: f.text()?,
            })
        }
    }

    fn sample() -> Ref {
        Ref {
            object_type: "user".into(),
            object_id: "alice".into(),
        }
    }

    #[test]
    fn json_uses_camel_case() {
        let bytes = <Json as Codec<Ref>>::encode(&sample()).unwrap();
        assert_eq!(bytes, br#"{"objectType":"user","objectId":"alice"}"#);
        let back: Ref = Json::decode(&bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn binary_is_compact_and_stable() {
        let bytes = <Binary as Codec<Ref>>::encode(&sample()).unwrap();
        assert_eq!(bytes, b"\x82\x64user\x65alice");
        let back: Ref = Binary::decode(&bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn codecs_reject_each_other() {
        let json = <Json as Codec<Ref>>::encode(&sample()).unwrap();
        assert!(<Binary as Codec<Ref>>::decode(&json).is_err());

        let binary = <Binary as Codec<Ref>>::encode(&sample()).unwrap();
        assert!(matches!(
            <Json as Codec<Ref>>::decode(&binary),
            Err(CodecError::Json(_))
        ));
    }
}
