//! # reldir codec
//!
//! Value encodings for reldir records.
//!
//! - [`Binary`]: records implementing [`Message`] become canonical CBOR
//!   arrays of their fields. Equal records always produce equal bytes.
//! - [`Json`]: any serde type as JSON, the textual layout used by older
//!   databases.
//! - [`Raw`]: bytes stored as given.
//!
//! [`Fnv64`] provides the stable content hash behind etags.
//!
//! ## Usage
//!
//! ```
//! use reldir_codec::{decode, encode, Value};
//!
//! let value = Value::Array(vec![Value::text("user"), Value::text("alice")]);
//! let bytes = encode(&value);
//! assert_eq!(decode(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod decoder;
mod encoder;
mod error;
mod hash;
mod message;
mod value;

pub use codec::{Binary, Codec, Json, Raw};
pub use decoder::{decode, Decoder};
pub use encoder::{encode, Encoder};
pub use error::{CodecError, CodecResult};
pub use hash::{etag, fnv1a64, Fnv64};
pub use message::{repeated, Fields, Message};
pub use value::Value;
