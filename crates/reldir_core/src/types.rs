//! Directory records: objects, relations and the manifest.
//!
//! Every stored record has two encodings: the positional binary form of
//! [`Message`] used by current databases, and camelCase JSON used by the
//! databases written before the binary layout existed.

use chrono::{DateTime, Utc};
use reldir_codec::{etag, CodecError, CodecResult, Fields, Fnv64, Message, Value};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Free-form object properties.
pub type Properties = Map<String, JsonValue>;

/// A typed, identified entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Object {
    /// Object type, declared in the model.
    #[serde(rename = "type")]
    pub object_type: String,
    /// Identifier, unique within the type.
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Arbitrary nested properties.
    pub properties: Properties,
    /// Time of first write.
    pub created_at: Option<DateTime<Utc>>,
    /// Time of the last write that changed content.
    pub updated_at: Option<DateTime<Utc>>,
    /// Content hash.
    pub etag: String,
}

impl Object {
    /// Creates an object with no properties.
    pub fn new(object_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            id: id.into(),
            ..Self::default()
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Sets the etag the write is conditional on.
    #[must_use]
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = etag.into();
        self
    }

    /// Adds one property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Returns the identity of the object.
    #[must_use]
    pub fn identifier(&self) -> ObjectIdentifier {
        ObjectIdentifier::new(&self.object_type, &self.id)
    }

    /// Content hash over identity, display name and properties.
    ///
    /// Timestamps and the etag itself do not contribute.
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        let mut hasher = Fnv64::new();
        hasher.field(self.object_type.as_bytes());
        hasher.field(self.id.as_bytes());
        hasher.field(self.display_name.as_bytes());
        hasher.field(&canonical_json(&self.properties));
        hasher.digest()
    }

    /// The etag this object's content hashes to.
    #[must_use]
    pub fn content_etag(&self) -> String {
        etag(self.content_hash())
    }
}

impl Message for Object {
    const NAME: &'static str = "Object";

    fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::text(&self.object_type),
            Value::text(&self.id),
            Value::text(&self.display_name),
            properties_value(&self.properties),
            timestamp_value(self.created_at),
            timestamp_value(self.updated_at),
            Value::text(&self.etag),
        ])
    }

    fn from_value(value: Value) -> CodecResult<Self> {
        let mut f = Fields::of::<Self>(value)?;
        Ok(Self {
            object_type: f.text()?,
            id: f.text()?,
            display_name: f.text()?,
            properties: properties_from(f.bytes()?)?,
            created_at: f.optional(timestamp_from)?,
            updated_at: f.optional(timestamp_from)?,
            etag: f.text()?,
        })
    }
}

/// A directed edge from an object to a subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Relation {
    /// Type of the object side.
    pub object_type: String,
    /// Id of the object side.
    pub object_id: String,
    /// Relation name, declared on the object type.
    pub relation: String,
    /// Type of the subject side.
    pub subject_type: String,
    /// Id of the subject side; `*` stands for every subject of the type.
    pub subject_id: String,
    /// Relation of the subject when the subject is a user-set; empty otherwise.
    pub subject_relation: String,
    /// Time of first write.
    pub created_at: Option<DateTime<Utc>>,
    /// Time of the last write that changed content.
    pub updated_at: Option<DateTime<Utc>>,
    /// Content hash.
    pub etag: String,
}

impl Relation {
    /// Creates a relation from its identity.
    pub fn new(
        object: (&str, &str),
        relation: &str,
        subject: (&str, &str),
        subject_relation: &str,
    ) -> Self {
        Self {
            object_type: object.0.to_string(),
            object_id: object.1.to_string(),
            relation: relation.to_string(),
            subject_type: subject.0.to_string(),
            subject_id: subject.1.to_string(),
            subject_relation: subject_relation.to_string(),
            ..Self::default()
        }
    }

    /// Returns the identity of the relation.
    #[must_use]
    pub fn identifier(&self) -> RelationIdentifier {
        RelationIdentifier {
            object_type: self.object_type.clone(),
            object_id: self.object_id.clone(),
            relation: self.relation.clone(),
            subject_type: self.subject_type.clone(),
            subject_id: self.subject_id.clone(),
            subject_relation: self.subject_relation.clone(),
        }
    }

    /// Content hash over the six identity fields.
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        let mut hasher = Fnv64::new();
        for field in [
            &self.object_type,
            &self.object_id,
            &self.relation,
            &self.subject_type,
            &self.subject_id,
            &self.subject_relation,
        ] {
            hasher.field(field.as_bytes());
        }
        hasher.digest()
    }

    /// The etag this relation's content hashes to.
    #[must_use]
    pub fn content_etag(&self) -> String {
        etag(self.content_hash())
    }
}

impl Message for Relation {
    const NAME: &'static str = "Relation";

    fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::text(&self.object_type),
            Value::text(&self.object_id),
            Value::text(&self.relation),
            Value::text(&self.subject_type),
            Value::text(&self.subject_id),
            Value::text(&self.subject_relation),
            timestamp_value(self.created_at),
            timestamp_value(self.updated_at),
            Value::text(&self.etag),
        ])
    }

    fn from_value(value: Value) -> CodecResult<Self> {
        let mut f = Fields::of::<Self>(value)?;
        Ok(Self {
            object_type: f.text()?,
            object_id: f.text()?,
            relation: f.text()?,
            subject_type: f.text()?,
            subject_id: f.text()?,
            subject_relation: f.text()?,
            created_at: f.optional(timestamp_from)?,
            updated_at: f.optional(timestamp_from)?,
            etag: f.text()?,
        })
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.identifier(), f)
    }
}

/// Identity of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectIdentifier {
    /// Object type.
    pub object_type: String,
    /// Object id.
    pub object_id: String,
}

impl ObjectIdentifier {
    /// Creates an identifier.
    pub fn new(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
        }
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

/// Identity of a relation: its six key fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationIdentifier {
    /// Type of the object side.
    pub object_type: String,
    /// Id of the object side.
    pub object_id: String,
    /// Relation name.
    pub relation: String,
    /// Type of the subject side.
    pub subject_type: String,
    /// Id of the subject side.
    pub subject_id: String,
    /// Subject relation, empty when absent.
    pub subject_relation: String,
}

impl RelationIdentifier {
    /// The object side.
    #[must_use]
    pub fn object(&self) -> ObjectIdentifier {
        ObjectIdentifier::new(&self.object_type, &self.object_id)
    }

    /// The subject side, without its subject relation.
    #[must_use]
    pub fn subject(&self) -> ObjectIdentifier {
        ObjectIdentifier::new(&self.subject_type, &self.subject_id)
    }
}

impl fmt::Display for RelationIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}#{}@{}:{}",
            self.object_type, self.object_id, self.relation, self.subject_type, self.subject_id
        )?;
        if !self.subject_relation.is_empty() {
            write!(f, "#{}", self.subject_relation)?;
        }
        Ok(())
    }
}

/// Manifest bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestMetadata {
    /// Time of the last update.
    pub updated_at: Option<DateTime<Utc>>,
    /// Hash of the body.
    pub etag: String,
}

impl Message for ManifestMetadata {
    const NAME: &'static str = "ManifestMetadata";

    fn to_value(&self) -> Value {
        Value::Array(vec![timestamp_value(self.updated_at), Value::text(&self.etag)])
    }

    fn from_value(value: Value) -> CodecResult<Self> {
        let mut f = Fields::of::<Self>(value)?;
        Ok(Self {
            updated_at: f.optional(timestamp_from)?,
            etag: f.text()?,
        })
    }
}

/// Stored wrapper of the manifest document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestBody {
    /// The document as supplied by the caller.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Message for ManifestBody {
    const NAME: &'static str = "ManifestBody";

    fn to_value(&self) -> Value {
        Value::Array(vec![Value::Bytes(self.data.clone())])
    }

    fn from_value(value: Value) -> CodecResult<Self> {
        let mut f = Fields::of::<Self>(value)?;
        Ok(Self { data: f.bytes()? })
    }
}

/// The manifest document together with its metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// The document.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
    /// Its metadata.
    pub metadata: ManifestMetadata,
}

fn timestamp_value(ts: Option<DateTime<Utc>>) -> Value {
    Value::optional(ts, |ts| {
        Value::Array(vec![
            Value::Integer(ts.timestamp()),
            Value::Integer(i64::from(ts.timestamp_subsec_nanos())),
        ])
    })
}

fn timestamp_from(value: Value) -> CodecResult<DateTime<Utc>> {
    let pair = value.as_array().unwrap_or_default();
    match pair {
        [Value::Integer(secs), Value::Integer(nanos)] => u32::try_from(*nanos)
            .ok()
            .and_then(|nanos| DateTime::<Utc>::from_timestamp(*secs, nanos))
            .ok_or_else(|| CodecError::decoding_failed("timestamp out of range")),
        _ => Err(CodecError::decoding_failed(format!(
            "timestamp must be [seconds, nanos], found {}",
            value.type_name()
        ))),
    }
}

fn properties_value(properties: &Properties) -> Value {
    if properties.is_empty() {
        Value::Null
    } else {
        Value::Bytes(canonical_json(properties))
    }
}

fn properties_from(bytes: Vec<u8>) -> CodecResult<Properties> {
    if bytes.is_empty() {
        return Ok(Properties::new());
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// JSON with object keys in sorted order at every level.
pub(crate) fn canonical_json(properties: &Properties) -> Vec<u8> {
    // Maps are ordered by key, so serialization is already canonical.
    serde_json::to_vec(properties).unwrap_or_default()
}

/// Serde adapter for byte fields carried as base64 strings in JSON.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
