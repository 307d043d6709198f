//! Record shapes and bucket names of the layouts before 0.0.3.
//!
//! Generation 1 keys metadata by numeric id, objects by uuid and relations
//! by `objectUuid|relation|subjectUuid`. Generation 2 keys everything by
//! name and introduces the two relation indexes. Both store camelCase JSON.

use crate::error::DirectoryResult;
use chrono::{DateTime, Utc};
use reldir_codec::{Codec, Json};
use reldir_storage::WriteTx;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Object type metadata.
pub const OBJECT_TYPES: &[&str] = &["object_types"];
/// Relation type metadata.
pub const RELATION_TYPES: &[&str] = &["relation_types"];
/// Permission metadata.
pub const PERMISSIONS: &[&str] = &["permissions"];
/// Generation 1 relations, keyed by object and subject uuids.
pub const RELATIONS_V1: &[&str] = &["relations"];

/// An object type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectTypeV1 {
    /// Numeric id, the generation 1 key.
    pub id: u64,
    /// Type name.
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Whether objects of the type act as subjects.
    pub is_subject: bool,
    /// Sort order.
    pub ordinal: i32,
}

/// A relation type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationTypeV1 {
    /// Numeric id, the generation 1 key.
    pub id: u64,
    /// Relation name.
    pub name: String,
    /// Object type the relation is declared on.
    pub object_type: String,
    /// Human-readable name.
    pub display_name: String,
    /// Assignable subjects: `type` or `type#relation`.
    pub subject_types: Vec<String>,
    /// Relations of the same type whose holders also hold this one.
    pub unions: Vec<String>,
    /// Permissions the relation grants.
    pub permissions: Vec<String>,
}

/// A permission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionV1 {
    /// Numeric id, the generation 1 key.
    pub id: u64,
    /// Permission name.
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
}

/// An object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectV1 {
    /// Object uuid, the generation 1 key.
    pub id: String,
    /// Type name.
    #[serde(rename = "type")]
    pub object_type: String,
    /// Identifier within the type.
    pub key: String,
    /// Human-readable name.
    pub display_name: String,
    /// Properties.
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Time of first write.
    pub created_at: Option<DateTime<Utc>>,
    /// Time of last write.
    pub updated_at: Option<DateTime<Utc>>,
    /// Content hash.
    pub hash: String,
}

/// An end of a relation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectRefV1 {
    /// Object uuid; dropped in generation 2.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Type name.
    #[serde(rename = "type")]
    pub object_type: String,
    /// Identifier within the type.
    pub key: String,
}

/// A relation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationV1 {
    /// Object side.
    pub object: ObjectRefV1,
    /// Relation name.
    pub relation: String,
    /// Subject side.
    pub subject: ObjectRefV1,
    /// Time of first write.
    pub created_at: Option<DateTime<Utc>>,
    /// Time of last write.
    pub updated_at: Option<DateTime<Utc>>,
    /// Content hash.
    pub hash: String,
}

/// Generation 1 key of a metadata record.
#[must_use]
pub fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Generation 1 key of a relation.
#[must_use]
pub fn relation_key_v1(object_id: &str, relation: &str, subject_id: &str) -> String {
    format!("{object_id}|{relation}|{subject_id}")
}

/// Generation 2 key of a relation type.
#[must_use]
pub fn relation_type_key(object_type: &str, relation: &str) -> String {
    format!("{object_type}:{relation}")
}

/// The types every directory starts with.
#[must_use]
pub fn seed_object_types() -> Vec<ObjectTypeV1> {
    [("system", false), ("user", true), ("group", true), ("identity", false)]
        .into_iter()
        .zip(1..)
        .map(|((name, is_subject), id)| ObjectTypeV1 {
            id,
            name: name.to_string(),
            display_name: capitalize(name),
            is_subject,
            ordinal: i32::try_from(id).unwrap_or_default(),
        })
        .collect()
}

/// The relations every directory starts with.
#[must_use]
pub fn seed_relation_types() -> Vec<RelationTypeV1> {
    [
        ("group", "member", &["user", "group"][..]),
        ("identity", "identifier", &["user"][..]),
        ("user", "manager", &["user"][..]),
    ]
    .into_iter()
    .zip(1..)
    .map(|((object_type, name, subjects), id)| RelationTypeV1 {
        id,
        name: name.to_string(),
        object_type: object_type.to_string(),
        display_name: format!("{object_type}:{name}"),
        subject_types: subjects.iter().map(ToString::to_string).collect(),
        unions: Vec::new(),
        permissions: Vec::new(),
    })
    .collect()
}

/// Creates an object in generation 1 layout and returns its uuid.
///
/// # Errors
///
/// Storage errors; the `objects` bucket must exist.
pub fn put_object_v1(
    tx: &mut WriteTx<'_>,
    object_type: &str,
    key: &str,
    display_name: &str,
) -> DirectoryResult<String> {
    let id = Uuid::new_v4().to_string();
    let object = ObjectV1 {
        id: id.clone(),
        object_type: object_type.to_string(),
        key: key.to_string(),
        display_name: display_name.to_string(),
        created_at: Some(Utc::now()),
        updated_at: Some(Utc::now()),
        ..ObjectV1::default()
    };
    tx.put(crate::keys::OBJECTS, id.as_bytes(), &Json::encode(&object)?)?;
    Ok(id)
}

/// Creates a relation in generation 1 layout between two objects created
/// by [`put_object_v1`].
///
/// # Errors
///
/// Storage errors; the relations bucket must exist.
pub fn put_relation_v1(
    tx: &mut WriteTx<'_>,
    object: (&str, &str, &str),
    relation: &str,
    subject: (&str, &str, &str),
) -> DirectoryResult<()> {
    let reference = |(id, object_type, key): (&str, &str, &str)| ObjectRefV1 {
        id: id.to_string(),
        object_type: object_type.to_string(),
        key: key.to_string(),
    };
    let record = RelationV1 {
        object: reference(object),
        relation: relation.to_string(),
        subject: reference(subject),
        created_at: Some(Utc::now()),
        updated_at: Some(Utc::now()),
        hash: String::new(),
    };
    let key = relation_key_v1(object.0, relation, subject.0);
    tx.put(RELATIONS_V1, key.as_bytes(), &Json::encode(&record)?)?;
    Ok(())
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}
