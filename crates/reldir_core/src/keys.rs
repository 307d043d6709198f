//! Bucket paths and key layout.
//!
//! Objects are keyed `{type}:{id}`. Each relation is stored under two
//! composite keys, one per index, so that both ends can be scanned by
//! prefix:
//!
//! ```text
//! relations_obj  {object_type}:{object_id}|{relation}|{subject_type}:{subject_id}[|{subject_relation}]
//! relations_sub  {subject_type}:{subject_id}[|{subject_relation}]|{relation}|{object_type}:{object_id}
//! ```
//!
//! The canonical relation record lives in `relations` under its
//! object-major key.

use crate::error::{DirectoryError, DirectoryResult};
use crate::types::{ObjectIdentifier, RelationIdentifier};
use serde::{Deserialize, Serialize};

/// Version stamp and other singletons.
pub const SYSTEM: &[&str] = &["_system"];
/// Manifest body, metadata and compiled model.
pub const MANIFEST: &[&str] = &["_manifest"];
/// Objects by `type:id`.
pub const OBJECTS: &[&str] = &["objects"];
/// Object-major relation index.
pub const RELATIONS_OBJ: &[&str] = &["relations_obj"];
/// Subject-major relation index.
pub const RELATIONS_SUB: &[&str] = &["relations_sub"];
/// Canonical relation records by object-major key.
pub const RELATIONS: &[&str] = &["relations"];

/// Key of the schema version stamp in [`SYSTEM`].
pub const VERSION_KEY: &[u8] = b"version";
/// Key of the manifest document in [`MANIFEST`].
pub const BODY_KEY: &[u8] = b"body";
/// Key of the manifest metadata in [`MANIFEST`].
pub const METADATA_KEY: &[u8] = b"metadata";
/// Key of the compiled model in [`MANIFEST`].
pub const MODEL_KEY: &[u8] = b"model";

/// Separates a type from its id.
pub const TYPE_SEP: char = ':';
/// Separates the fields of a relation key.
pub const FIELD_SEP: char = '|';

/// Builds `{type}:{id}`.
#[must_use]
pub fn object_key(object_type: &str, object_id: &str) -> String {
    format!("{object_type}{TYPE_SEP}{object_id}")
}

/// Builds the object-major key of a relation.
#[must_use]
pub fn relation_obj_key(rel: &RelationIdentifier) -> String {
    let mut key = format!(
        "{}{FIELD_SEP}{}{FIELD_SEP}{}",
        object_key(&rel.object_type, &rel.object_id),
        rel.relation,
        object_key(&rel.subject_type, &rel.subject_id),
    );
    if !rel.subject_relation.is_empty() {
        key.push(FIELD_SEP);
        key.push_str(&rel.subject_relation);
    }
    key
}

/// Builds the subject-major key of a relation.
#[must_use]
pub fn relation_sub_key(rel: &RelationIdentifier) -> String {
    let mut key = object_key(&rel.subject_type, &rel.subject_id);
    if !rel.subject_relation.is_empty() {
        key.push(FIELD_SEP);
        key.push_str(&rel.subject_relation);
    }
    key.push(FIELD_SEP);
    key.push_str(&rel.relation);
    key.push(FIELD_SEP);
    key.push_str(&object_key(&rel.object_type, &rel.object_id));
    key
}

/// Prefix of every index key that starts with the given object, in either
/// index: `{type}:{id}|`.
#[must_use]
pub fn node_prefix(object_type: &str, object_id: &str) -> String {
    let mut prefix = object_key(object_type, object_id);
    prefix.push(FIELD_SEP);
    prefix
}

/// Parses `{type}:{id}`.
///
/// # Errors
///
/// `KeyFormat` if the separator is missing or either part is empty.
pub fn parse_object_key(key: &str) -> DirectoryResult<ObjectIdentifier> {
    match key.split_once(TYPE_SEP) {
        Some((object_type, object_id)) if !object_type.is_empty() && !object_id.is_empty() => {
            Ok(ObjectIdentifier::new(object_type, object_id))
        }
        _ => Err(DirectoryError::key_format(format!(
            "object key {key:?} is not type:id"
        ))),
    }
}

/// Parses an object-major relation key.
///
/// # Errors
///
/// `KeyFormat` unless the key has five or six fields.
pub fn parse_relation_obj_key(key: &str) -> DirectoryResult<RelationIdentifier> {
    let parts: Vec<&str> = key.split(FIELD_SEP).collect();
    let (object, relation, subject, subject_relation) = match parts[..] {
        [object, relation, subject] => (object, relation, subject, ""),
        [object, relation, subject, srel] if !srel.is_empty() => (object, relation, subject, srel),
        _ => return Err(field_count(key)),
    };
    assemble(key, object, relation, subject, subject_relation)
}

/// Parses a subject-major relation key.
///
/// # Errors
///
/// `KeyFormat` unless the key has five or six fields.
pub fn parse_relation_sub_key(key: &str) -> DirectoryResult<RelationIdentifier> {
    let parts: Vec<&str> = key.split(FIELD_SEP).collect();
    let (subject, subject_relation, relation, object) = match parts[..] {
        [subject, relation, object] => (subject, "", relation, object),
        [subject, srel, relation, object] if !srel.is_empty() => (subject, srel, relation, object),
        _ => return Err(field_count(key)),
    };
    assemble(key, object, relation, subject, subject_relation)
}

/// Parses raw key bytes with `parse`.
pub(crate) fn parse_bytes<T>(
    key: &[u8],
    parse: fn(&str) -> DirectoryResult<T>,
) -> DirectoryResult<T> {
    let text = std::str::from_utf8(key)
        .map_err(|_| DirectoryError::key_format(format!("key {key:?} is not UTF-8")))?;
    parse(text)
}

fn assemble(
    key: &str,
    object: &str,
    relation: &str,
    subject: &str,
    subject_relation: &str,
) -> DirectoryResult<RelationIdentifier> {
    if relation.is_empty() {
        return Err(DirectoryError::key_format(format!(
            "relation key {key:?} has an empty relation"
        )));
    }
    let object = parse_object_key(object)?;
    let subject = parse_object_key(subject)?;
    Ok(RelationIdentifier {
        object_type: object.object_type,
        object_id: object.object_id,
        relation: relation.to_string(),
        subject_type: subject.object_type,
        subject_id: subject.object_id,
        subject_relation: subject_relation.to_string(),
    })
}

fn field_count(key: &str) -> DirectoryError {
    DirectoryError::key_format(format!(
        "relation key {key:?} must have 5 or 6 fields"
    ))
}

/// Checks that a key field is non-empty and free of the field separator.
pub(crate) fn check_field(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        Err(format!("{kind} is required"))
    } else if value.contains(FIELD_SEP) {
        Err(format!("{kind} {value:?} must not contain {FIELD_SEP:?}"))
    } else {
        Ok(())
    }
}

/// Checks that a type name is usable in keys: non-empty and free of both
/// separators.
pub(crate) fn check_type(kind: &str, value: &str) -> Result<(), String> {
    check_field(kind, value)?;
    if value.contains(TYPE_SEP) {
        return Err(format!("{kind} {value:?} must not contain {TYPE_SEP:?}"));
    }
    Ok(())
}

/// Selects relations by any combination of their identity fields. Empty
/// fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationFilter {
    /// Object type.
    pub object_type: String,
    /// Object id; only meaningful with `object_type`.
    pub object_id: String,
    /// Relation name.
    pub relation: String,
    /// Subject type.
    pub subject_type: String,
    /// Subject id; only meaningful with `subject_type`.
    pub subject_id: String,
    /// Subject relation.
    pub subject_relation: String,
}

/// Which index a filter scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    /// [`RELATIONS_OBJ`].
    ObjectMajor,
    /// [`RELATIONS_SUB`].
    SubjectMajor,
}

impl Index {
    /// Bucket path of the index.
    #[must_use]
    pub fn path(self) -> &'static [&'static str] {
        match self {
            Self::ObjectMajor => RELATIONS_OBJ,
            Self::SubjectMajor => RELATIONS_SUB,
        }
    }

    /// Parses a key of this index.
    ///
    /// # Errors
    ///
    /// `KeyFormat` for a malformed key.
    pub fn parse(self, key: &[u8]) -> DirectoryResult<RelationIdentifier> {
        match self {
            Self::ObjectMajor => parse_bytes(key, parse_relation_obj_key),
            Self::SubjectMajor => parse_bytes(key, parse_relation_sub_key),
        }
    }
}

impl RelationFilter {
    /// Chooses the index whose key order serves the filter best: the
    /// subject-major one when only the subject side is pinned.
    #[must_use]
    pub fn index(&self) -> Index {
        if self.object_type.is_empty() && !self.subject_type.is_empty() {
            Index::SubjectMajor
        } else {
            Index::ObjectMajor
        }
    }

    /// Longest key prefix of `index` that every matching relation shares.
    ///
    /// The prefix may end inside a field, so results still go through
    /// [`RelationFilter::matches`].
    #[must_use]
    pub fn prefix(&self, index: Index) -> String {
        let (head_type, head_id, tail) = match index {
            Index::ObjectMajor => (&self.object_type, &self.object_id, &self.relation),
            Index::SubjectMajor => (&self.subject_type, &self.subject_id, &self.subject_relation),
        };
        let mut prefix = String::new();
        if head_type.is_empty() {
            return prefix;
        }
        prefix.push_str(head_type);
        prefix.push(TYPE_SEP);
        if head_id.is_empty() {
            return prefix;
        }
        prefix.push_str(head_id);
        if tail.is_empty() {
            return prefix;
        }
        prefix.push(FIELD_SEP);
        prefix.push_str(tail);
        prefix.push(FIELD_SEP);
        if index == Index::ObjectMajor && !self.subject_type.is_empty() {
            prefix.push_str(&self.subject_type);
            prefix.push(TYPE_SEP);
            prefix.push_str(&self.subject_id);
        }
        prefix
    }

    /// Whether `rel` satisfies every non-empty field.
    #[must_use]
    pub fn matches(&self, rel: &RelationIdentifier) -> bool {
        fn field(want: &str, have: &str) -> bool {
            want.is_empty() || want == have
        }
        field(&self.object_type, &rel.object_type)
            && field(&self.object_id, &rel.object_id)
            && field(&self.relation, &rel.relation)
            && field(&self.subject_type, &rel.subject_type)
            && field(&self.subject_id, &rel.subject_id)
            && field(&self.subject_relation, &rel.subject_relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rel(srel: &str) -> RelationIdentifier {
        RelationIdentifier {
            object_type: "folder".into(),
            object_id: "root".into(),
            relation: "viewer".into(),
            subject_type: "group".into(),
            subject_id: "eng".into(),
            subject_relation: srel.into(),
        }
    }

    #[test]
    fn key_layouts() {
        assert_eq!(object_key("user", "alice"), "user:alice");
        assert_eq!(relation_obj_key(&rel("")), "folder:root|viewer|group:eng");
        assert_eq!(
            relation_obj_key(&rel("member")),
            "folder:root|viewer|group:eng|member"
        );
        assert_eq!(relation_sub_key(&rel("")), "group:eng|viewer|folder:root");
        assert_eq!(
            relation_sub_key(&rel("member")),
            "group:eng|member|viewer|folder:root"
        );
    }

    #[test]
    fn ids_may_contain_type_separator() {
        let parsed = parse_object_key("user:urn:alice").unwrap();
        assert_eq!(parsed.object_type, "user");
        assert_eq!(parsed.object_id, "urn:alice");
    }

    #[test]
    fn malformed_keys() {
        assert!(parse_object_key("alice").is_err());
        assert!(parse_object_key(":alice").is_err());
        assert!(parse_object_key("user:").is_err());
        assert!(parse_relation_obj_key("folder:root|viewer").is_err());
        assert!(parse_relation_obj_key("a:1|r|b:2|s|extra").is_err());
        assert!(parse_relation_obj_key("a:1|r|b:2|").is_err());
        assert!(parse_relation_obj_key("a:1||b:2").is_err());
        assert!(parse_relation_sub_key("b:2|r").is_err());
    }

    #[test]
    fn filter_picks_index_and_prefix() {
        let by_object = RelationFilter {
            object_type: "folder".into(),
            object_id: "root".into(),
            relation: "viewer".into(),
            ..Default::default()
        };
        assert_eq!(by_object.index(), Index::ObjectMajor);
        assert_eq!(by_object.prefix(Index::ObjectMajor), "folder:root|viewer|");

        let by_subject = RelationFilter {
            subject_type: "user".into(),
            subject_id: "alice".into(),
            ..Default::default()
        };
        assert_eq!(by_subject.index(), Index::SubjectMajor);
        assert_eq!(by_subject.prefix(Index::SubjectMajor), "user:alice");

        let by_type = RelationFilter {
            object_type: "folder".into(),
            ..Default::default()
        };
        assert_eq!(by_type.prefix(Index::ObjectMajor), "folder:");
        assert_eq!(RelationFilter::default().prefix(Index::ObjectMajor), "");
    }

    #[test]
    fn prefix_inside_a_field_is_post_filtered() {
        let filter = RelationFilter {
            object_type: "folder".into(),
            object_id: "root".into(),
            relation: "viewer".into(),
            subject_type: "user".into(),
            subject_id: "al".into(),
            ..Default::default()
        };
        let key = "folder:root|viewer|user:alice";
        assert!(key.starts_with(&filter.prefix(Index::ObjectMajor)));
        assert!(!filter.matches(&parse_relation_obj_key(key).unwrap()));
    }

    #[test]
    fn field_checks() {
        assert!(check_field("relation", "viewer").is_ok());
        assert!(check_field("relation", "").is_err());
        assert!(check_field("object id", "a|b").is_err());
        assert!(check_field("object id", "urn:a").is_ok());
        assert!(check_type("object type", "a:b").is_err());
    }

    fn ident() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,8}"
    }

    fn id() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9@.:*-]{1,12}"
    }

    proptest! {
        #[test]
        fn relation_keys_parse_back(
            object_type in ident(),
            object_id in id(),
            relation in ident(),
            subject_type in ident(),
            subject_id in id(),
            subject_relation in prop_oneof![Just(String::new()), ident()],
        ) {
            let rel = RelationIdentifier {
                object_type,
                object_id,
                relation,
                subject_type,
                subject_id,
                subject_relation,
            };
            prop_assert_eq!(parse_relation_obj_key(&relation_obj_key(&rel)).unwrap(), rel.clone());
            prop_assert_eq!(parse_relation_sub_key(&relation_sub_key(&rel)).unwrap(), rel.clone());

            let filter = RelationFilter {
                object_type: rel.object_type.clone(),
                object_id: rel.object_id.clone(),
                ..Default::default()
            };
            prop_assert!(relation_obj_key(&rel).starts_with(&filter.prefix(Index::ObjectMajor)));
            prop_assert!(filter.matches(&rel));
        }
    }
}
