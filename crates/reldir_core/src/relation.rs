//! Relation storage.
//!
//! The relation record lives in [`RELATIONS`]; the two index buckets only
//! carry keys, with empty values.

use crate::error::{DirectoryError, DirectoryResult};
use crate::keys::{
    self, node_prefix, relation_obj_key, relation_sub_key, Index, RelationFilter, RELATIONS,
    RELATIONS_OBJ, RELATIONS_SUB,
};
use crate::model::{Model, WILDCARD};
use crate::store::{self, Page, PageIterator, PaginationRequest, PaginationResponse, PrefixScan};
use crate::types::{Relation, RelationIdentifier};
use chrono::{DateTime, Utc};
use reldir_codec::Binary;
use reldir_storage::{Tx, WriteTx};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Looks up a relation whose subject relation may be left open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationQuery {
    /// Object type.
    pub object_type: String,
    /// Object id.
    pub object_id: String,
    /// Relation name.
    pub relation: String,
    /// Subject type.
    pub subject_type: String,
    /// Subject id.
    pub subject_id: String,
    /// Exact subject relation, or `None` to accept any.
    pub subject_relation: Option<String>,
}

impl RelationQuery {
    /// Query for the relation with exactly this identity.
    #[must_use]
    pub fn exact(id: &RelationIdentifier) -> Self {
        Self {
            object_type: id.object_type.clone(),
            object_id: id.object_id.clone(),
            relation: id.relation.clone(),
            subject_type: id.subject_type.clone(),
            subject_id: id.subject_id.clone(),
            subject_relation: Some(id.subject_relation.clone()),
        }
    }

    fn identifier(&self, subject_relation: &str) -> RelationIdentifier {
        RelationIdentifier {
            object_type: self.object_type.clone(),
            object_id: self.object_id.clone(),
            relation: self.relation.clone(),
            subject_type: self.subject_type.clone(),
            subject_id: self.subject_id.clone(),
            subject_relation: subject_relation.to_string(),
        }
    }
}

fn check_identity(id: &RelationIdentifier) -> DirectoryResult<()> {
    let checks = [
        keys::check_type("object type", &id.object_type),
        keys::check_field("object id", &id.object_id),
        keys::check_field("relation", &id.relation),
        keys::check_type("subject type", &id.subject_type),
        keys::check_field("subject id", &id.subject_id),
    ];
    for check in checks {
        check.map_err(DirectoryError::InvalidRelation)?;
    }
    if !id.subject_relation.is_empty() {
        keys::check_field("subject relation", &id.subject_relation)
            .map_err(DirectoryError::InvalidRelation)?;
    }
    Ok(())
}

/// Checks a relation against the key layout and the model.
pub(crate) fn validate(model: &Model, id: &RelationIdentifier) -> DirectoryResult<()> {
    check_identity(id)?;
    if !model.object_exists(&id.object_type) {
        return Err(DirectoryError::ObjectTypeNotFound(id.object_type.clone()));
    }
    if !model.relation_exists(&id.object_type, &id.relation) {
        return Err(DirectoryError::RelationNotFound(format!(
            "{}#{}",
            id.object_type, id.relation
        )));
    }
    if !model.object_exists(&id.subject_type) {
        return Err(DirectoryError::ObjectTypeNotFound(id.subject_type.clone()));
    }
    let wildcard = id.subject_id == WILDCARD;
    if wildcard && !id.subject_relation.is_empty() {
        return Err(DirectoryError::InvalidRelation(format!(
            "{id}: a wildcard subject cannot carry a subject relation"
        )));
    }
    let subject_relation = Some(id.subject_relation.as_str()).filter(|s| !s.is_empty());
    if !model.assignment_allowed(
        &id.object_type,
        &id.relation,
        &id.subject_type,
        subject_relation,
        wildcard,
    ) {
        return Err(DirectoryError::InvalidRelation(format!(
            "{id}: subject is not assignable to {}#{}",
            id.object_type, id.relation
        )));
    }
    Ok(())
}

/// Reads the relation with exactly this identity, if stored.
pub(crate) fn load(tx: &impl Tx, id: &RelationIdentifier) -> DirectoryResult<Option<Relation>> {
    store::get::<Binary, Relation>(tx, RELATIONS, relation_obj_key(id).as_bytes())
}

/// Finds the single relation matching `query`.
///
/// # Errors
///
/// `KeyNotFound` when nothing matches, `MultipleResults` when the subject
/// relation was left open and several relations differ only in it.
pub(crate) fn find(tx: &impl Tx, query: &RelationQuery) -> DirectoryResult<Relation> {
    if let Some(subject_relation) = &query.subject_relation {
        let id = query.identifier(subject_relation);
        check_identity(&id)?;
        return load(tx, &id)?.ok_or_else(|| DirectoryError::KeyNotFound(id.to_string()));
    }

    let probe = query.identifier("");
    check_identity(&probe)?;
    let filter = RelationFilter {
        object_type: probe.object_type.clone(),
        object_id: probe.object_id.clone(),
        relation: probe.relation.clone(),
        subject_type: probe.subject_type.clone(),
        subject_id: probe.subject_id.clone(),
        subject_relation: String::new(),
    };
    let mut found = None;
    for (key, _) in PrefixScan::new(tx, RELATIONS_OBJ, filter.prefix(Index::ObjectMajor)) {
        let id = Index::ObjectMajor.parse(key)?;
        if !filter.matches(&id) {
            continue;
        }
        if found.replace(id).is_some() {
            return Err(DirectoryError::MultipleResults(probe.to_string()));
        }
    }
    let id = found.ok_or_else(|| DirectoryError::KeyNotFound(probe.to_string()))?;
    load(tx, &id)?.ok_or_else(|| DirectoryError::KeyNotFound(id.to_string()))
}

/// Lists relations matching `filter`, scanning whichever index serves it.
pub(crate) fn list<'tx, X: Tx>(
    tx: &'tx X,
    filter: &RelationFilter,
    page: &PaginationRequest,
) -> DirectoryResult<Page<Relation>> {
    let index = filter.index();
    let scan = PrefixScan::new(tx, index.path(), filter.prefix(index)).from_token(page.token.as_bytes());
    let filter = filter.clone();
    PageIterator::new(scan, page.page_size(), move |key, _| {
        let id = index.parse(key)?;
        if !filter.matches(&id) {
            return Ok(None);
        }
        resolve(tx, &id).map(Some)
    })
    .page()
}

/// Relations in which the object takes part on either side, ordered by
/// object-major key. The page token is an object-major key.
pub(crate) fn of_object(
    tx: &impl Tx,
    object_type: &str,
    object_id: &str,
    page: &PaginationRequest,
) -> DirectoryResult<Page<Relation>> {
    let prefix = node_prefix(object_type, object_id);
    let mut keys = BTreeSet::new();
    for (key, _) in PrefixScan::new(tx, RELATIONS_OBJ, prefix.as_str()) {
        keys.insert(Index::ObjectMajor.parse(key)?);
    }
    for (key, _) in PrefixScan::new(tx, RELATIONS_SUB, prefix.as_str()) {
        keys.insert(Index::SubjectMajor.parse(key)?);
    }

    let mut ordered: Vec<(String, RelationIdentifier)> = keys
        .into_iter()
        .map(|id| (relation_obj_key(&id), id))
        .collect();
    ordered.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let size = page.page_size();
    let mut rest = ordered
        .into_iter()
        .skip_while(|(key, _)| key.as_str() < page.token.as_str());
    let mut results = Vec::new();
    for (_, id) in rest.by_ref().take(size) {
        results.push(resolve(tx, &id)?);
    }
    let next_token = rest.next().map(|(key, _)| key).unwrap_or_default();
    Ok(Page {
        page: PaginationResponse {
            next_token,
            result_size: u32::try_from(results.len()).unwrap_or(u32::MAX),
        },
        results,
    })
}

fn resolve(tx: &impl Tx, id: &RelationIdentifier) -> DirectoryResult<Relation> {
    load(tx, id)?.ok_or_else(|| {
        DirectoryError::KeyNotFound(format!("index entry {id} has no relation record"))
    })
}

/// Stores a relation under its record key and both index keys.
///
/// Same etag rules as objects: a non-empty incoming etag must match the
/// stored one, and rewriting an existing relation is a no-op.
pub(crate) fn set(
    tx: &mut WriteTx<'_>,
    model: &Model,
    mut relation: Relation,
    now: DateTime<Utc>,
) -> DirectoryResult<Relation> {
    let id = relation.identifier();
    validate(model, &id)?;
    let tag = relation.content_etag();

    match load(tx, &id)? {
        Some(stored) => {
            if !relation.etag.is_empty() && relation.etag != stored.etag {
                return Err(DirectoryError::HashMismatch {
                    key: id.to_string(),
                    etag: relation.etag,
                });
            }
            if stored.etag == tag {
                return Ok(stored);
            }
            relation.created_at = stored.created_at.or(Some(now));
        }
        None => relation.created_at = Some(now),
    }
    relation.updated_at = Some(now);
    relation.etag = tag;

    let obj_key = relation_obj_key(&id);
    for path in [RELATIONS, RELATIONS_OBJ, RELATIONS_SUB] {
        tx.create_bucket_if_not_exists(path)?;
    }
    store::put::<Binary, _>(tx, RELATIONS, obj_key.as_bytes(), &relation)?;
    tx.put(RELATIONS_OBJ, obj_key.as_bytes(), b"")?;
    tx.put(RELATIONS_SUB, relation_sub_key(&id).as_bytes(), b"")?;
    debug!(relation = %id, "relation stored");
    Ok(relation)
}

/// Deletes the relation with exactly this identity; absent relations are
/// ignored.
pub(crate) fn delete(tx: &mut WriteTx<'_>, id: &RelationIdentifier) -> DirectoryResult<()> {
    check_identity(id)?;
    remove(tx, id)?;
    debug!(relation = %id, "relation deleted");
    Ok(())
}

/// Removes all three keys of a relation.
pub(crate) fn remove(tx: &mut WriteTx<'_>, id: &RelationIdentifier) -> DirectoryResult<()> {
    let obj_key = relation_obj_key(id);
    let sub_key = relation_sub_key(id);
    for (path, key) in [
        (RELATIONS, &obj_key),
        (RELATIONS_OBJ, &obj_key),
        (RELATIONS_SUB, &sub_key),
    ] {
        if tx.bucket_exists(path) {
            tx.delete(path, key.as_bytes())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::folders;
    use crate::model::{ModelLoader, YamlModelLoader};
    use reldir_storage::Db;

    fn viewer(subject: (&str, &str), srel: &str) -> Relation {
        Relation::new(("folder", "root"), "viewer", subject, srel)
    }

    fn seeded(relations: &[Relation]) -> Db {
        let db = Db::open_in_memory().unwrap();
        let model = folders();
        db.update(|tx| {
            for rel in relations {
                set(tx, &model, rel.clone(), Utc::now())?;
            }
            Ok::<_, DirectoryError>(())
        })
        .unwrap();
        db
    }

    fn query(subject: (&str, &str), srel: Option<&str>) -> RelationQuery {
        RelationQuery {
            object_type: "folder".into(),
            object_id: "root".into(),
            relation: "viewer".into(),
            subject_type: subject.0.into(),
            subject_id: subject.1.into(),
            subject_relation: srel.map(str::to_string),
        }
    }

    #[test]
    fn both_indexes_and_record_written() {
        let db = seeded(&[viewer(("user", "alice"), "")]);
        let tx = db.begin_read();
        assert_eq!(tx.get(RELATIONS_OBJ, b"folder:root|viewer|user:alice").unwrap(), "");
        assert_eq!(tx.get(RELATIONS_SUB, b"user:alice|viewer|folder:root").unwrap(), "");

        let stored = find(&tx, &query(("user", "alice"), None)).unwrap();
        assert_eq!(stored.identifier(), viewer(("user", "alice"), "").identifier());
        assert!(stored.created_at.is_some());
        assert!(!stored.etag.is_empty());

        let by_subject = list(
            &tx,
            &RelationFilter {
                subject_type: "user".into(),
                subject_id: "alice".into(),
                ..Default::default()
            },
            &PaginationRequest::default(),
        )
        .unwrap();
        assert_eq!(by_subject.results, vec![stored]);
    }

    #[test]
    fn validation_against_model() {
        let model = folders();
        let check = |rel: Relation| validate(&model, &rel.identifier());
        assert!(check(viewer(("user", "alice"), "")).is_ok());
        assert!(check(viewer(("group", "g"), "member")).is_ok());
        assert!(check(viewer(("user", "*"), "")).is_ok());
        assert!(matches!(
            check(viewer(("group", "g"), "")),
            Err(DirectoryError::InvalidRelation(_))
        ));
        assert!(matches!(
            check(viewer(("group", "*"), "member")),
            Err(DirectoryError::InvalidRelation(_))
        ));
        assert!(matches!(
            check(Relation::new(("folder", "root"), "reader", ("user", "a"), "")),
            Err(DirectoryError::RelationNotFound(_))
        ));
        assert!(matches!(
            check(Relation::new(("robot", "r"), "viewer", ("user", "a"), "")),
            Err(DirectoryError::ObjectTypeNotFound(_))
        ));
        assert!(matches!(
            check(viewer(("user", ""), "")),
            Err(DirectoryError::InvalidRelation(_))
        ));
    }

    #[test]
    fn find_with_open_subject_relation() {
        let db = seeded(&[
            viewer(("group", "g"), "member"),
            Relation::new(("group", "g"), "member", ("group", "h"), "member"),
        ]);
        let tx = db.begin_read();
        assert_eq!(
            find(&tx, &query(("group", "g"), None)).unwrap().subject_relation,
            "member"
        );
        assert!(find(&tx, &query(("group", "g"), Some(""))).unwrap_err().is_not_found());
        assert!(find(&tx, &query(("group", "gg"), None)).unwrap_err().is_not_found());
    }

    #[test]
    fn ambiguous_find_is_reported() {
        let db = Db::open_in_memory().unwrap();
        let model = YamlModelLoader
            .load(
                b"
model:
  version: 3
types:
  user: {}
  group:
    relations:
      member: user | group#member | group#admin
      admin: user
  doc:
    relations:
      viewer: group#member | group#admin
",
            )
            .unwrap();
        db.update(|tx| {
            for srel in ["member", "admin"] {
                set(tx, &model, Relation::new(("doc", "d"), "viewer", ("group", "g"), srel), Utc::now())?;
            }
            Ok::<_, DirectoryError>(())
        })
        .unwrap();
        let q = RelationQuery {
            object_type: "doc".into(),
            object_id: "d".into(),
            relation: "viewer".into(),
            subject_type: "group".into(),
            subject_id: "g".into(),
            subject_relation: None,
        };
        assert!(matches!(
            find(&db.begin_read(), &q),
            Err(DirectoryError::MultipleResults(_))
        ));
    }

    #[test]
    fn delete_matches_subject_relation_exactly() {
        let db = seeded(&[viewer(("group", "g"), "member")]);
        db.update(|tx| delete(tx, &viewer(("group", "g"), "").identifier()))
            .unwrap();
        assert!(find(&db.begin_read(), &query(("group", "g"), None)).is_ok());

        db.update(|tx| delete(tx, &viewer(("group", "g"), "member").identifier()))
            .unwrap();
        db.update(|tx| delete(tx, &viewer(("group", "g"), "member").identifier()))
            .unwrap();
        let tx = db.begin_read();
        for path in [RELATIONS, RELATIONS_OBJ, RELATIONS_SUB] {
            assert_eq!(PrefixScan::new(&tx, path, "").count(), 0);
        }
    }

    #[test]
    fn stale_etag_is_rejected() {
        let db = seeded(&[viewer(("user", "alice"), "")]);
        let model = folders();
        let err = db
            .update(|tx| set(tx, &model, viewer(("user", "alice"), "").clone_with_etag("1"), Utc::now()))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::HashMismatch { .. }));
    }

    #[test]
    fn relations_of_object_cover_both_sides() {
        let db = seeded(&[
            Relation::new(("group", "g"), "member", ("user", "alice"), ""),
            Relation::new(("folder", "root"), "viewer", ("group", "g"), "member"),
            Relation::new(("group", "g"), "owner", ("user", "bob"), ""),
        ]);
        let tx = db.begin_read();
        let first = of_object(&tx, "group", "g", &PaginationRequest::size(2)).unwrap();
        assert_eq!(first.results.len(), 2);
        assert_eq!(first.results[0].object_type, "folder");
        assert!(!first.page.next_token.is_empty());

        let second = of_object(
            &tx,
            "group",
            "g",
            &PaginationRequest::next(2, first.page.next_token),
        )
        .unwrap();
        assert_eq!(second.results.len(), 1);
        assert_eq!(second.page.next_token, "");
    }

    impl Relation {
        fn clone_with_etag(mut self, etag: &str) -> Self {
            self.etag = etag.to_string();
            self
        }
    }
}
