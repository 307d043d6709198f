//! Subject expansion.

use crate::error::{DirectoryError, DirectoryResult};
use crate::keys::{object_key, Index, FIELD_SEP, RELATIONS_SUB};
use crate::model::{Model, WILDCARD};
use crate::store::PrefixScan;
use crate::types::RelationIdentifier;
use reldir_storage::Tx;
use std::collections::{BTreeSet, VecDeque};
use tokio_util::sync::CancellationToken;

/// A subject together with every `type:id#relation` it belongs to.
#[derive(Debug, Default)]
pub(crate) struct UserSet {
    /// Members keyed `type:id|relation`; the relation is empty for plain
    /// subjects.
    members: BTreeSet<String>,
}

impl UserSet {
    /// Expands `subject_type:subject_id` breadth first over the
    /// subject-major index.
    ///
    /// An edge `obj#rel@member` confers on every holder of `member` each
    /// user-set relation of the object type that `rel` implies. The
    /// wildcard of the subject type is a member from the start.
    pub(crate) fn expand(
        tx: &impl Tx,
        model: &Model,
        cancel: &CancellationToken,
        subject_type: &str,
        subject_id: &str,
    ) -> DirectoryResult<Self> {
        let mut set = Self::default();
        let mut queue = VecDeque::new();
        for id in [subject_id, WILDCARD] {
            if set.insert(subject_type, id, "") {
                queue.push_back((subject_type.to_string(), id.to_string(), String::new()));
            }
        }

        while let Some((member_type, member_id, member_relation)) = queue.pop_front() {
            if cancel.is_cancelled() {
                return Err(DirectoryError::Cancelled);
            }
            let mut prefix = object_key(&member_type, &member_id);
            if !member_relation.is_empty() {
                prefix.push(FIELD_SEP);
                prefix.push_str(&member_relation);
            }
            prefix.push(FIELD_SEP);

            for (key, _) in PrefixScan::new(tx, RELATIONS_SUB, prefix) {
                let edge = Index::SubjectMajor.parse(key)?;
                // A plain prefix also covers keys with a subject relation.
                if edge.subject_relation != member_relation {
                    continue;
                }
                for conferred in model.userset_edges(&edge.object_type, &edge.relation) {
                    if set.insert(&edge.object_type, &edge.object_id, conferred) {
                        queue.push_back((
                            edge.object_type.clone(),
                            edge.object_id.clone(),
                            conferred.to_string(),
                        ));
                    }
                }
            }
        }
        Ok(set)
    }

    fn insert(&mut self, object_type: &str, object_id: &str, relation: &str) -> bool {
        self.members.insert(member_key(object_type, object_id, relation))
    }

    /// Whether the subject side of `edge` is a member.
    pub(crate) fn contains(&self, edge: &RelationIdentifier) -> bool {
        self.members.contains(&member_key(
            &edge.subject_type,
            &edge.subject_id,
            &edge.subject_relation,
        ))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    /// One trace line per member.
    pub(crate) fn describe(&self) -> Vec<String> {
        self.members
            .iter()
            .map(|member| match member.split_once(FIELD_SEP) {
                Some((subject, "")) => format!("member {subject}"),
                Some((subject, relation)) => format!("member {subject}#{relation}"),
                None => format!("member {member}"),
            })
            .collect()
    }
}

fn member_key(object_type: &str, object_id: &str, relation: &str) -> String {
    let mut key = object_key(object_type, object_id);
    key.push(FIELD_SEP);
    key.push_str(relation);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::tests::seeded;
    use crate::model::tests::folders;
    use crate::types::Relation;

    fn expand(relations: &[Relation], subject: &str) -> UserSet {
        let model = folders();
        let db = seeded(&model, relations);
        let tx = db.begin_read();
        UserSet::expand(&tx, &model, &CancellationToken::new(), "user", subject).unwrap()
    }

    fn member(set: &UserSet, object: (&str, &str), relation: &str) -> bool {
        set.contains(&Relation::new(("x", "x"), "x", object, relation).identifier())
    }

    #[test]
    fn lone_subject_has_itself_and_wildcard() {
        let set = expand(&[], "alice");
        assert_eq!(set.len(), 2);
        assert!(member(&set, ("user", "alice"), ""));
        assert!(member(&set, ("user", "*"), ""));
        assert_eq!(set.describe(), ["member user:*", "member user:alice"]);
    }

    #[test]
    fn nested_groups_and_owners() {
        let set = expand(
            &[
                Relation::new(("group", "eng"), "owner", ("user", "alice"), ""),
                Relation::new(("group", "all"), "member", ("group", "eng"), "member"),
                Relation::new(("group", "cycle"), "member", ("group", "all"), "member"),
                Relation::new(("group", "all"), "member", ("group", "cycle"), "member"),
                Relation::new(("group", "other"), "member", ("user", "bob"), ""),
                Relation::new(("folder", "f"), "viewer", ("user", "alice"), ""),
            ],
            "alice",
        );
        assert!(member(&set, ("group", "eng"), "member"));
        assert!(member(&set, ("group", "all"), "member"));
        assert!(member(&set, ("group", "cycle"), "member"));
        assert!(!member(&set, ("group", "other"), "member"));
        assert!(!member(&set, ("group", "eng"), "owner"));
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn wildcard_membership_applies_to_everyone() {
        let model = folders();
        let db = seeded(&model, &[]);
        let edge = Relation::new(("group", "everyone"), "member", ("user", "*"), "");
        db.update(|tx| {
            tx.create_bucket_if_not_exists(RELATIONS_SUB)?;
            tx.put(
                RELATIONS_SUB,
                crate::keys::relation_sub_key(&edge.identifier()).as_bytes(),
                b"",
            )
        })
        .unwrap();
        let tx = db.begin_read();
        let set = UserSet::expand(&tx, &model, &CancellationToken::new(), "user", "zoe").unwrap();
        assert!(member(&set, ("group", "everyone"), "member"));
    }
}
