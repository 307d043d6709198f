//! Authorization checks.
//!
//! A check asks whether a subject holds a relation or permission on an
//! object. It is answered in three steps:
//!
//! 1. The relation or permission is resolved to the relations that cover
//!    it on the object type ([`Model::relation_closure`],
//!    [`Model::permission_rule`]).
//! 2. The subject is expanded into its user-set: itself, the wildcard of
//!    its type, and every `type:id#relation` it reaches through user-set
//!    relations such as group membership.
//! 3. The relation graph is walked depth first from the object, following
//!    covering relations and `parent` edges, until an edge with a covering
//!    relation points at a member of the user-set.
//!
//! All reads of one check go through one transaction.

mod batch;
mod graph;
mod userset;

pub use batch::ChecksRequest;
pub use graph::{Direction, GetGraphRequest, ObjectDependency};

pub(crate) use batch::checks;
pub(crate) use graph::get_graph;

use crate::error::{DirectoryError, DirectoryResult};
use crate::keys::{node_prefix, Index};
use crate::model::{Model, PermissionRule, PARENT_RELATION, WILDCARD};
use crate::store::PrefixScan;
use crate::types::{ObjectIdentifier, RelationIdentifier};
use reldir_storage::Tx;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use userset::UserSet;

/// Most edges on one path of a walk. Reaching a node at this depth that
/// still has edges to examine fails with `MaxDepthExceeded`.
pub const MAX_DEPTH: usize = 32;

/// Fails when a node `depth` edges from the start has edges of its own.
fn within_depth<T>(depth: usize, edges: &[T]) -> DirectoryResult<()> {
    if depth >= MAX_DEPTH && !edges.is_empty() {
        return Err(DirectoryError::MaxDepthExceeded(MAX_DEPTH));
    }
    Ok(())
}

/// A single check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckRequest {
    /// Object type.
    pub object_type: String,
    /// Object id.
    pub object_id: String,
    /// Relation or permission name.
    pub relation: String,
    /// Subject type.
    pub subject_type: String,
    /// Subject id.
    pub subject_id: String,
    /// Collect an explanation of the walk.
    pub trace: bool,
}

impl CheckRequest {
    /// Creates a request for `object#relation@subject`.
    pub fn new(
        (object_type, object_id): (&str, &str),
        relation: &str,
        (subject_type, subject_id): (&str, &str),
    ) -> Self {
        Self {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            relation: relation.to_string(),
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            trace: false,
        }
    }

    /// Requests a trace.
    #[must_use]
    pub fn with_trace(mut self) -> Self {
        self.trace = true;
        self
    }

    /// Fills every empty field from `default`.
    #[must_use]
    pub fn with_defaults(mut self, default: &CheckRequest) -> Self {
        let fields = [
            (&mut self.object_type, &default.object_type),
            (&mut self.object_id, &default.object_id),
            (&mut self.relation, &default.relation),
            (&mut self.subject_type, &default.subject_type),
            (&mut self.subject_id, &default.subject_id),
        ];
        for (field, fallback) in fields {
            if field.is_empty() {
                field.clone_from(fallback);
            }
        }
        self.trace |= default.trace;
        self
    }

    fn object(&self) -> ObjectIdentifier {
        ObjectIdentifier::new(&self.object_type, &self.object_id)
    }
}

/// The outcome of a check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    /// Whether the subject holds the relation or permission.
    pub check: bool,
    /// Walk explanation, when requested.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<String>,
    /// Why the check could not be evaluated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl CheckResponse {
    /// A negative answer carrying the error that prevented evaluation.
    #[must_use]
    pub fn failed(err: &DirectoryError) -> Self {
        Self {
            check: false,
            trace: Vec::new(),
            context: Some(err.to_string()),
        }
    }
}

/// How the `relation` of a request is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    /// A permission if the object type declares one by that name, else a
    /// relation.
    Any,
    /// Always a relation.
    Relation,
    /// Always a permission.
    Permission,
}

/// Evaluates checks against one transaction and model.
pub(crate) struct Checker<'a, X> {
    tx: &'a X,
    model: &'a Model,
    cancel: &'a CancellationToken,
}

impl<'a, X: Tx> Checker<'a, X> {
    pub(crate) fn new(tx: &'a X, model: &'a Model, cancel: &'a CancellationToken) -> Self {
        Self { tx, model, cancel }
    }

    pub(crate) fn check(
        &self,
        request: &CheckRequest,
        kind: CheckKind,
    ) -> DirectoryResult<CheckResponse> {
        self.validate(request)?;
        let users = UserSet::expand(
            self.tx,
            self.model,
            self.cancel,
            &request.subject_type,
            &request.subject_id,
        )?;
        let mut walk = Walk {
            checker: self,
            users: &users,
            trace: request.trace.then(|| users.describe()),
        };

        let object = request.object();
        let permission = match kind {
            CheckKind::Any => self
                .model
                .permission_exists(&request.object_type, &request.relation),
            CheckKind::Relation => false,
            CheckKind::Permission => true,
        };
        let check = if permission {
            let rule = self
                .model
                .permission_rule(&request.object_type, &request.relation)?;
            walk.rule(&object, rule)?
        } else {
            let covering = self
                .model
                .relation_closure(&request.object_type, &request.relation)?;
            walk.relations(&object, covering)?
        };

        trace!(
            object = %object,
            relation = %request.relation,
            subject_type = %request.subject_type,
            subject_id = %request.subject_id,
            check,
            "check evaluated"
        );
        Ok(CheckResponse {
            check,
            trace: walk.trace.unwrap_or_default(),
            context: None,
        })
    }

    fn validate(&self, request: &CheckRequest) -> DirectoryResult<()> {
        let required = [
            ("object type", &request.object_type),
            ("object id", &request.object_id),
            ("relation", &request.relation),
            ("subject type", &request.subject_type),
            ("subject id", &request.subject_id),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(DirectoryError::invalid_argument(format!("{name} is required")));
            }
        }
        for object_type in [&request.object_type, &request.subject_type] {
            if !self.model.object_exists(object_type) {
                return Err(DirectoryError::ObjectTypeNotFound(object_type.clone()));
            }
        }
        Ok(())
    }

    fn cancelled(&self) -> DirectoryResult<()> {
        if self.cancel.is_cancelled() {
            Err(DirectoryError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Relations going out of `object`, read from the object-major index.
    fn out_edges(&self, object: &ObjectIdentifier) -> DirectoryResult<Vec<RelationIdentifier>> {
        let prefix = node_prefix(&object.object_type, &object.object_id);
        PrefixScan::new(self.tx, Index::ObjectMajor.path(), prefix)
            .map(|(key, _)| Index::ObjectMajor.parse(key))
            .collect()
    }
}

struct Walk<'c, 'a, X> {
    checker: &'c Checker<'a, X>,
    users: &'c UserSet,
    trace: Option<Vec<String>>,
}

impl<X: Tx> Walk<'_, '_, X> {
    fn rule(&mut self, object: &ObjectIdentifier, rule: &PermissionRule) -> DirectoryResult<bool> {
        match rule {
            PermissionRule::Relations(covering) => self.relations(object, covering),
            PermissionRule::Union(rules) => {
                for rule in rules {
                    if self.rule(object, rule)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            PermissionRule::Intersection(rules) => {
                for rule in rules {
                    if !self.rule(object, rule)? {
                        return Ok(false);
                    }
                }
                Ok(!rules.is_empty())
            }
            PermissionRule::Exclusion(include, exclude) => {
                Ok(self.rule(object, include)? && !self.rule(object, exclude)?)
            }
        }
    }

    fn relations(
        &mut self,
        object: &ObjectIdentifier,
        covering: &BTreeSet<String>,
    ) -> DirectoryResult<bool> {
        let mut path = vec![object.clone()];
        self.descend(covering, &mut path)
    }

    fn descend(
        &mut self,
        covering: &BTreeSet<String>,
        path: &mut Vec<ObjectIdentifier>,
    ) -> DirectoryResult<bool> {
        let depth = path.len() - 1;
        self.checker.cancelled()?;

        let Some(current) = path.last() else {
            return Ok(false);
        };
        let edges = self.checker.out_edges(current)?;
        within_depth(depth, &edges)?;

        for edge in &edges {
            if covering.contains(&edge.relation) && self.users.contains(edge) {
                self.note(|| format!("{depth}: {edge} matches"));
                return Ok(true);
            }
        }

        for edge in &edges {
            let follow = covering.contains(&edge.relation) || edge.relation == PARENT_RELATION;
            // User-set subjects are resolved by the user-set, not by descent.
            if !follow || !edge.subject_relation.is_empty() || edge.subject_id == WILDCARD {
                continue;
            }
            let next = edge.subject();
            if path.contains(&next) {
                self.note(|| format!("{depth}: {edge} closes a cycle"));
                continue;
            }
            self.note(|| format!("{depth}: {edge}"));
            path.push(next);
            let found = self.descend(covering, path)?;
            path.pop();
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn note(&mut self, line: impl FnOnce() -> String) {
        if let Some(trace) = &mut self.trace {
            trace.push(line());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::tests::folders;
    use crate::relation;
    use crate::types::Relation;
    use chrono::Utc;
    use reldir_storage::Db;

    pub(crate) fn seeded(model: &Model, relations: &[Relation]) -> Db {
        let db = Db::open_in_memory().unwrap();
        db.update(|tx| {
            for rel in relations {
                relation::set(tx, model, rel.clone(), Utc::now())?;
            }
            Ok::<_, DirectoryError>(())
        })
        .unwrap();
        db
    }

    fn run(db: &Db, request: CheckRequest, kind: CheckKind) -> DirectoryResult<CheckResponse> {
        let model = folders();
        let cancel = CancellationToken::new();
        let tx = db.begin_read();
        Checker::new(&tx, &model, &cancel).check(&request, kind)
    }

    fn holds(db: &Db, relation: &str, subject: &str) -> bool {
        let request = CheckRequest::new(("folder", "root"), relation, ("user", subject));
        run(db, request, CheckKind::Any).unwrap().check
    }

    #[test]
    fn direct_and_union() {
        let db = seeded(
            &folders(),
            &[
                Relation::new(("folder", "root"), "viewer", ("user", "alice"), ""),
                Relation::new(("folder", "root"), "owner", ("user", "bob"), ""),
            ],
        );
        assert!(holds(&db, "viewer", "alice"));
        assert!(!holds(&db, "owner", "alice"));
        // Owners are viewers.
        assert!(holds(&db, "viewer", "bob"));
        assert!(!holds(&db, "viewer", "carol"));
    }

    #[test]
    fn group_membership_and_nesting() {
        let db = seeded(
            &folders(),
            &[
                Relation::new(("group", "eng"), "member", ("user", "alice"), ""),
                Relation::new(("group", "all"), "member", ("group", "eng"), "member"),
                Relation::new(("group", "all"), "owner", ("user", "bob"), ""),
                Relation::new(("folder", "root"), "viewer", ("group", "all"), "member"),
            ],
        );
        assert!(holds(&db, "viewer", "alice"));
        assert!(holds(&db, "viewer", "bob"));
        assert!(!holds(&db, "viewer", "carol"));
    }

    #[test]
    fn parent_edges_are_followed() {
        let db = seeded(
            &folders(),
            &[
                Relation::new(("folder", "root"), "parent", ("folder", "top"), ""),
                Relation::new(("folder", "top"), "parent", ("folder", "root"), ""),
                Relation::new(("folder", "top"), "viewer", ("user", "alice"), ""),
            ],
        );
        assert!(holds(&db, "viewer", "alice"));
        assert!(!holds(&db, "viewer", "bob"));
    }

    #[test]
    fn wildcard_subjects() {
        let db = seeded(
            &folders(),
            &[Relation::new(("folder", "root"), "viewer", ("user", "*"), "")],
        );
        assert!(holds(&db, "viewer", "anyone"));
        assert!(!holds(&db, "owner", "anyone"));
    }

    #[test]
    fn permissions() {
        let db = seeded(
            &folders(),
            &[
                Relation::new(("folder", "root"), "viewer", ("user", "alice"), ""),
                Relation::new(("folder", "root"), "owner", ("user", "bob"), ""),
            ],
        );
        for (permission, alice, bob) in [
            ("read", true, true),
            ("delete", false, true),
            ("audit", false, true),
            ("browse", true, false),
            ("manage", false, true),
        ] {
            assert_eq!(holds(&db, permission, "alice"), alice, "{permission}");
            assert_eq!(holds(&db, permission, "bob"), bob, "{permission}");
        }
    }

    #[test]
    fn kind_selects_the_namespace() {
        let db = seeded(&folders(), &[]);
        let request = CheckRequest::new(("folder", "root"), "read", ("user", "alice"));
        assert!(matches!(
            run(&db, request.clone(), CheckKind::Relation),
            Err(DirectoryError::RelationNotFound(_))
        ));
        let request = CheckRequest::new(("folder", "root"), "viewer", ("user", "alice"));
        assert!(matches!(
            run(&db, request, CheckKind::Permission),
            Err(DirectoryError::PermissionNotFound(_))
        ));
    }

    #[test]
    fn invalid_requests() {
        let db = seeded(&folders(), &[]);
        assert!(matches!(
            run(&db, CheckRequest::default(), CheckKind::Any),
            Err(DirectoryError::InvalidArgument(_))
        ));
        let request = CheckRequest::new(("robot", "r2"), "viewer", ("user", "alice"));
        assert!(matches!(
            run(&db, request, CheckKind::Any),
            Err(DirectoryError::ObjectTypeNotFound(_))
        ));
    }

    fn parent_chain(edges: usize) -> Vec<Relation> {
        (0..edges)
            .map(|i| {
                Relation::new(
                    ("folder", &format!("f{i}")),
                    "parent",
                    ("folder", &format!("f{}", i + 1)),
                    "",
                )
            })
            .collect()
    }

    fn chain_graph(db: &Db) -> DirectoryResult<Vec<ObjectDependency>> {
        let request = GetGraphRequest {
            anchor_type: "folder".into(),
            anchor_id: "f0".into(),
            object_type: "folder".into(),
            object_id: "f0".into(),
            ..Default::default()
        };
        get_graph(&db.begin_read(), &folders(), &CancellationToken::new(), &request)
    }

    #[test]
    fn chains_of_max_depth_are_walked() {
        let db = seeded(&folders(), &parent_chain(MAX_DEPTH));
        let request = CheckRequest::new(("folder", "f0"), "viewer", ("user", "alice"));
        assert!(!run(&db, request, CheckKind::Any).unwrap().check);

        let deps = chain_graph(&db).unwrap();
        assert_eq!(deps.len(), MAX_DEPTH);
        assert_eq!(deps.last().unwrap().depth, MAX_DEPTH - 1);

        // The last edge of a full-length path can still grant.
        let mut granted = parent_chain(MAX_DEPTH - 1);
        granted.push(Relation::new(
            ("folder", &format!("f{}", MAX_DEPTH - 1)),
            "viewer",
            ("user", "alice"),
            "",
        ));
        let db = seeded(&folders(), &granted);
        let request = CheckRequest::new(("folder", "f0"), "viewer", ("user", "alice"));
        assert!(run(&db, request, CheckKind::Any).unwrap().check);
    }

    #[test]
    fn longer_chains_are_cut_off() {
        let db = seeded(&folders(), &parent_chain(MAX_DEPTH + 1));
        let request = CheckRequest::new(("folder", "f0"), "viewer", ("user", "alice"));
        assert!(matches!(
            run(&db, request, CheckKind::Any),
            Err(DirectoryError::MaxDepthExceeded(MAX_DEPTH))
        ));
        assert!(matches!(
            chain_graph(&db),
            Err(DirectoryError::MaxDepthExceeded(MAX_DEPTH))
        ));
    }

    #[test]
    fn trace_explains_the_walk() {
        let db = seeded(
            &folders(),
            &[
                Relation::new(("folder", "root"), "parent", ("folder", "top"), ""),
                Relation::new(("folder", "top"), "viewer", ("user", "alice"), ""),
            ],
        );
        let request =
            CheckRequest::new(("folder", "root"), "viewer", ("user", "alice")).with_trace();
        let response = run(&db, request, CheckKind::Any).unwrap();
        assert!(response.check);
        assert!(response
            .trace
            .iter()
            .any(|line| line == "0: folder:root#parent@folder:top"));
        assert!(response
            .trace
            .iter()
            .any(|line| line == "1: folder:top#viewer@user:alice matches"));
    }

    #[test]
    fn cancelled_check_stops() {
        let db = seeded(&folders(), &[]);
        let model = folders();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tx = db.begin_read();
        let request = CheckRequest::new(("folder", "root"), "viewer", ("user", "alice"));
        assert!(matches!(
            Checker::new(&tx, &model, &cancel).check(&request, CheckKind::Any),
            Err(DirectoryError::Cancelled)
        ));
    }

    #[test]
    fn defaults_fill_empty_fields() {
        let default = CheckRequest::new(("folder", "root"), "viewer", ("user", ""));
        let item = CheckRequest {
            subject_id: "alice".into(),
            relation: "owner".into(),
            ..Default::default()
        };
        assert_eq!(
            item.with_defaults(&default),
            CheckRequest::new(("folder", "root"), "owner", ("user", "alice"))
        );
    }
}
