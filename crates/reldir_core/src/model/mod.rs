//! The compiled model: object types, their relations and permissions.
//!
//! A [`Model`] is produced by a [`ModelLoader`] from a manifest document
//! and stored as JSON next to it. Once published it is never mutated;
//! derived lookup tables are computed on first use and memoized.

mod cache;
mod loader;
mod stats;

pub use cache::ModelCache;
pub use loader::{ModelLoader, YamlModelLoader, MODEL_VERSION};
pub use stats::{ObjectTypeStats, RelationStats, Stats, SubjectStats};

use crate::error::{DirectoryError, DirectoryResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

/// Relation name the evaluator always descends through.
pub const PARENT_RELATION: &str = "parent";

/// Subject id standing for every subject of a type.
pub const WILDCARD: &str = "*";

/// A compiled manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Model {
    /// Manifest format version the model was compiled from.
    pub version: u32,
    /// Object types by name.
    pub objects: BTreeMap<String, ObjectDef>,
    #[serde(skip)]
    derived: OnceLock<Derived>,
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && self.objects == other.objects
    }
}

/// An object type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectDef {
    /// Relations by name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub relations: BTreeMap<String, RelationDef>,
    /// Permissions by name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub permissions: BTreeMap<String, PermissionDef>,
}

/// A relation of an object type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationDef {
    /// Subject shapes that may be assigned directly.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<Assignment>,
    /// Relations on the same type whose holders also hold this one.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub union: Vec<String>,
}

/// A subject shape allowed on a relation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Subject type.
    pub object_type: String,
    /// Subject relation for user-set assignments (`group#member`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    /// Wildcard assignment (`user:*`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub wildcard: bool,
}

impl Assignment {
    /// A plain subject type.
    pub fn direct(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            relation: None,
            wildcard: false,
        }
    }

    /// A user-set: holders of `relation` on objects of `object_type`.
    pub fn userset(object_type: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            relation: Some(relation.into()),
            wildcard: false,
        }
    }

    /// Every subject of `object_type`.
    pub fn wildcard(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            relation: None,
            wildcard: true,
        }
    }
}

impl std::fmt::Display for Assignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.relation, self.wildcard) {
            (Some(relation), _) => write!(f, "{}#{relation}", self.object_type),
            (None, true) => write!(f, "{}:*", self.object_type),
            (None, false) => f.write_str(&self.object_type),
        }
    }
}

/// A permission of an object type. Terms name relations or other
/// permissions of the same type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDef {
    /// Granted by any term.
    Union(Vec<String>),
    /// Granted by all terms.
    Intersection(Vec<String>),
    /// Granted by `include` unless also granted by `exclude`.
    Exclusion {
        /// Granting term.
        include: String,
        /// Revoking term.
        exclude: String,
    },
}

/// A permission resolved down to relation sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionRule {
    /// Holding any of these relations grants the permission.
    Relations(BTreeSet<String>),
    /// Any sub-rule grants it.
    Union(Vec<PermissionRule>),
    /// All sub-rules must grant it.
    Intersection(Vec<PermissionRule>),
    /// The first rule grants it unless the second also does.
    Exclusion(Box<PermissionRule>, Box<PermissionRule>),
}

impl PermissionRule {
    /// The granting relations when the rule is a plain union of relations.
    #[must_use]
    pub fn relations(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Relations(set) => Some(set),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Derived {
    /// `(type, relation)` to the relations implying it, itself included.
    closure: HashMap<(String, String), BTreeSet<String>>,
    /// `(type, permission)` to its rule.
    permissions: HashMap<(String, String), PermissionRule>,
    /// `(type, edge relation)` to the user-set relations an edge with that
    /// relation confers.
    userset_edges: HashMap<(String, String), BTreeSet<String>>,
    /// `type#relation` pairs usable as subjects.
    usersets: BTreeSet<(String, String)>,
}

impl Model {
    /// Creates a model from its object types.
    #[must_use]
    pub fn new(version: u32, objects: BTreeMap<String, ObjectDef>) -> Self {
        Self {
            version,
            objects,
            derived: OnceLock::new(),
        }
    }

    /// Whether the model declares no types, as after the manifest is
    /// deleted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Whether `object_type` is declared.
    #[must_use]
    pub fn object_exists(&self, object_type: &str) -> bool {
        self.objects.contains_key(object_type)
    }

    /// Whether `relation` is declared on `object_type`.
    #[must_use]
    pub fn relation_exists(&self, object_type: &str, relation: &str) -> bool {
        self.relation(object_type, relation).is_some()
    }

    /// Whether `permission` is declared on `object_type`.
    #[must_use]
    pub fn permission_exists(&self, object_type: &str, permission: &str) -> bool {
        self.objects
            .get(object_type)
            .is_some_and(|def| def.permissions.contains_key(permission))
    }

    /// Looks up a relation definition.
    #[must_use]
    pub fn relation(&self, object_type: &str, relation: &str) -> Option<&RelationDef> {
        self.objects.get(object_type)?.relations.get(relation)
    }

    /// Whether a subject of the given shape may be assigned directly to
    /// `object_type#relation`.
    #[must_use]
    pub fn assignment_allowed(
        &self,
        object_type: &str,
        relation: &str,
        subject_type: &str,
        subject_relation: Option<&str>,
        wildcard: bool,
    ) -> bool {
        self.relation(object_type, relation).is_some_and(|def| {
            def.types.iter().any(|a| {
                a.object_type == subject_type
                    && a.relation.as_deref() == subject_relation
                    && a.wildcard == wildcard
            })
        })
    }

    /// Relations on `object_type` whose holders hold `relation`: the
    /// relation itself plus its unions, transitively.
    ///
    /// # Errors
    ///
    /// `ObjectTypeNotFound` or `RelationNotFound`.
    pub fn relation_closure(
        &self,
        object_type: &str,
        relation: &str,
    ) -> DirectoryResult<&BTreeSet<String>> {
        self.require_type(object_type)?;
        self.derived()
            .closure
            .get(&(object_type.to_string(), relation.to_string()))
            .ok_or_else(|| DirectoryError::RelationNotFound(format!("{object_type}#{relation}")))
    }

    /// The relation sets that grant `permission` on `object_type`.
    ///
    /// # Errors
    ///
    /// `ObjectTypeNotFound` or `PermissionNotFound`.
    pub fn permission_rule(
        &self,
        object_type: &str,
        permission: &str,
    ) -> DirectoryResult<&PermissionRule> {
        self.require_type(object_type)?;
        self.derived()
            .permissions
            .get(&(object_type.to_string(), permission.to_string()))
            .ok_or_else(|| {
                DirectoryError::PermissionNotFound(format!("{object_type}#{permission}"))
            })
    }

    /// The relations of `type#relation` pairs that appear as user-set
    /// assignments anywhere in the model.
    #[must_use]
    pub fn userset_relations(&self) -> &BTreeSet<(String, String)> {
        &self.derived().usersets
    }

    /// User-set relations conferred by an edge `object_type#relation`.
    ///
    /// An edge `group:g#owner@user:u` confers `group:g#member` on `user:u`
    /// when `member` is a user-set relation that unions `owner`.
    pub fn userset_edges(&self, object_type: &str, relation: &str) -> impl Iterator<Item = &str> {
        self.derived()
            .userset_edges
            .get(&(object_type.to_string(), relation.to_string()))
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Checks that replacing `self` by `new` does not orphan stored data.
    ///
    /// Every blocking dependency is reported, not only the first.
    ///
    /// # Errors
    ///
    /// `CannotUpdateModel` naming each type, relation or assignment still
    /// in use.
    pub fn can_update(&self, new: &Model, stats: &Stats) -> DirectoryResult<()> {
        let mut blocked = Vec::new();
        for (object_type, type_stats) in &stats.object_types {
            if !new.object_exists(object_type) {
                if type_stats.is_in_use() {
                    blocked.push(format!(
                        "object type {object_type:?} is in use ({} objects, {} relations)",
                        type_stats.objects,
                        type_stats.relation_count()
                    ));
                }
                continue;
            }
            for (relation, rel_stats) in &type_stats.relations {
                if rel_stats.count == 0 {
                    continue;
                }
                if !new.relation_exists(object_type, relation) {
                    blocked.push(format!(
                        "relation {object_type}#{relation} is in use ({} relations)",
                        rel_stats.count
                    ));
                    continue;
                }
                for (subject_type, subject) in &rel_stats.subjects {
                    for (assignment, count) in subject.assignments(subject_type) {
                        let allowed = new.assignment_allowed(
                            object_type,
                            relation,
                            &assignment.object_type,
                            assignment.relation.as_deref(),
                            assignment.wildcard,
                        );
                        if !allowed {
                            blocked.push(format!(
                                "assignment {object_type}#{relation}@{assignment} is in use ({count} relations)"
                            ));
                        }
                    }
                }
            }
        }
        if blocked.is_empty() {
            Ok(())
        } else {
            Err(DirectoryError::CannotUpdateModel(blocked.join("; ")))
        }
    }

    fn require_type(&self, object_type: &str) -> DirectoryResult<&ObjectDef> {
        self.objects
            .get(object_type)
            .ok_or_else(|| DirectoryError::ObjectTypeNotFound(object_type.to_string()))
    }

    fn derived(&self) -> &Derived {
        self.derived.get_or_init(|| Derived::compute(self))
    }
}

impl Derived {
    fn compute(model: &Model) -> Self {
        let mut derived = Derived::default();

        for (object_type, def) in &model.objects {
            for relation in def.relations.keys() {
                let mut set = BTreeSet::new();
                collect_unions(def, relation, &mut set);
                derived
                    .closure
                    .insert((object_type.clone(), relation.clone()), set);
            }
        }

        for (object_type, def) in &model.objects {
            for permission in def.permissions.keys() {
                let mut visiting = BTreeSet::new();
                let rule = resolve_term(&derived, object_type, def, permission, &mut visiting);
                derived
                    .permissions
                    .insert((object_type.clone(), permission.clone()), rule);
            }
        }

        for def in model.objects.values() {
            for rel in def.relations.values() {
                for assignment in &rel.types {
                    if let Some(relation) = &assignment.relation {
                        derived
                            .usersets
                            .insert((assignment.object_type.clone(), relation.clone()));
                    }
                }
            }
        }

        for (object_type, relation) in &derived.usersets {
            let key = (object_type.clone(), relation.clone());
            let Some(implying) = derived.closure.get(&key) else {
                continue;
            };
            for edge in implying {
                derived
                    .userset_edges
                    .entry((object_type.clone(), edge.clone()))
                    .or_default()
                    .insert(relation.clone());
            }
        }

        derived
    }
}

fn collect_unions(def: &ObjectDef, relation: &str, out: &mut BTreeSet<String>) {
    if !out.insert(relation.to_string()) {
        return;
    }
    if let Some(rel) = def.relations.get(relation) {
        for implied in &rel.union {
            collect_unions(def, implied, out);
        }
    }
}

fn resolve_term(
    derived: &Derived,
    object_type: &str,
    def: &ObjectDef,
    term: &str,
    visiting: &mut BTreeSet<String>,
) -> PermissionRule {
    if def.relations.contains_key(term) {
        let set = derived
            .closure
            .get(&(object_type.to_string(), term.to_string()))
            .cloned()
            .unwrap_or_default();
        return PermissionRule::Relations(set);
    }
    let Some(permission) = def.permissions.get(term) else {
        return PermissionRule::Relations(BTreeSet::new());
    };
    // The loader rejects cycles; an empty rule keeps stray ones finite.
    if !visiting.insert(term.to_string()) {
        return PermissionRule::Relations(BTreeSet::new());
    }
    let mut resolve = |t: &str| resolve_term(derived, object_type, def, t, visiting);
    let rule = match permission {
        PermissionDef::Union(terms) => {
            let rules: Vec<_> = terms.iter().map(|t| resolve(t)).collect();
            merge_union(rules)
        }
        PermissionDef::Intersection(terms) => {
            PermissionRule::Intersection(terms.iter().map(|t| resolve(t)).collect())
        }
        PermissionDef::Exclusion { include, exclude } => {
            let include = resolve(include);
            let exclude = resolve(exclude);
            PermissionRule::Exclusion(Box::new(include), Box::new(exclude))
        }
    };
    visiting.remove(term);
    rule
}

/// Folds a union whose parts are all relation sets into one set.
fn merge_union(rules: Vec<PermissionRule>) -> PermissionRule {
    if rules.iter().all(|r| r.relations().is_some()) {
        let mut set = BTreeSet::new();
        for rule in rules {
            if let PermissionRule::Relations(part) = rule {
                set.extend(part);
            }
        }
        PermissionRule::Relations(set)
    } else {
        PermissionRule::Union(rules)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const FOLDERS: &str = r"
model:
  version: 3
types:
  user:
    relations:
      manager: user
  group:
    relations:
      owner: user
      member:
        types: user | group#member
        union: owner
  folder:
    relations:
      owner: user
      parent: folder
      viewer:
        types: user | group#member | user:*
        union: owner
    permissions:
      read: viewer | owner
      delete: owner
      audit: viewer & owner
      browse: viewer - owner
      manage: delete | audit
";

    pub(crate) fn folders() -> Model {
        YamlModelLoader.load(FOLDERS.as_bytes()).unwrap()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn lookups() {
        let model = folders();
        assert!(model.object_exists("folder"));
        assert!(!model.object_exists("robot"));
        assert!(model.relation_exists("folder", "viewer"));
        assert!(!model.relation_exists("folder", "read"));
        assert!(model.permission_exists("folder", "read"));
        assert!(model.assignment_allowed("folder", "viewer", "group", Some("member"), false));
        assert!(model.assignment_allowed("folder", "viewer", "user", None, true));
        assert!(!model.assignment_allowed("folder", "owner", "user", None, true));
        assert!(!model.assignment_allowed("folder", "viewer", "group", None, false));
    }

    #[test]
    fn closure_follows_unions() {
        let model = folders();
        assert_eq!(
            model.relation_closure("folder", "viewer").unwrap(),
            &set(&["owner", "viewer"])
        );
        assert_eq!(model.relation_closure("folder", "owner").unwrap(), &set(&["owner"]));
        assert!(matches!(
            model.relation_closure("folder", "nope"),
            Err(DirectoryError::RelationNotFound(_))
        ));
        assert!(matches!(
            model.relation_closure("robot", "viewer"),
            Err(DirectoryError::ObjectTypeNotFound(_))
        ));
    }

    #[test]
    fn permission_rules() {
        let model = folders();
        assert_eq!(
            model.permission_rule("folder", "read").unwrap(),
            &PermissionRule::Relations(set(&["owner", "viewer"]))
        );
        assert_eq!(
            model.permission_rule("folder", "delete").unwrap(),
            &PermissionRule::Relations(set(&["owner"]))
        );
        assert!(matches!(
            model.permission_rule("folder", "audit").unwrap(),
            PermissionRule::Intersection(parts) if parts.len() == 2
        ));
        assert!(matches!(
            model.permission_rule("folder", "browse").unwrap(),
            PermissionRule::Exclusion(..)
        ));
        assert!(matches!(
            model.permission_rule("folder", "manage").unwrap(),
            PermissionRule::Union(parts) if parts.len() == 2
        ));
        assert!(matches!(
            model.permission_rule("folder", "viewer"),
            Err(DirectoryError::PermissionNotFound(_))
        ));
    }

    #[test]
    fn usersets() {
        let model = folders();
        assert!(model
            .userset_relations()
            .contains(&("group".to_string(), "member".to_string())));
        let mut conferred: Vec<_> = model.userset_edges("group", "owner").collect();
        conferred.sort_unstable();
        assert_eq!(conferred, ["member"]);
        assert_eq!(model.userset_edges("group", "member").collect::<Vec<_>>(), ["member"]);
        assert_eq!(model.userset_edges("folder", "viewer").count(), 0);
    }

    #[test]
    fn json_round_trip_drops_memo() {
        let model = folders();
        model.relation_closure("folder", "viewer").unwrap();
        let json = serde_json::to_string(&model).unwrap();
        let back: Model = serde_json::from_str(&json).unwrap();
        assert_eq!(back, model);
        assert_eq!(
            back.relation_closure("folder", "viewer").unwrap(),
            &set(&["owner", "viewer"])
        );
    }
}
