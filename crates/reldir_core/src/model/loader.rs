//! Manifest compilation.
//!
//! The default format is YAML:
//!
//! ```yaml
//! model:
//!   version: 3
//! types:
//!   user: {}
//!   group:
//!     relations:
//!       member: user | group#member
//!   folder:
//!     relations:
//!       owner: user
//!       viewer:
//!         types: user | group#member | user:*
//!         union: owner
//!     permissions:
//!       read: viewer | owner
//!       browse: viewer - owner
//! ```

use super::{Assignment, Model, ObjectDef, PermissionDef, RelationDef};
use crate::error::{DirectoryError, DirectoryResult};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

/// Manifest format version this build compiles.
pub const MODEL_VERSION: u32 = 3;

/// Compiles a manifest document into a [`Model`].
pub trait ModelLoader: Send + Sync {
    /// Compiles `body`.
    ///
    /// # Errors
    ///
    /// `InvalidManifest` describing the first problem found.
    fn load(&self, body: &[u8]) -> DirectoryResult<Model>;
}

/// Loader for the YAML manifest format.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlModelLoader;

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    model: ModelInfo,
    #[serde(default)]
    types: BTreeMap<String, Option<TypeDoc>>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    version: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TypeDoc {
    relations: BTreeMap<String, RelationDoc>,
    permissions: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RelationDoc {
    Short(String),
    Full {
        #[serde(default)]
        types: Option<String>,
        #[serde(default)]
        union: Option<String>,
    },
}

impl ModelLoader for YamlModelLoader {
    fn load(&self, body: &[u8]) -> DirectoryResult<Model> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(invalid("manifest is empty"));
        }
        let doc: ManifestDoc =
            serde_yaml::from_slice(body).map_err(|e| invalid(format!("malformed manifest: {e}")))?;
        if doc.model.version != MODEL_VERSION {
            return Err(invalid(format!(
                "unsupported model version {}, expected {MODEL_VERSION}",
                doc.model.version
            )));
        }

        let mut objects = BTreeMap::new();
        for (name, type_doc) in doc.types {
            check_name("type", &name)?;
            objects.insert(name.clone(), compile_type(&name, type_doc.unwrap_or_default())?);
        }
        validate(&objects)?;
        Ok(Model::new(doc.model.version, objects))
    }
}

fn compile_type(type_name: &str, doc: TypeDoc) -> DirectoryResult<ObjectDef> {
    let mut def = ObjectDef::default();
    for (name, relation) in doc.relations {
        check_name("relation", &name)?;
        let (types, union) = match relation {
            RelationDoc::Short(types) => (Some(types), None),
            RelationDoc::Full { types, union } => (types, union),
        };
        let types = split_terms(types.as_deref().unwrap_or(""), '|')
            .map(parse_assignment)
            .collect::<DirectoryResult<Vec<_>>>()?;
        let union = split_terms(union.as_deref().unwrap_or(""), '|')
            .map(str::to_string)
            .collect::<Vec<_>>();
        if types.is_empty() && union.is_empty() {
            return Err(invalid(format!(
                "relation {type_name}#{name} has neither types nor union"
            )));
        }
        def.relations.insert(name, RelationDef { types, union });
    }
    for (name, expr) in doc.permissions {
        check_name("permission", &name)?;
        if def.relations.contains_key(&name) {
            return Err(invalid(format!(
                "{type_name}#{name} is declared as both relation and permission"
            )));
        }
        let permission = parse_permission(&expr)
            .map_err(|e| invalid(format!("permission {type_name}#{name}: {e}")))?;
        def.permissions.insert(name, permission);
    }
    Ok(def)
}

fn split_terms(expr: &str, sep: char) -> impl Iterator<Item = &str> {
    expr.split(sep).map(str::trim).filter(|t| !t.is_empty())
}

fn parse_assignment(term: &str) -> DirectoryResult<Assignment> {
    let assignment = if let Some(object_type) = term.strip_suffix(":*") {
        Assignment::wildcard(object_type)
    } else if let Some((object_type, relation)) = term.split_once('#') {
        check_name("relation", relation)?;
        Assignment::userset(object_type, relation)
    } else {
        Assignment::direct(term)
    };
    check_name("type", &assignment.object_type)?;
    Ok(assignment)
}

fn parse_permission(expr: &str) -> Result<PermissionDef, String> {
    let tokens: Vec<&str> = expr.split_whitespace().collect();
    if let [include, "-", exclude] = tokens[..] {
        return Ok(PermissionDef::Exclusion {
            include: include.to_string(),
            exclude: exclude.to_string(),
        });
    }
    let (sep, union) = match (expr.contains('|'), expr.contains('&')) {
        (true, true) => return Err("cannot mix '|' and '&'".into()),
        (false, true) => ('&', false),
        _ => ('|', true),
    };
    let terms: Vec<String> = split_terms(expr, sep).map(str::to_string).collect();
    if terms.is_empty() {
        return Err("empty expression".into());
    }
    for term in &terms {
        if !is_name(term) {
            return Err(format!("{term:?} is not a relation or permission name"));
        }
    }
    Ok(if union {
        PermissionDef::Union(terms)
    } else {
        PermissionDef::Intersection(terms)
    })
}

/// Checks cross references once every type is known.
fn validate(objects: &BTreeMap<String, ObjectDef>) -> DirectoryResult<()> {
    for (type_name, def) in objects {
        for (name, relation) in &def.relations {
            for assignment in &relation.types {
                let Some(target) = objects.get(&assignment.object_type) else {
                    return Err(invalid(format!(
                        "{type_name}#{name} references unknown type {:?}",
                        assignment.object_type
                    )));
                };
                if let Some(subject_relation) = &assignment.relation {
                    if !target.relations.contains_key(subject_relation) {
                        return Err(invalid(format!(
                            "{type_name}#{name} references unknown relation {assignment}"
                        )));
                    }
                }
            }
            for implied in &relation.union {
                if !def.relations.contains_key(implied) {
                    return Err(invalid(format!(
                        "{type_name}#{name} unions unknown relation {implied:?}"
                    )));
                }
            }
            let mut path = BTreeSet::new();
            if union_cycle(def, name, &mut path) {
                return Err(invalid(format!(
                    "relation {type_name}#{name} unions itself"
                )));
            }
        }
        for (name, permission) in &def.permissions {
            let terms: Vec<&String> = match permission {
                PermissionDef::Union(terms) | PermissionDef::Intersection(terms) => {
                    terms.iter().collect()
                }
                PermissionDef::Exclusion { include, exclude } => vec![include, exclude],
            };
            for term in terms {
                if !def.relations.contains_key(term) && !def.permissions.contains_key(term) {
                    return Err(invalid(format!(
                        "permission {type_name}#{name} references unknown {term:?}"
                    )));
                }
            }
            let mut path = BTreeSet::new();
            if permission_cycle(def, name, &mut path) {
                return Err(invalid(format!(
                    "permission {type_name}#{name} references itself"
                )));
            }
        }
    }
    Ok(())
}

fn union_cycle<'a>(def: &'a ObjectDef, relation: &'a str, path: &mut BTreeSet<&'a str>) -> bool {
    if !path.insert(relation) {
        return true;
    }
    let cyclic = def.relations.get(relation).is_some_and(|rel| {
        rel.union
            .iter()
            .any(|implied| union_cycle(def, implied, path))
    });
    path.remove(relation);
    cyclic
}

fn permission_cycle<'a>(
    def: &'a ObjectDef,
    permission: &'a str,
    path: &mut BTreeSet<&'a str>,
) -> bool {
    let Some(rule) = def.permissions.get(permission) else {
        return false;
    };
    if !path.insert(permission) {
        return true;
    }
    let cyclic = match rule {
        PermissionDef::Union(terms) | PermissionDef::Intersection(terms) => {
            terms.iter().any(|t| permission_cycle(def, t, path))
        }
        PermissionDef::Exclusion { include, exclude } => {
            permission_cycle(def, include, path) || permission_cycle(def, exclude, path)
        }
    };
    path.remove(permission);
    cyclic
}

fn is_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn check_name(kind: &str, name: &str) -> DirectoryResult<()> {
    if is_name(name) {
        Ok(())
    } else {
        Err(invalid(format!("{kind} name {name:?} is not an identifier")))
    }
}

fn invalid(message: impl Into<String>) -> DirectoryError {
    DirectoryError::InvalidManifest(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(body: &str) -> DirectoryResult<Model> {
        YamlModelLoader.load(body.as_bytes())
    }

    fn err(body: &str) -> String {
        match load(body) {
            Err(DirectoryError::InvalidManifest(message)) => message,
            other => panic!("expected InvalidManifest, got {other:?}"),
        }
    }

    #[test]
    fn compiles_three_type_schema() {
        let model = load(
            "
model:
  version: 3
types:
  user: {}
  group:
    relations:
      member: user
  folder:
    relations:
      parent: folder
      viewer: user | group#member
",
        )
        .unwrap();
        assert_eq!(model.version, 3);
        assert_eq!(model.objects.len(), 3);
        assert_eq!(
            model.relation("folder", "viewer").unwrap().types,
            vec![Assignment::direct("user"), Assignment::userset("group", "member")]
        );
    }

    #[test]
    fn null_type_body_is_empty_type() {
        let model = load("model:\n  version: 3\ntypes:\n  user:\n").unwrap();
        assert!(model.object_exists("user"));
    }

    #[test]
    fn permission_forms() {
        assert_eq!(
            parse_permission("viewer | owner").unwrap(),
            PermissionDef::Union(vec!["viewer".into(), "owner".into()])
        );
        assert_eq!(
            parse_permission("a&b").unwrap(),
            PermissionDef::Intersection(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            parse_permission("can-view - blocked").unwrap(),
            PermissionDef::Exclusion {
                include: "can-view".into(),
                exclude: "blocked".into()
            }
        );
        assert_eq!(
            parse_permission("can-view").unwrap(),
            PermissionDef::Union(vec!["can-view".into()])
        );
        assert!(parse_permission("a | b & c").is_err());
        assert!(parse_permission("   ").is_err());
        assert!(parse_permission("a | b c").is_err());
    }

    #[test]
    fn rejects_invalid_documents() {
        assert!(err("").contains("empty"));
        assert!(err("model: [").contains("malformed"));
        assert!(err("model:\n  version: 2\n").contains("version"));
        assert!(err("model:\n  version: 3\ntypes:\n  9lives: {}\n").contains("identifier"));
        assert!(err(
            "model:\n  version: 3\ntypes:\n  doc:\n    relations:\n      owner: robot\n"
        )
        .contains("unknown type"));
        assert!(err(
            "model:\n  version: 3\ntypes:\n  user: {}\n  doc:\n    relations:\n      owner: user#boss\n"
        )
        .contains("unknown relation"));
        assert!(err(
            "model:\n  version: 3\ntypes:\n  user: {}\n  doc:\n    relations:\n      owner: user\n    permissions:\n      owner: owner\n"
        )
        .contains("both relation and permission"));
        assert!(err(
            "model:\n  version: 3\ntypes:\n  user: {}\n  doc:\n    relations:\n      owner: user\n    permissions:\n      read: writer\n"
        )
        .contains("unknown"));
    }

    #[test]
    fn rejects_cycles() {
        let unions = "
model:
  version: 3
types:
  user: {}
  doc:
    relations:
      a:
        types: user
        union: b
      b:
        union: a
";
        assert!(err(unions).contains("unions itself"));

        let permissions = "
model:
  version: 3
types:
  user: {}
  doc:
    relations:
      owner: user
    permissions:
      read: write | owner
      write: read
";
        assert!(err(permissions).contains("references itself"));
    }
}
