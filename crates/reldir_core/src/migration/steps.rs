//! The built-in migration steps.
//!
//! | version | change |
//! |---------|--------|
//! | 0.0.1 | metadata, object and relation buckets; seed types |
//! | 0.0.2 | name keys for metadata and objects; relation indexes |
//! | 0.0.3 | manifest rendered from metadata; current record shapes |
//! | 0.0.4 | compiled model stored beside the manifest |
//! | 0.0.5 | model recompiled at model version 3 |
//! | 0.0.7 | binary value encoding |
//! | 0.0.8 | canonical relation bucket; blank index values |

use super::legacy::{
    self, ObjectRefV1, ObjectTypeV1, ObjectV1, PermissionV1, RelationTypeV1, RelationV1,
    OBJECT_TYPES, PERMISSIONS, RELATIONS_V1, RELATION_TYPES,
};
use super::Migration;
use crate::error::{DirectoryError, DirectoryResult};
use crate::keys::{
    self, object_key, relation_obj_key, relation_sub_key, Index, BODY_KEY, MANIFEST, METADATA_KEY,
    MODEL_KEY, OBJECTS, RELATIONS, RELATIONS_OBJ, RELATIONS_SUB,
};
use crate::model::{ModelLoader, YamlModelLoader, MODEL_VERSION};
use crate::store::{self, PrefixScan};
use crate::types::{ManifestBody, ManifestMetadata, Object, Relation, RelationIdentifier};
use chrono::Utc;
use reldir_codec::{etag, fnv1a64, Binary, Codec, Json, Raw};
use reldir_storage::{ReadTx, Tx, WriteTx};
use semver::Version;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

type StepFn = fn(&ReadTx, &mut WriteTx<'_>) -> DirectoryResult<()>;

/// A step made of functions run in order.
struct Step {
    version: Version,
    name: &'static str,
    functions: &'static [StepFn],
}

impl Migration for Step {
    fn version(&self) -> Version {
        self.version.clone()
    }

    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
        for function in self.functions {
            function(ro, rw)?;
        }
        Ok(())
    }
}

pub(super) fn builtin() -> Vec<Box<dyn Migration>> {
    let step = |patch, name, functions| -> Box<dyn Migration> {
        Box::new(Step {
            version: Version::new(0, 0, patch),
            name,
            functions,
        })
    };
    vec![
        step(1, "initial layout", &[create_v1_buckets, seed_v1_metadata]),
        step(2, "name keys", &[rekey_metadata, rekey_objects, index_relations]),
        step(
            3,
            "manifest",
            &[render_manifest, convert_objects, convert_relations, drop_metadata],
        ),
        step(4, "compiled model", &[compile_model]),
        step(5, "model version 3", &[compile_model]),
        step(7, "binary encoding", &[encode_objects, encode_relations, encode_manifest]),
        step(8, "canonical relations", &[copy_relations, blank_indexes]),
    ]
}

/// Raw entries of a bucket in the read-only snapshot.
fn entries<'tx>(ro: &'tx ReadTx, path: &[&str]) -> impl Iterator<Item = (&'tx [u8], &'tx [u8])> {
    PrefixScan::new(ro, path, Vec::new())
}

/// Replaces the contents of `path` in `rw` with the converted entries of
/// `path` in `ro`.
fn rewrite<A, B, CA, CB>(
    ro: &ReadTx,
    rw: &mut WriteTx<'_>,
    path: &[&str],
    mut convert: impl FnMut(&[u8], A) -> DirectoryResult<(Vec<u8>, B)>,
) -> DirectoryResult<usize>
where
    CA: Codec<A>,
    CB: Codec<B>,
{
    let mut converted = Vec::new();
    for (key, value) in entries(ro, path) {
        converted.push(convert(key, CA::decode(value)?)?);
    }
    store::delete_bucket_if_exists(rw, path)?;
    rw.create_bucket(path)?;
    for (key, value) in &converted {
        store::put::<CB, B>(rw, path, key, value)?;
    }
    debug!(bucket = ?path, entries = converted.len(), "bucket rewritten");
    Ok(converted.len())
}

fn text(key: &[u8]) -> DirectoryResult<&str> {
    std::str::from_utf8(key)
        .map_err(|_| DirectoryError::key_format(format!("key {key:?} is not UTF-8")))
}

// 0.0.1

fn create_v1_buckets(_: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    for path in [OBJECT_TYPES, RELATION_TYPES, PERMISSIONS, OBJECTS, RELATIONS_V1] {
        rw.create_bucket_if_not_exists(path)?;
    }
    Ok(())
}

fn seed_v1_metadata(_: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    for object_type in legacy::seed_object_types() {
        store::put::<Json, _>(rw, OBJECT_TYPES, &legacy::id_key(object_type.id), &object_type)?;
    }
    for relation_type in legacy::seed_relation_types() {
        store::put::<Json, _>(
            rw,
            RELATION_TYPES,
            &legacy::id_key(relation_type.id),
            &relation_type,
        )?;
    }
    Ok(())
}

// 0.0.2

fn rekey_metadata(ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    rewrite::<ObjectTypeV1, _, Json, Json>(ro, rw, OBJECT_TYPES, |_, t| {
        Ok((t.name.clone().into_bytes(), t))
    })?;
    rewrite::<RelationTypeV1, _, Json, Json>(ro, rw, RELATION_TYPES, |_, r| {
        Ok((legacy::relation_type_key(&r.object_type, &r.name).into_bytes(), r))
    })?;
    rewrite::<PermissionV1, _, Json, Json>(ro, rw, PERMISSIONS, |_, p| {
        Ok((p.name.clone().into_bytes(), p))
    })?;
    Ok(())
}

/// Object uuid to `(type, key)` in a generation 1 snapshot.
fn object_refs(ro: &ReadTx) -> DirectoryResult<HashMap<String, ObjectRefV1>> {
    let mut refs = HashMap::new();
    for (key, value) in entries(ro, OBJECTS) {
        let object: ObjectV1 = Json::decode(value)?;
        refs.insert(
            text(key)?.to_string(),
            ObjectRefV1 {
                id: String::new(),
                object_type: object.object_type,
                key: object.key,
            },
        );
    }
    Ok(refs)
}

fn rekey_objects(ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    rewrite::<ObjectV1, _, Json, Json>(ro, rw, OBJECTS, |_, mut object| {
        let key = object_key(&object.object_type, &object.key);
        object.id = String::new();
        Ok((key.into_bytes(), object))
    })?;
    Ok(())
}

fn index_relations(ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    let refs = object_refs(ro)?;
    let resolve = |id: &str| {
        refs.get(id)
            .cloned()
            .ok_or_else(|| DirectoryError::KeyNotFound(format!("object {id}")))
    };

    for path in [RELATIONS_OBJ, RELATIONS_SUB] {
        rw.create_bucket_if_not_exists(path)?;
    }
    let mut count = 0;
    for (key, value) in entries(ro, RELATIONS_V1) {
        let key = text(key)?;
        let [object_id, relation, subject_id] = key.split('|').collect::<Vec<_>>()[..] else {
            return Err(DirectoryError::key_format(format!(
                "relation key {key:?} is not objectId|relation|subjectId"
            )));
        };
        let mut record: RelationV1 = Json::decode(value)?;
        record.object = resolve(object_id)?;
        record.subject = resolve(subject_id)?;
        record.relation = relation.to_string();

        let id = identifier_v2(&record);
        let encoded = Json::encode(&record)?;
        rw.put(RELATIONS_OBJ, relation_obj_key(&id).as_bytes(), &encoded)?;
        rw.put(RELATIONS_SUB, relation_sub_key(&id).as_bytes(), &encoded)?;
        count += 1;
    }
    store::delete_bucket_if_exists(rw, RELATIONS_V1)?;
    debug!(relations = count, "relations indexed by name");
    Ok(())
}

fn identifier_v2(record: &RelationV1) -> RelationIdentifier {
    RelationIdentifier {
        object_type: record.object.object_type.clone(),
        object_id: record.object.key.clone(),
        relation: record.relation.clone(),
        subject_type: record.subject.object_type.clone(),
        subject_id: record.subject.key.clone(),
        subject_relation: String::new(),
    }
}

// 0.0.3

#[derive(Serialize)]
struct ManifestDoc {
    model: ModelInfo,
    types: BTreeMap<String, TypeDoc>,
}

#[derive(Serialize)]
struct ModelInfo {
    version: u32,
}

#[derive(Default, Serialize)]
struct TypeDoc {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    relations: BTreeMap<String, RelationDoc>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    permissions: BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum RelationDoc {
    Short(String),
    Full {
        #[serde(skip_serializing_if = "Option::is_none")]
        types: Option<String>,
        union: String,
    },
}

#[derive(Default)]
struct RelationShape {
    subjects: BTreeSet<String>,
    unions: BTreeSet<String>,
    permissions: BTreeSet<String>,
}

/// Renders the generation 2 metadata as a manifest. Subject shapes found
/// in stored relations are added to the declared ones so that every
/// stored relation stays valid.
fn render_manifest_body(ro: &ReadTx) -> DirectoryResult<Vec<u8>> {
    let mut types: BTreeMap<String, BTreeMap<String, RelationShape>> = BTreeMap::new();
    for (_, value) in entries(ro, OBJECT_TYPES) {
        let object_type: ObjectTypeV1 = Json::decode(value)?;
        types.entry(object_type.name).or_default();
    }
    for (_, value) in entries(ro, RELATION_TYPES) {
        let relation_type: RelationTypeV1 = Json::decode(value)?;
        let shape = types
            .entry(relation_type.object_type)
            .or_default()
            .entry(relation_type.name)
            .or_default();
        shape.subjects.extend(relation_type.subject_types);
        shape.unions.extend(relation_type.unions);
        shape.permissions.extend(relation_type.permissions);
    }
    for (key, _) in entries(ro, RELATIONS_OBJ) {
        let id = Index::ObjectMajor.parse(key)?;
        types.entry(id.subject_type.clone()).or_default();
        types
            .entry(id.object_type)
            .or_default()
            .entry(id.relation)
            .or_default()
            .subjects
            .insert(id.subject_type);
    }

    let mut doc = ManifestDoc {
        model: ModelInfo {
            version: MODEL_VERSION,
        },
        types: BTreeMap::new(),
    };
    for (type_name, relations) in &types {
        let mut type_doc = TypeDoc::default();
        let mut grants: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, shape) in relations {
            let subjects: Vec<&str> = shape
                .subjects
                .iter()
                .map(String::as_str)
                .filter(|s: &&str| types.contains_key(s.split('#').next().unwrap_or(*s)))
                .collect();
            let unions: Vec<&str> = shape
                .unions
                .iter()
                .map(String::as_str)
                .filter(|u| relations.get(*u).is_some_and(|r| !r.subjects.is_empty()))
                .collect();
            if subjects.is_empty() && unions.is_empty() {
                warn!(relation = %format!("{type_name}#{name}"), "dropping relation without subjects");
                continue;
            }
            let assignable = (!subjects.is_empty()).then(|| subjects.join(" | "));
            let rendered = match (assignable, unions.is_empty()) {
                (Some(assignable), true) => RelationDoc::Short(assignable),
                (assignable, _) => RelationDoc::Full {
                    types: assignable,
                    union: unions.join(" | "),
                },
            };
            type_doc.relations.insert(name.clone(), rendered);
            for permission in &shape.permissions {
                grants.entry(permission.as_str()).or_default().push(name.as_str());
            }
        }
        for (permission, relations) in grants {
            if type_doc.relations.contains_key(permission) {
                warn!(%permission, object_type = %type_name, "permission shadows a relation, dropped");
                continue;
            }
            type_doc
                .permissions
                .insert(permission.to_string(), relations.join(" | "));
        }
        doc.types.insert(type_name.clone(), type_doc);
    }

    let yaml = serde_yaml::to_string(&doc)
        .map_err(|e| DirectoryError::InvalidManifest(format!("cannot render manifest: {e}")))?;
    Ok(yaml.into_bytes())
}

fn render_manifest(ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    let body = render_manifest_body(ro)?;
    let metadata = ManifestMetadata {
        updated_at: Some(Utc::now()),
        etag: etag(fnv1a64(&body)),
    };
    rw.create_bucket_if_not_exists(MANIFEST)?;
    store::put::<Json, _>(rw, MANIFEST, BODY_KEY, &ManifestBody { data: body })?;
    store::put::<Json, _>(rw, MANIFEST, METADATA_KEY, &metadata)?;
    Ok(())
}

fn convert_objects(ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    rewrite::<ObjectV1, Object, Json, Json>(ro, rw, OBJECTS, |key, legacy| {
        let id = keys::parse_bytes(key, keys::parse_object_key)?;
        let mut object = Object {
            object_type: id.object_type,
            id: id.object_id,
            display_name: legacy.display_name,
            properties: legacy.properties,
            created_at: legacy.created_at,
            updated_at: legacy.updated_at,
            etag: String::new(),
        };
        object.etag = object.content_etag();
        Ok((key.to_vec(), object))
    })?;
    Ok(())
}

fn convert_relations(ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    let mut relations = Vec::new();
    for (_, value) in entries(ro, RELATIONS_OBJ) {
        let legacy: RelationV1 = Json::decode(value)?;
        let id = identifier_v2(&legacy);
        let mut relation = Relation {
            object_type: id.object_type,
            object_id: id.object_id,
            relation: id.relation,
            subject_type: id.subject_type,
            subject_id: id.subject_id,
            subject_relation: id.subject_relation,
            created_at: legacy.created_at,
            updated_at: legacy.updated_at,
            etag: String::new(),
        };
        relation.etag = relation.content_etag();
        relations.push(relation);
    }

    for path in [RELATIONS_OBJ, RELATIONS_SUB] {
        store::delete_bucket_if_exists(rw, path)?;
        rw.create_bucket(path)?;
    }
    for relation in &relations {
        let id = relation.identifier();
        store::put::<Json, _>(rw, RELATIONS_OBJ, relation_obj_key(&id).as_bytes(), relation)?;
        store::put::<Json, _>(rw, RELATIONS_SUB, relation_sub_key(&id).as_bytes(), relation)?;
    }
    Ok(())
}

fn drop_metadata(_: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    for path in [OBJECT_TYPES, RELATION_TYPES, PERMISSIONS] {
        store::delete_bucket_if_exists(rw, path)?;
    }
    Ok(())
}

// 0.0.4, 0.0.5

/// Compiles the manifest with the YAML loader, since 0.0.3 rendered it as
/// YAML.
fn compile_model(ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    let Some(body) = store::get::<Json, ManifestBody>(ro, MANIFEST, BODY_KEY)? else {
        return Ok(());
    };
    let model = YamlModelLoader.load(&body.data)?;
    rw.create_bucket_if_not_exists(MANIFEST)?;
    store::put::<Json, _>(rw, MANIFEST, MODEL_KEY, &model)?;
    debug!(types = model.objects.len(), "model compiled");
    Ok(())
}

// 0.0.7

fn encode_objects(ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    rewrite::<Object, Object, Json, Binary>(ro, rw, OBJECTS, |key, object| {
        Ok((key.to_vec(), object))
    })?;
    Ok(())
}

fn encode_relations(ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    for path in [RELATIONS_OBJ, RELATIONS_SUB] {
        rewrite::<Relation, Relation, Json, Binary>(ro, rw, path, |key, relation| {
            Ok((key.to_vec(), relation))
        })?;
    }
    Ok(())
}

fn encode_manifest(ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    if !rw.bucket_exists(MANIFEST) {
        return Ok(());
    }
    if let Some(body) = store::get::<Json, ManifestBody>(ro, MANIFEST, BODY_KEY)? {
        store::put::<Binary, _>(rw, MANIFEST, BODY_KEY, &body)?;
    }
    if let Some(metadata) = store::get::<Json, ManifestMetadata>(ro, MANIFEST, METADATA_KEY)? {
        store::put::<Binary, _>(rw, MANIFEST, METADATA_KEY, &metadata)?;
    }
    if let Some(model) = store::get::<Raw, Vec<u8>>(ro, MANIFEST, MODEL_KEY)? {
        store::put::<Raw, _>(rw, MANIFEST, MODEL_KEY, &model)?;
    }
    Ok(())
}

// 0.0.8

fn copy_relations(ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    store::delete_bucket_if_exists(rw, RELATIONS)?;
    rw.create_bucket(RELATIONS)?;
    for (key, value) in entries(ro, RELATIONS_OBJ) {
        let relation: Relation = Binary::decode(value)?;
        store::put::<Binary, _>(rw, RELATIONS, key, &relation)?;
    }
    Ok(())
}

fn blank_indexes(ro: &ReadTx, rw: &mut WriteTx<'_>) -> DirectoryResult<()> {
    for path in [RELATIONS_OBJ, RELATIONS_SUB] {
        rw.create_bucket_if_not_exists(path)?;
        for (key, _) in entries(ro, path) {
            rw.put(path, key, b"")?;
        }
    }
    Ok(())
}
