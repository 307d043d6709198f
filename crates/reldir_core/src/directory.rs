//! The directory facade.

use crate::check::{
    self, CheckKind, CheckRequest, CheckResponse, Checker, ChecksRequest, GetGraphRequest,
    ObjectDependency,
};
use crate::config::Config;
use crate::error::{DirectoryError, DirectoryResult};
use crate::keys::RelationFilter;
use crate::manifest;
use crate::migration::{self, MigrationManager, REQUIRED_VERSION};
use crate::model::{Model, ModelCache, ModelLoader, Stats, YamlModelLoader};
use crate::object;
use crate::relation::{self, RelationQuery};
use crate::store::{Page, PaginationRequest, PaginationResponse};
use crate::types::{Manifest, ManifestMetadata, Object, ObjectIdentifier, Relation, RelationIdentifier};
use chrono::Utc;
use parking_lot::Mutex;
use reldir_storage::{Db, InMemoryBackend, ReadTx, StorageError, WriteTx};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Manifest installed by `seed` when none is stored.
pub const SEED_MANIFEST: &str = "\
model:
  version: 3

types:
  user:
    relations:
      manager: user

  group:
    relations:
      member: user | group#member

  identity:
    relations:
      identifier: user
";

/// Outcome of a read that honours `if_none_match`.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    /// The current value; its etag differs from the one supplied.
    Found(T),
    /// The stored etag equals the one supplied.
    NotModified,
}

impl<T> Fetched<T> {
    /// The value, or `None` when not modified.
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotModified => None,
        }
    }

    /// Whether the caller's copy is current.
    #[must_use]
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::NotModified)
    }

    fn unless_matches(
        etag: &str,
        if_none_match: &str,
        value: impl FnOnce() -> DirectoryResult<T>,
    ) -> DirectoryResult<Self> {
        if !if_none_match.is_empty() && etag == if_none_match {
            return Ok(Self::NotModified);
        }
        value().map(Self::Found)
    }
}

/// Reads one object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetObjectRequest {
    /// Object type.
    pub object_type: String,
    /// Object id.
    pub object_id: String,
    /// Also return the relations the object takes part in.
    pub with_relations: bool,
    /// Paging of the relations.
    pub page: PaginationRequest,
    /// Etag held by the caller.
    pub if_none_match: String,
}

impl GetObjectRequest {
    /// Request for `type:id` without relations.
    pub fn new(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            object_id: object_id.into(),
            ..Self::default()
        }
    }
}

/// An object and, on request, a page of its relations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetObjectResponse {
    /// The object.
    pub result: Object,
    /// Relations with the object on either side.
    pub relations: Vec<Relation>,
    /// Paging of `relations`.
    pub page: PaginationResponse,
}

/// Reads one relation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetRelationRequest {
    /// The relation to find.
    pub query: RelationQuery,
    /// Also return the stored objects at both ends.
    pub with_objects: bool,
    /// Etag held by the caller.
    pub if_none_match: String,
}

/// A relation and, on request, the objects at its ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRelationResponse {
    /// The relation.
    pub result: Relation,
    /// Stored end objects by `type:id`.
    pub objects: BTreeMap<String, Object>,
}

/// An embedded relationship directory.
///
/// `Directory` is a cheap handle; clones share the database, the model
/// cache and the write batcher.
///
/// Every read runs in one read transaction against the model published
/// when it started. Writes go through the storage batcher: concurrent
/// writers may share a commit, and each reads the model after the write
/// transaction has begun, so a write never validates against a model
/// that is being replaced.
///
/// ```
/// use reldir_core::{CheckRequest, Directory, Object, Relation};
/// use tokio_util::sync::CancellationToken;
///
/// let dir = Directory::open_in_memory().unwrap();
/// dir.set_object(Object::new("user", "alice")).unwrap();
/// dir.set_relation(Relation::new(("group", "eng"), "member", ("user", "alice"), ""))
///     .unwrap();
///
/// let response = dir
///     .check(
///         &CheckRequest::new(("group", "eng"), "member", ("user", "alice")),
///         &CancellationToken::new(),
///     )
///     .unwrap();
/// assert!(response.check);
/// ```
#[derive(Clone)]
pub struct Directory {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) db: Db,
    pub(crate) config: Config,
    pub(crate) cache: ModelCache,
    pub(crate) loader: Box<dyn ModelLoader>,
}

impl Directory {
    /// Opens the directory at `config.db_path` with the YAML manifest
    /// loader.
    ///
    /// Pending migrations run first. With `seed` set, the built-in
    /// manifest is installed when none is stored.
    ///
    /// # Errors
    ///
    /// `Config` for an invalid configuration, storage errors (including a
    /// lock timeout), `IncompatibleVersion` for a database written by a
    /// newer build, `MigrationFailed`.
    pub fn open(config: Config) -> DirectoryResult<Self> {
        Self::open_with_loader(config, Box::new(YamlModelLoader))
    }

    /// Opens the directory with a custom manifest loader.
    ///
    /// # Errors
    ///
    /// See [`Directory::open`].
    pub fn open_with_loader(config: Config, loader: Box<dyn ModelLoader>) -> DirectoryResult<Self> {
        config.validate()?;
        let db = Db::open(&config.db_path, config.storage_options())?;
        Self::start(db, config, loader)
    }

    /// Opens a fresh directory that lives only in memory.
    ///
    /// # Errors
    ///
    /// See [`Directory::open`].
    pub fn open_in_memory() -> DirectoryResult<Self> {
        let config = Config::default();
        let db = Db::open_with_backend(Box::new(InMemoryBackend::new()), config.storage_options())?;
        Self::start(db, config, Box::new(YamlModelLoader))
    }

    fn start(db: Db, config: Config, loader: Box<dyn ModelLoader>) -> DirectoryResult<Self> {
        if config.read_only {
            let found = migration::read_version(&db.begin_read())?;
            migration::check_supported(&found, &REQUIRED_VERSION)?;
            if found < REQUIRED_VERSION {
                return Err(DirectoryError::Config(format!(
                    "database is at version {found} and needs migrating to \
                     {REQUIRED_VERSION}; open it writable once"
                )));
            }
        } else {
            let run = MigrationManager::builtin().run(&db)?;
            if run.applied_count() > 0 {
                info!(from = %run.from, to = %run.final_version, "database migrated");
            }
        }

        let model = manifest::load_model(&db.begin_read(), loader.as_ref())?;
        let seed = config.seed && !config.read_only;
        let directory = Self {
            shared: Arc::new(Shared {
                db,
                config,
                cache: ModelCache::new(model),
                loader,
            }),
        };
        if seed {
            directory.seed()?;
        }
        info!(
            path = ?directory.shared.db.path(),
            types = directory.shared.cache.get().objects.len(),
            "directory open"
        );
        Ok(directory)
    }

    fn seed(&self) -> DirectoryResult<()> {
        if manifest::get_manifest(&self.shared.db.begin_read())?.is_some() {
            return Ok(());
        }
        let metadata = self.set_manifest(SEED_MANIFEST)?;
        info!(etag = %metadata.etag, "seeded built-in manifest");
        Ok(())
    }

    /// The configuration the directory was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The underlying database.
    #[must_use]
    pub fn db(&self) -> &Db {
        &self.shared.db
    }

    pub(crate) fn read(&self) -> (ReadTx, Arc<Model>) {
        (self.shared.db.begin_read(), self.shared.cache.get())
    }

    /// Runs `op` through the write batcher and returns its value from the
    /// run that committed.
    pub(crate) fn write<T, F>(&self, op: F) -> DirectoryResult<T>
    where
        T: Send + 'static,
        F: Fn(&mut WriteTx<'_>, &Arc<Shared>) -> DirectoryResult<T> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let shared = Arc::clone(&self.shared);
        self.shared.db.batch(move |tx| {
            let value = op(tx, &shared).map_err(StorageError::aborted)?;
            *out.lock() = Some(value);
            Ok(())
        })?;
        let value = slot.lock().take();
        value.ok_or_else(|| DirectoryError::Unknown("write committed without a result".into()))
    }

    // Reader

    /// Reads an object.
    ///
    /// # Errors
    ///
    /// `ObjectTypeNotFound`, `KeyNotFound`.
    pub fn get_object(
        &self,
        request: &GetObjectRequest,
    ) -> DirectoryResult<Fetched<GetObjectResponse>> {
        let (tx, model) = self.read();
        if !model.object_exists(&request.object_type) {
            return Err(DirectoryError::ObjectTypeNotFound(
                request.object_type.clone(),
            ));
        }
        let result = object::get(&tx, &request.object_type, &request.object_id)?;
        Fetched::unless_matches(&result.etag.clone(), &request.if_none_match, || {
            let mut response = GetObjectResponse {
                result,
                ..GetObjectResponse::default()
            };
            if request.with_relations {
                let page = relation::of_object(
                    &tx,
                    &request.object_type,
                    &request.object_id,
                    &request.page,
                )?;
                response.relations = page.results;
                response.page = page.page;
            }
            Ok(response)
        })
    }

    /// Lists objects, of one type or of all types when `object_type` is
    /// empty.
    ///
    /// # Errors
    ///
    /// `ObjectTypeNotFound` for an undeclared type.
    pub fn get_objects(
        &self,
        object_type: &str,
        page: &PaginationRequest,
    ) -> DirectoryResult<Page<Object>> {
        let (tx, model) = self.read();
        if !object_type.is_empty() && !model.object_exists(object_type) {
            return Err(DirectoryError::ObjectTypeNotFound(object_type.to_string()));
        }
        object::list(&tx, object_type, page)
    }

    /// Reads several objects, in the order given.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` for the first absent object.
    pub fn get_object_many(&self, ids: &[ObjectIdentifier]) -> DirectoryResult<Vec<Object>> {
        let tx = self.shared.db.begin_read();
        ids.iter()
            .map(|id| object::get(&tx, &id.object_type, &id.object_id))
            .collect()
    }

    /// Reads one relation.
    ///
    /// # Errors
    ///
    /// `InvalidRelation` for a malformed identity, `KeyNotFound`,
    /// `MultipleResults` when an open subject relation is ambiguous.
    pub fn get_relation(
        &self,
        request: &GetRelationRequest,
    ) -> DirectoryResult<Fetched<GetRelationResponse>> {
        let tx = self.shared.db.begin_read();
        let result = relation::find(&tx, &request.query)?;
        Fetched::unless_matches(&result.etag.clone(), &request.if_none_match, || {
            let mut objects = BTreeMap::new();
            if request.with_objects {
                let id = result.identifier();
                for end in [id.object(), id.subject()] {
                    match object::get(&tx, &end.object_type, &end.object_id) {
                        Ok(object) => {
                            objects.insert(end.to_string(), object);
                        }
                        Err(err) if err.is_not_found() => {}
                        Err(err) => return Err(err),
                    }
                }
            }
            Ok(GetRelationResponse { result, objects })
        })
    }

    /// Lists relations matching `filter`.
    ///
    /// # Errors
    ///
    /// `KeyFormat` for a corrupt index entry.
    pub fn get_relations(
        &self,
        filter: &RelationFilter,
        page: &PaginationRequest,
    ) -> DirectoryResult<Page<Relation>> {
        let tx = self.shared.db.begin_read();
        relation::list(&tx, filter, page)
    }

    /// Checks a permission, or a relation when the object type declares no
    /// permission by that name.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for missing fields, `ObjectTypeNotFound`,
    /// `RelationNotFound`, `MaxDepthExceeded`, `Cancelled`.
    pub fn check(
        &self,
        request: &CheckRequest,
        cancel: &CancellationToken,
    ) -> DirectoryResult<CheckResponse> {
        self.evaluate(request, CheckKind::Any, cancel)
    }

    /// Checks a relation.
    ///
    /// # Errors
    ///
    /// See [`Directory::check`].
    pub fn check_relation(
        &self,
        request: &CheckRequest,
        cancel: &CancellationToken,
    ) -> DirectoryResult<CheckResponse> {
        self.evaluate(request, CheckKind::Relation, cancel)
    }

    /// Checks a permission.
    ///
    /// # Errors
    ///
    /// See [`Directory::check`]; `PermissionNotFound` instead of
    /// `RelationNotFound`.
    pub fn check_permission(
        &self,
        request: &CheckRequest,
        cancel: &CancellationToken,
    ) -> DirectoryResult<CheckResponse> {
        self.evaluate(request, CheckKind::Permission, cancel)
    }

    fn evaluate(
        &self,
        request: &CheckRequest,
        kind: CheckKind,
        cancel: &CancellationToken,
    ) -> DirectoryResult<CheckResponse> {
        let (tx, model) = self.read();
        Checker::new(&tx, &model, cancel).check(request, kind)
    }

    /// Evaluates a batch of checks in parallel. Results line up with the
    /// requests; an item that fails answers `false` with context.
    ///
    /// # Errors
    ///
    /// `Cancelled`.
    pub fn checks(
        &self,
        request: ChecksRequest,
        cancel: &CancellationToken,
    ) -> DirectoryResult<Vec<CheckResponse>> {
        let (tx, model) = self.read();
        check::checks(&tx, &model, cancel, request)
    }

    /// Walks the relation graph from an anchor.
    ///
    /// # Errors
    ///
    /// `InvalidArgument`, `ObjectTypeNotFound`, `GraphDirectionality`,
    /// `MaxDepthExceeded`, `Cancelled`.
    pub fn get_graph(
        &self,
        request: &GetGraphRequest,
        cancel: &CancellationToken,
    ) -> DirectoryResult<Vec<ObjectDependency>> {
        let (tx, model) = self.read();
        check::get_graph(&tx, &model, cancel, request)
    }

    /// Reads the manifest; an empty one when none is stored.
    ///
    /// # Errors
    ///
    /// Storage or decoding errors.
    pub fn get_manifest(&self, if_none_match: &str) -> DirectoryResult<Fetched<Manifest>> {
        let stored = manifest::get_manifest(&self.shared.db.begin_read())?.unwrap_or_default();
        Fetched::unless_matches(&stored.metadata.etag.clone(), if_none_match, || Ok(stored))
    }

    /// The current model.
    #[must_use]
    pub fn get_model(&self) -> Arc<Model> {
        self.shared.cache.get()
    }

    /// Counts the stored objects and relations.
    ///
    /// # Errors
    ///
    /// `KeyFormat` for a corrupt key.
    pub fn get_stats(&self) -> DirectoryResult<Stats> {
        Stats::compute(&self.shared.db.begin_read())
    }

    // Writer

    /// Stores an object. See [`Object::etag`] for the concurrency rules.
    ///
    /// # Errors
    ///
    /// `InvalidObject`, `ObjectTypeNotFound`, `HashMismatch`.
    pub fn set_object(&self, object: Object) -> DirectoryResult<Object> {
        self.write(move |tx, shared| {
            object::set(tx, &shared.cache.get(), object.clone(), Utc::now())
        })
    }

    /// Deletes an object and, with `cascade`, its relations.
    ///
    /// # Errors
    ///
    /// `InvalidObject` for a malformed identity.
    pub fn delete_object(
        &self,
        object_type: &str,
        object_id: &str,
        cascade: bool,
    ) -> DirectoryResult<()> {
        let (object_type, object_id) = (object_type.to_string(), object_id.to_string());
        self.write(move |tx, _| object::delete(tx, &object_type, &object_id, cascade))
    }

    /// Stores a relation.
    ///
    /// # Errors
    ///
    /// `InvalidRelation`, `ObjectTypeNotFound`, `RelationNotFound`,
    /// `HashMismatch`.
    pub fn set_relation(&self, relation: Relation) -> DirectoryResult<Relation> {
        self.write(move |tx, shared| {
            relation::set(tx, &shared.cache.get(), relation.clone(), Utc::now())
        })
    }

    /// Deletes the relation with exactly this identity.
    ///
    /// # Errors
    ///
    /// `InvalidRelation` for a malformed identity.
    pub fn delete_relation(&self, id: &RelationIdentifier) -> DirectoryResult<()> {
        let id = id.clone();
        self.write(move |tx, _| relation::delete(tx, &id))
    }

    /// Replaces the manifest and publishes its model once committed.
    ///
    /// # Errors
    ///
    /// `InvalidManifest`, `CannotUpdateModel` naming the stored data the
    /// new model would orphan.
    pub fn set_manifest(&self, body: impl Into<Vec<u8>>) -> DirectoryResult<ManifestMetadata> {
        let body = body.into();
        self.write(move |tx, shared| {
            let current = shared.cache.get();
            let (metadata, model) =
                manifest::set_manifest(tx, shared.loader.as_ref(), &current, &body)?;
            let published = Arc::clone(shared);
            tx.on_commit(move || published.cache.install(model));
            Ok(metadata)
        })
    }

    /// Removes the manifest. The model becomes empty, so later writes fail
    /// until a manifest is set again.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub fn delete_manifest(&self) -> DirectoryResult<()> {
        self.write(|tx, shared| {
            manifest::delete_manifest(tx)?;
            let published = Arc::clone(shared);
            tx.on_commit(move || published.cache.install(Model::default()));
            Ok(())
        })
    }
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directory")
            .field("path", &self.shared.db.path())
            .field("read_only", &self.shared.config.read_only)
            .field("types", &self.shared.cache.get().objects.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::FOLDERS;
    use tempfile::TempDir;

    fn folders() -> Directory {
        let dir = Directory::open_in_memory().unwrap();
        dir.set_manifest(FOLDERS).unwrap();
        dir
    }

    #[test]
    fn fresh_directory_has_the_builtin_types() {
        let dir = Directory::open_in_memory().unwrap();
        let model = dir.get_model();
        for object_type in ["system", "user", "group", "identity"] {
            assert!(model.object_exists(object_type), "{object_type}");
        }
        let manifest = dir.get_manifest("").unwrap().found().unwrap();
        assert!(!manifest.body.is_empty());
        assert!(!manifest.metadata.etag.is_empty());
    }

    #[test]
    fn manifest_is_published_on_commit() {
        let dir = folders();
        assert!(dir.get_model().object_exists("folder"));
        let etag = dir.get_manifest("").unwrap().found().unwrap().metadata.etag;
        assert!(dir.get_manifest(&etag).unwrap().is_not_modified());

        dir.delete_manifest().unwrap();
        assert!(dir.get_model().is_empty());
        let empty = dir.get_manifest(&etag).unwrap().found().unwrap();
        assert!(empty.body.is_empty());
        assert!(matches!(
            dir.set_object(Object::new("user", "alice")),
            Err(DirectoryError::ObjectTypeNotFound(_))
        ));
    }

    #[test]
    fn get_object_honours_if_none_match() {
        let dir = folders();
        let stored = dir.set_object(Object::new("user", "alice")).unwrap();
        let mut request = GetObjectRequest::new("user", "alice");
        request.if_none_match = stored.etag.clone();
        assert!(dir.get_object(&request).unwrap().is_not_modified());

        request.if_none_match = "0".into();
        let found = dir.get_object(&request).unwrap().found().unwrap();
        assert_eq!(found.result, stored);
        assert!(found.relations.is_empty());

        assert!(matches!(
            dir.get_object(&GetObjectRequest::new("robot", "r2")),
            Err(DirectoryError::ObjectTypeNotFound(_))
        ));
        assert!(matches!(
            dir.get_object(&GetObjectRequest::new("user", "bob")),
            Err(DirectoryError::KeyNotFound(_))
        ));
    }

    #[test]
    fn get_object_with_relations() {
        let dir = folders();
        dir.set_object(Object::new("user", "alice")).unwrap();
        dir.set_relation(Relation::new(("folder", "root"), "owner", ("user", "alice"), ""))
            .unwrap();
        dir.set_relation(Relation::new(("user", "alice"), "manager", ("user", "bob"), ""))
            .unwrap();

        let mut request = GetObjectRequest::new("user", "alice");
        request.with_relations = true;
        let response = dir.get_object(&request).unwrap().found().unwrap();
        let names: Vec<String> = response.relations.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            ["folder:root#owner@user:alice", "user:alice#manager@user:bob"]
        );
        assert!(response.page.next_token.is_empty());
    }

    #[test]
    fn get_object_many_fails_on_a_missing_object() {
        let dir = folders();
        dir.set_object(Object::new("user", "alice")).unwrap();
        dir.set_object(Object::new("user", "bob")).unwrap();
        let ids = [
            ObjectIdentifier::new("user", "bob"),
            ObjectIdentifier::new("user", "alice"),
        ];
        let objects = dir.get_object_many(&ids).unwrap();
        assert_eq!(objects[0].id, "bob");
        assert_eq!(objects[1].id, "alice");

        let missing = [ObjectIdentifier::new("user", "carol")];
        assert!(dir.get_object_many(&missing).unwrap_err().is_not_found());
    }

    #[test]
    fn get_relation_with_objects() {
        let dir = folders();
        dir.set_object(Object::new("user", "alice").with_display_name("Alice"))
            .unwrap();
        let stored = dir
            .set_relation(Relation::new(("folder", "root"), "owner", ("user", "alice"), ""))
            .unwrap();

        let request = GetRelationRequest {
            query: RelationQuery::exact(&stored.identifier()),
            with_objects: true,
            if_none_match: String::new(),
        };
        let response = dir.get_relation(&request).unwrap().found().unwrap();
        assert_eq!(response.result, stored);
        assert_eq!(response.objects.len(), 1);
        assert_eq!(response.objects["user:alice"].display_name, "Alice");

        let request = GetRelationRequest {
            if_none_match: stored.etag.clone(),
            ..request
        };
        assert!(dir.get_relation(&request).unwrap().is_not_modified());
    }

    #[test]
    fn writes_validate_against_the_model() {
        let dir = folders();
        assert!(matches!(
            dir.set_relation(Relation::new(("folder", "root"), "owner", ("group", "eng"), "")),
            Err(DirectoryError::InvalidRelation(_))
        ));
        assert!(matches!(
            dir.set_object(Object::new("user", "")),
            Err(DirectoryError::InvalidObject(_))
        ));
    }

    #[test]
    fn check_variants() {
        let dir = folders();
        let cancel = CancellationToken::new();
        dir.set_relation(Relation::new(("folder", "root"), "owner", ("user", "alice"), ""))
            .unwrap();
        let request = CheckRequest::new(("folder", "root"), "delete", ("user", "alice"));
        assert!(dir.check(&request, &cancel).unwrap().check);
        assert!(dir.check_permission(&request, &cancel).unwrap().check);
        assert!(matches!(
            dir.check_relation(&request, &cancel),
            Err(DirectoryError::RelationNotFound(_))
        ));
        let owner = CheckRequest::new(("folder", "root"), "owner", ("user", "alice"));
        assert!(dir.check_relation(&owner, &cancel).unwrap().check);
        assert!(matches!(
            dir.check_permission(&owner, &cancel),
            Err(DirectoryError::PermissionNotFound(_))
        ));
    }

    #[test]
    fn cancelled_single_checks() {
        let dir = folders();
        dir.set_relation(Relation::new(("folder", "root"), "owner", ("user", "alice"), ""))
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let owner = CheckRequest::new(("folder", "root"), "owner", ("user", "alice"));
        assert!(matches!(
            dir.check_relation(&owner, &cancel),
            Err(DirectoryError::Cancelled)
        ));
        let delete = CheckRequest::new(("folder", "root"), "delete", ("user", "alice"));
        assert!(matches!(dir.check(&delete, &cancel), Err(DirectoryError::Cancelled)));
        assert!(matches!(
            dir.check_permission(&delete, &cancel),
            Err(DirectoryError::Cancelled)
        ));

        // A fresh token answers normally.
        assert!(dir
            .check_relation(&owner, &CancellationToken::new())
            .unwrap()
            .check);
    }

    #[test]
    fn seed_reinstalls_a_deleted_manifest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("directory.db");

        let dir = Directory::open(Config::new(&path)).unwrap();
        dir.delete_manifest().unwrap();
        drop(dir);

        let dir = Directory::open(Config::new(&path)).unwrap();
        assert!(dir.get_model().is_empty());
        drop(dir);

        let dir = Directory::open(Config::new(&path).seed(true)).unwrap();
        let manifest = dir.get_manifest("").unwrap().found().unwrap();
        assert_eq!(manifest.body, SEED_MANIFEST.as_bytes());
        assert!(dir
            .get_model()
            .assignment_allowed("group", "member", "group", Some("member"), false));
    }

    #[test]
    fn read_only_open() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("directory.db");

        let db = Db::open(&path, Config::new(&path).storage_options()).unwrap();
        drop(db);
        let err = Directory::open(Config::new(&path).read_only(true)).unwrap_err();
        assert!(matches!(err, DirectoryError::Config(_)));

        let dir = Directory::open(Config::new(&path)).unwrap();
        dir.set_object(Object::new("user", "alice")).unwrap();
        drop(dir);

        let dir = Directory::open(Config::new(&path).read_only(true)).unwrap();
        assert_eq!(dir.get_objects("user", &PaginationRequest::default()).unwrap().results.len(), 1);
        assert!(dir.set_object(Object::new("user", "bob")).is_err());
    }
}
