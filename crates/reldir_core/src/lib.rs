//! # reldir core
//!
//! An embedded relationship-based access control directory.
//!
//! A directory stores typed objects and directed relations between them,
//! constrained by a manifest that declares the object types, which
//! subjects each relation accepts, and how permissions derive from
//! relations. Checks answer whether a subject holds a relation or
//! permission on an object by walking the relation graph.
//!
//! ## Layout
//!
//! - [`keys`]: bucket paths and the composite key formats
//! - [`store`]: typed bucket access, prefix scans and paging
//! - [`migration`]: versioned schema steps from the oldest layout to the
//!   current one
//! - [`Model`]: the compiled manifest, with the closures checks need
//! - [`Directory`]: reader, writer, importer and exporter
//!
//! ## Example
//!
//! ```rust
//! use reldir_core::{CheckRequest, Directory, Relation};
//! use tokio_util::sync::CancellationToken;
//!
//! let dir = Directory::open_in_memory().unwrap();
//! dir.set_manifest(
//!     "model: {version: 3}
//! types:
//!   user: {}
//!   folder:
//!     relations:
//!       owner: user
//!       viewer: {types: user, union: owner}
//!     permissions:
//!       read: viewer",
//! )
//! .unwrap();
//! dir.set_relation(Relation::new(("folder", "docs"), "owner", ("user", "alice"), ""))
//!     .unwrap();
//!
//! let read = CheckRequest::new(("folder", "docs"), "read", ("user", "alice"));
//! assert!(dir.check(&read, &CancellationToken::new()).unwrap().check);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod check;
mod config;
mod directory;
mod error;
mod export;
mod import;
pub mod keys;
mod manifest;
pub mod migration;
mod model;
mod object;
mod relation;
pub mod store;
mod types;

pub use check::{
    CheckRequest, CheckResponse, ChecksRequest, Direction, GetGraphRequest, ObjectDependency,
    MAX_DEPTH,
};
pub use config::Config;
pub use directory::{
    Directory, Fetched, GetObjectRequest, GetObjectResponse, GetRelationRequest,
    GetRelationResponse, SEED_MANIFEST,
};
pub use error::{DirectoryError, DirectoryResult, ErrorCode};
pub use export::{ExportItem, ExportOptions};
pub use import::{ImportCounter, ImportOp, ImportPayload, ImportRequest, ImportResponse};
pub use keys::{Index, RelationFilter};
pub use model::{
    Assignment, Model, ModelCache, ModelLoader, ObjectDef, ObjectTypeStats, PermissionDef,
    PermissionRule, RelationDef, RelationStats, Stats, SubjectStats, YamlModelLoader,
    MODEL_VERSION, PARENT_RELATION, WILDCARD,
};
pub use relation::RelationQuery;
pub use store::{Page, PaginationRequest, PaginationResponse};
pub use types::{
    Manifest, ManifestBody, ManifestMetadata, Object, ObjectIdentifier, Properties, Relation,
    RelationIdentifier,
};
