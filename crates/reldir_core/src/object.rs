//! Object storage.

use crate::error::{DirectoryError, DirectoryResult};
use crate::keys::{self, object_key, Index, OBJECTS};
use crate::model::Model;
use crate::relation;
use crate::store::{self, Page, PageIterator, PaginationRequest};
use crate::types::Object;
use chrono::{DateTime, Utc};
use reldir_codec::Binary;
use reldir_storage::{Tx, WriteTx};
use tracing::debug;

/// Checks the identity of an object against the key layout and the model.
pub(crate) fn validate(model: &Model, object: &Object) -> DirectoryResult<()> {
    keys::check_type("object type", &object.object_type).map_err(DirectoryError::InvalidObject)?;
    keys::check_field("object id", &object.id).map_err(DirectoryError::InvalidObject)?;
    if !model.object_exists(&object.object_type) {
        return Err(DirectoryError::ObjectTypeNotFound(
            object.object_type.clone(),
        ));
    }
    Ok(())
}

/// Reads one object.
///
/// # Errors
///
/// `KeyNotFound` if absent.
pub(crate) fn get(tx: &impl Tx, object_type: &str, object_id: &str) -> DirectoryResult<Object> {
    let key = object_key(object_type, object_id);
    store::get::<Binary, Object>(tx, OBJECTS, key.as_bytes())?
        .ok_or(DirectoryError::KeyNotFound(key))
}

/// Lists objects, optionally of one type.
pub(crate) fn list(
    tx: &impl Tx,
    object_type: &str,
    page: &PaginationRequest,
) -> DirectoryResult<Page<Object>> {
    let prefix = if object_type.is_empty() {
        String::new()
    } else {
        object_key(object_type, "")
    };
    PageIterator::decoded::<Binary>(tx, OBJECTS, &prefix, page).page()
}

/// Stores an object.
///
/// A non-empty `etag` on the incoming object must equal the stored one.
/// Writing unchanged content returns the stored object as is.
pub(crate) fn set(
    tx: &mut WriteTx<'_>,
    model: &Model,
    mut object: Object,
    now: DateTime<Utc>,
) -> DirectoryResult<Object> {
    validate(model, &object)?;
    let key = object_key(&object.object_type, &object.id);
    let stored = store::get::<Binary, Object>(tx, OBJECTS, key.as_bytes())?;
    let tag = object.content_etag();

    match stored {
        Some(stored) => {
            if !object.etag.is_empty() && object.etag != stored.etag {
                return Err(DirectoryError::HashMismatch {
                    key,
                    etag: object.etag,
                });
            }
            if stored.etag == tag {
                return Ok(stored);
            }
            object.created_at = stored.created_at.or(Some(now));
        }
        None => object.created_at = Some(now),
    }
    object.updated_at = Some(now);
    object.etag = tag;

    tx.create_bucket_if_not_exists(OBJECTS)?;
    store::put::<Binary, _>(tx, OBJECTS, key.as_bytes(), &object)?;
    debug!(%key, etag = %object.etag, "object stored");
    Ok(object)
}

/// Deletes an object, and with `cascade` every relation it takes part in
/// on either side. Deleting an absent object succeeds.
pub(crate) fn delete(
    tx: &mut WriteTx<'_>,
    object_type: &str,
    object_id: &str,
    cascade: bool,
) -> DirectoryResult<()> {
    keys::check_type("object type", object_type).map_err(DirectoryError::InvalidObject)?;
    keys::check_field("object id", object_id).map_err(DirectoryError::InvalidObject)?;

    let key = object_key(object_type, object_id);
    if tx.bucket_exists(OBJECTS) {
        tx.delete(OBJECTS, key.as_bytes())?;
    }
    if cascade {
        let mut doomed = Vec::new();
        for index in [Index::ObjectMajor, Index::SubjectMajor] {
            let prefix = keys::node_prefix(object_type, object_id);
            for (raw, _) in store::PrefixScan::new(tx, index.path(), prefix) {
                doomed.push(index.parse(raw)?);
            }
        }
        for rel in &doomed {
            relation::remove(tx, rel)?;
        }
        debug!(%key, relations = doomed.len(), "object deleted with relations");
    } else {
        debug!(%key, "object deleted");
    }
    Ok(())
}
