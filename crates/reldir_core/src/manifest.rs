//! Manifest persistence.

use crate::error::DirectoryResult;
use crate::keys::{BODY_KEY, MANIFEST, METADATA_KEY, MODEL_KEY};
use crate::model::{Model, ModelLoader, Stats};
use crate::store;
use crate::types::{Manifest, ManifestBody, ManifestMetadata};
use chrono::Utc;
use reldir_codec::{etag, fnv1a64, Binary, Json};
use reldir_storage::{Tx, WriteTx};
use tracing::info;

/// Reads the stored manifest, if any.
pub(crate) fn get_manifest(tx: &impl Tx) -> DirectoryResult<Option<Manifest>> {
    let Some(body) = store::get::<Binary, ManifestBody>(tx, MANIFEST, BODY_KEY)? else {
        return Ok(None);
    };
    let metadata = store::get::<Binary, ManifestMetadata>(tx, MANIFEST, METADATA_KEY)?
        .unwrap_or_default();
    Ok(Some(Manifest {
        body: body.data,
        metadata,
    }))
}

/// Reads the stored compiled model.
pub(crate) fn stored_model(tx: &impl Tx) -> DirectoryResult<Option<Model>> {
    store::get::<Json, Model>(tx, MANIFEST, MODEL_KEY)
}

/// The model to serve: the stored one, else compiled from the stored body,
/// else empty.
pub(crate) fn load_model(tx: &impl Tx, loader: &dyn ModelLoader) -> DirectoryResult<Model> {
    if let Some(model) = stored_model(tx)? {
        return Ok(model);
    }
    match get_manifest(tx)? {
        Some(manifest) => loader.load(&manifest.body),
        None => Ok(Model::default()),
    }
}

/// Compiles and stores a new manifest after checking it against the
/// stored data. Returns the stored metadata and the compiled model; the
/// caller publishes the model once the transaction commits.
pub(crate) fn set_manifest(
    tx: &mut WriteTx<'_>,
    loader: &dyn ModelLoader,
    current: &Model,
    body: &[u8],
) -> DirectoryResult<(ManifestMetadata, Model)> {
    let model = loader.load(body)?;
    let tag = etag(fnv1a64(body));

    if let Some(stored) = get_manifest(tx)? {
        if stored.metadata.etag == tag && stored.body == body {
            return Ok((stored.metadata, model));
        }
    }

    let stats = Stats::compute(tx)?;
    current.can_update(&model, &stats)?;

    let metadata = ManifestMetadata {
        updated_at: Some(Utc::now()),
        etag: tag,
    };
    write(tx, body, &metadata, &model)?;
    info!(etag = %metadata.etag, types = model.objects.len(), "manifest updated");
    Ok((metadata, model))
}

/// Writes body, metadata and model.
pub(crate) fn write(
    tx: &mut WriteTx<'_>,
    body: &[u8],
    metadata: &ManifestMetadata,
    model: &Model,
) -> DirectoryResult<()> {
    tx.create_bucket_if_not_exists(MANIFEST)?;
    let body = ManifestBody {
        data: body.to_vec(),
    };
    store::put::<Binary, _>(tx, MANIFEST, BODY_KEY, &body)?;
    store::put::<Binary, _>(tx, MANIFEST, METADATA_KEY, metadata)?;
    store::put::<Json, _>(tx, MANIFEST, MODEL_KEY, model)?;
    Ok(())
}

/// Removes body, metadata and model.
pub(crate) fn delete_manifest(tx: &mut WriteTx<'_>) -> DirectoryResult<()> {
    if !tx.bucket_exists(MANIFEST) {
        return Ok(());
    }
    for key in [BODY_KEY, METADATA_KEY, MODEL_KEY] {
        tx.delete(MANIFEST, key)?;
    }
    info!("manifest deleted");
    Ok(())
}
