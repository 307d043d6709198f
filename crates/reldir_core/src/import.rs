//! Bulk import.

use crate::directory::Directory;
use crate::error::{DirectoryError, DirectoryResult};
use crate::model::Model;
use crate::types::{Object, Relation};
use crate::{object, relation};
use chrono::Utc;
use reldir_storage::WriteTx;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What an import message does with its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImportOp {
    /// Store the payload.
    Set,
    /// Delete the payload's identity.
    Delete,
}

/// The record carried by an import message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImportPayload {
    /// An object.
    Object(Object),
    /// A relation.
    Relation(Relation),
}

/// One import message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    /// Operation.
    pub op: ImportOp,
    /// Record.
    pub payload: ImportPayload,
}

impl ImportRequest {
    /// Stores `payload`.
    pub fn set(payload: impl Into<ImportPayload>) -> Self {
        Self {
            op: ImportOp::Set,
            payload: payload.into(),
        }
    }

    /// Deletes `payload`.
    pub fn delete(payload: impl Into<ImportPayload>) -> Self {
        Self {
            op: ImportOp::Delete,
            payload: payload.into(),
        }
    }
}

impl From<Object> for ImportPayload {
    fn from(object: Object) -> Self {
        Self::Object(object)
    }
}

impl From<Relation> for ImportPayload {
    fn from(relation: Relation) -> Self {
        Self::Relation(relation)
    }
}

/// Counters for one kind of record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportCounter {
    /// Messages received.
    pub recv: u64,
    /// Records stored.
    pub set: u64,
    /// Records deleted.
    pub delete: u64,
    /// Messages that failed.
    pub error: u64,
}

/// Terminal import response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResponse {
    /// Object messages.
    pub objects: ImportCounter,
    /// Relation messages.
    pub relations: ImportCounter,
}

impl ImportResponse {
    fn counter(&mut self, payload: &ImportPayload) -> &mut ImportCounter {
        match payload {
            ImportPayload::Object(_) => &mut self.objects,
            ImportPayload::Relation(_) => &mut self.relations,
        }
    }
}

impl Directory {
    /// Applies `requests` in order, committing every `max_batch_size`
    /// messages in one write transaction.
    ///
    /// A message that fails is counted and skipped; the others in its
    /// batch still commit. Object deletes do not cascade.
    ///
    /// # Errors
    ///
    /// `Cancelled` between batches, in which case earlier batches stay
    /// committed; storage errors from a commit.
    pub fn import<I>(
        &self,
        requests: I,
        cancel: &CancellationToken,
    ) -> DirectoryResult<ImportResponse>
    where
        I: IntoIterator<Item = ImportRequest>,
    {
        let batch_size = self.shared.config.max_batch_size.max(1);
        let mut response = ImportResponse::default();
        let mut requests = requests.into_iter().peekable();
        let mut batches = 0usize;

        while requests.peek().is_some() {
            if cancel.is_cancelled() {
                return Err(DirectoryError::Cancelled);
            }
            let batch: Vec<ImportRequest> = requests.by_ref().take(batch_size).collect();
            self.shared.db.update(|tx| {
                let model = self.shared.cache.get();
                for request in batch {
                    let counter = response.counter(&request.payload);
                    counter.recv += 1;
                    match apply(tx, &model, request) {
                        Ok(ImportOp::Set) => counter.set += 1,
                        Ok(ImportOp::Delete) => counter.delete += 1,
                        Err(err) => {
                            counter.error += 1;
                            debug!(error = %err, "import message rejected");
                        }
                    }
                }
                Ok::<_, DirectoryError>(())
            })?;
            batches += 1;
            info!(
                batch = batches,
                objects = response.objects.recv,
                relations = response.relations.recv,
                "import batch committed"
            );
        }
        Ok(response)
    }
}

fn apply(tx: &mut WriteTx<'_>, model: &Model, request: ImportRequest) -> DirectoryResult<ImportOp> {
    let now = Utc::now();
    match (request.op, request.payload) {
        (ImportOp::Set, ImportPayload::Object(o)) => object::set(tx, model, o, now).map(drop),
        (ImportOp::Set, ImportPayload::Relation(r)) => relation::set(tx, model, r, now).map(drop),
        (ImportOp::Delete, ImportPayload::Object(o)) => {
            object::delete(tx, &o.object_type, &o.id, false)
        }
        (ImportOp::Delete, ImportPayload::Relation(r)) => relation::delete(tx, &r.identifier()),
    }?;
    Ok(request.op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::FOLDERS;
    use crate::store::PaginationRequest;
    use crate::Config;
    use tempfile::TempDir;

    #[test]
    fn counts_per_kind() {
        let dir = Directory::open_in_memory().unwrap();
        dir.set_manifest(FOLDERS).unwrap();
        let requests = vec![
            ImportRequest::set(Object::new("user", "alice")),
            ImportRequest::set(Object::new("user", "bob")),
            ImportRequest::set(Object::new("robot", "r2")),
            ImportRequest::set(Relation::new(("folder", "root"), "owner", ("user", "alice"), "")),
            ImportRequest::set(Relation::new(("folder", "root"), "owner", ("group", "g"), "")),
            ImportRequest::delete(Object::new("user", "bob")),
        ];
        let response = dir.import(requests, &CancellationToken::new()).unwrap();
        assert_eq!(
            response.objects,
            ImportCounter {
                recv: 4,
                set: 2,
                delete: 1,
                error: 1
            }
        );
        assert_eq!(
            response.relations,
            ImportCounter {
                recv: 2,
                set: 1,
                delete: 0,
                error: 1
            }
        );
        let users = dir.get_objects("user", &PaginationRequest::default()).unwrap();
        assert_eq!(users.results.len(), 1);
    }

    #[test]
    fn commits_in_batches() {
        let temp = TempDir::new().unwrap();
        let dir = Directory::open(Config::new(temp.path().join("d.db")).max_batch_size(3)).unwrap();
        let before = dir.db().stats();
        let requests = (0..7).map(|i| ImportRequest::set(Object::new("user", format!("u{i}"))));
        let response = dir.import(requests, &CancellationToken::new()).unwrap();
        assert_eq!(response.objects.set, 7);
        assert_eq!(dir.db().stats().commits - before.commits, 3);
    }

    #[test]
    fn cancelled_before_the_first_batch() {
        let dir = Directory::open_in_memory().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let requests = vec![ImportRequest::set(Object::new("user", "alice"))];
        assert!(matches!(dir.import(requests, &cancel), Err(DirectoryError::Cancelled)));
        assert!(dir
            .get_objects("user", &PaginationRequest::default())
            .unwrap()
            .results
            .is_empty());
    }
}
