//! Batched checks on a worker pool.

use super::{CheckKind, CheckRequest, CheckResponse, Checker};
use crate::error::{DirectoryError, DirectoryResult};
use crate::model::Model;
use crossbeam_channel::unbounded;
use reldir_storage::Tx;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Several checks sharing defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChecksRequest {
    /// Fills the empty fields of every item.
    pub default: CheckRequest,
    /// The checks, answered in the same order.
    pub checks: Vec<CheckRequest>,
}

/// Evaluates every item on up to one worker per core, all reading from
/// `tx`. An item that cannot be evaluated answers `false` with the error as
/// context.
pub(crate) fn checks<X: Tx + Sync>(
    tx: &X,
    model: &Model,
    cancel: &CancellationToken,
    request: ChecksRequest,
) -> DirectoryResult<Vec<CheckResponse>> {
    let total = request.checks.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let workers = thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .min(total);

    let (inbox, work) = unbounded();
    let (outbox, done) = unbounded();
    for (index, item) in request.checks.into_iter().enumerate() {
        inbox
            .send((index, item.with_defaults(&request.default)))
            .map_err(|_| DirectoryError::Unknown("check inbox closed".to_string()))?;
    }
    drop(inbox);

    thread::scope(|scope| {
        for _ in 0..workers {
            let work = work.clone();
            let outbox = outbox.clone();
            scope.spawn(move || {
                let checker = Checker::new(tx, model, cancel);
                for (index, item) in work {
                    let response = checker
                        .check(&item, CheckKind::Any)
                        .unwrap_or_else(|err| CheckResponse::failed(&err));
                    if outbox.send((index, response)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(outbox);

    if cancel.is_cancelled() {
        return Err(DirectoryError::Cancelled);
    }
    let mut results = vec![CheckResponse::default(); total];
    for (index, response) in done.try_iter() {
        results[index] = response;
    }
    debug!(checks = total, workers, "checks evaluated");
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::tests::seeded;
    use crate::model::tests::folders;
    use crate::types::Relation;

    #[test]
    fn order_is_preserved_and_errors_stay_local() {
        let model = folders();
        let db = seeded(
            &model,
            &[
                Relation::new(("folder", "root"), "viewer", ("user", "alice"), ""),
                Relation::new(("folder", "root"), "owner", ("user", "bob"), ""),
            ],
        );
        let subjects = ["alice", "bob", "carol"];
        let mut items: Vec<CheckRequest> = (0..60)
            .map(|i| CheckRequest {
                subject_id: subjects[i % 3].to_string(),
                relation: if i % 2 == 0 { "read" } else { "delete" }.to_string(),
                ..Default::default()
            })
            .collect();
        items.push(CheckRequest {
            object_type: "robot".into(),
            subject_id: "alice".into(),
            ..Default::default()
        });
        let request = ChecksRequest {
            default: CheckRequest::new(("folder", "root"), "read", ("user", "")),
            checks: items.clone(),
        };

        let tx = db.begin_read();
        let cancel = CancellationToken::new();
        let results = checks(&tx, &model, &cancel, request.clone()).unwrap();
        assert_eq!(results.len(), items.len());

        for (item, result) in items.iter().zip(&results).take(60) {
            let single = Checker::new(&tx, &model, &cancel)
                .check(&item.clone().with_defaults(&request.default), CheckKind::Any)
                .unwrap();
            assert_eq!(result, &single);
        }
        let failed = results.last().unwrap();
        assert!(!failed.check);
        assert!(failed.context.as_deref().unwrap().contains("robot"));
    }

    #[test]
    fn empty_batch() {
        let model = folders();
        let db = seeded(&model, &[]);
        let results = checks(
            &db.begin_read(),
            &model,
            &CancellationToken::new(),
            ChecksRequest::default(),
        )
        .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn cancelled_batch() {
        let model = folders();
        let db = seeded(&model, &[]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = ChecksRequest {
            default: CheckRequest::new(("folder", "root"), "read", ("user", "alice")),
            checks: vec![CheckRequest::default(); 4],
        };
        assert!(matches!(
            checks(&db.begin_read(), &model, &cancel, request),
            Err(DirectoryError::Cancelled)
        ));
    }
}
