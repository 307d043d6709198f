//! Coalescing of concurrent write closures into shared commits.
//!
//! A closure submitted to [`Db::batch`] while no writer is active and no
//! batch is pending commits at once in its own transaction. Otherwise the
//! caller parks its closure in the pending batch and waits. The batch runs
//! when it reaches `max_batch_size` closures (on the thread that filled it)
//! or when `max_batch_delay` expires (on a timer thread).
//!
//! All closures of a batch run in one write transaction. If one of them
//! fails, it is removed and re-run alone so its error reaches only its own
//! caller, and the rest of the batch is retried without it. Closures may
//! therefore run more than once and must be idempotent.

use crate::db::{Db, Inner};
use crate::error::{StorageError, StorageResult};
use crate::tx::WriteTx;
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

type BatchFn = Box<dyn Fn(&mut WriteTx<'_>) -> StorageResult<()> + Send>;

struct Call {
    run: BatchFn,
    done: Sender<StorageResult<()>>,
}

struct Pending {
    id: u64,
    calls: Vec<Call>,
}

#[derive(Default)]
pub(crate) struct Batcher {
    pending: Mutex<Option<Pending>>,
    next_id: AtomicU64,
}

impl Batcher {
    /// Nothing is pending and no write transaction is open. Two callers may
    /// both see an idle database; the second then waits for the writer.
    fn idle(&self, inner: &Inner) -> bool {
        self.pending.lock().is_none() && !inner.writer.is_locked()
    }

    fn trigger(inner: &Inner, id: u64) {
        let batch = {
            let mut pending = inner.batcher.pending.lock();
            match pending.as_ref() {
                Some(batch) if batch.id == id => pending.take(),
                _ => None,
            }
        };
        if let Some(batch) = batch {
            run_batch(inner, batch.calls);
        }
    }
}

impl Db {
    /// Runs `f` in a write transaction that may be shared with closures
    /// submitted concurrently by other threads.
    ///
    /// Commits `f` alone and without delay when the database is idle.
    /// Returns once the transaction holding `f` has committed. Must not be
    /// called while the calling thread holds a [`WriteTx`].
    ///
    /// # Errors
    ///
    /// The error `f` returned when run on its own, or `BatchFailed` if the
    /// shared commit itself failed.
    pub fn batch<F>(&self, f: F) -> StorageResult<()>
    where
        F: Fn(&mut WriteTx<'_>) -> StorageResult<()> + Send + 'static,
    {
        let options = &self.inner.options;
        if options.max_batch_size <= 1 || options.max_batch_delay.is_zero() {
            return self.update(|tx| f(tx));
        }
        if self.inner.batcher.idle(&self.inner) {
            self.inner.stats.record_batch(1);
            return self.update(|tx| f(tx));
        }

        let (done, result) = bounded(1);
        let (full, started) = {
            let mut pending = self.inner.batcher.pending.lock();
            let started = match pending.as_ref() {
                Some(_) => None,
                None => {
                    let id = self.inner.batcher.next_id.fetch_add(1, Ordering::Relaxed);
                    *pending = Some(Pending {
                        id,
                        calls: Vec::new(),
                    });
                    Some(id)
                }
            };
            let batch = pending
                .as_mut()
                .ok_or_else(|| StorageError::BatchFailed("pending batch vanished".into()))?;
            batch.calls.push(Call {
                run: Box::new(f),
                done,
            });
            let full = if batch.calls.len() >= options.max_batch_size {
                pending.take()
            } else {
                None
            };
            (full, started)
        };

        if let Some(id) = started {
            self.schedule(id);
        }
        if let Some(batch) = full {
            run_batch(&self.inner, batch.calls);
        }

        result
            .recv()
            .map_err(|_| StorageError::BatchFailed("batch was dropped before it ran".into()))?
    }

    fn schedule(&self, id: u64) {
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.options.max_batch_delay;
        let spawned = thread::Builder::new()
            .name("reldir-batch".into())
            .spawn(move || {
                thread::sleep(delay);
                if let Some(inner) = weak.upgrade() {
                    Batcher::trigger(&inner, id);
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "could not start batch timer, committing immediately");
            Batcher::trigger(&self.inner, id);
        }
    }
}

fn run_batch(inner: &Inner, mut calls: Vec<Call>) {
    inner.stats.record_batch(calls.len() as u64);
    debug!(calls = calls.len(), "committing batch");

    while !calls.is_empty() {
        let mut failed = None;
        let outcome = inner.update(|tx| {
            for (index, call) in calls.iter().enumerate() {
                if let Err(err) = (call.run)(tx) {
                    failed = Some(index);
                    return Err(err);
                }
            }
            Ok(())
        });

        match (outcome, failed) {
            (Ok(()), _) => {
                for call in calls.drain(..) {
                    let _ = call.done.send(Ok(()));
                }
            }
            (Err(_), Some(index)) => {
                let call = calls.remove(index);
                let solo = inner.update(|tx| (call.run)(tx));
                let _ = call.done.send(solo);
            }
            (Err(err), None) => {
                let reason = err.to_string();
                for call in calls.drain(..) {
                    let _ = call.done.send(Err(StorageError::BatchFailed(reason.clone())));
                }
            }
        }
    }
}
