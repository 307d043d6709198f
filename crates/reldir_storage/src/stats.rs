//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic engine counters, readable while transactions run.
#[derive(Debug, Default)]
pub struct EngineStats {
    read_txs: AtomicU64,
    write_txs: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    batches: AtomicU64,
    batched_calls: AtomicU64,
    compactions: AtomicU64,
    bytes_written: AtomicU64,
}

impl EngineStats {
    pub(crate) fn record_read_tx(&self) {
        self.read_txs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_tx(&self) {
        self.write_txs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self, bytes: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, calls: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batched_calls.fetch_add(calls, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_txs: self.read_txs.load(Ordering::Relaxed),
            write_txs: self.write_txs.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            batched_calls: self.batched_calls.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// A copy of [`EngineStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Read transactions started.
    pub read_txs: u64,
    /// Write transactions started.
    pub write_txs: u64,
    /// Write transactions committed.
    pub commits: u64,
    /// Write transactions rolled back.
    pub rollbacks: u64,
    /// Batch commits executed.
    pub batches: u64,
    /// Closures committed through batches.
    pub batched_calls: u64,
    /// Log compactions performed.
    pub compactions: u64,
    /// Bytes appended to the log.
    pub bytes_written: u64,
}
