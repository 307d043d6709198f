//! Engine open options.

use std::time::Duration;

/// Options for opening a database file.
#[derive(Debug, Clone)]
pub struct Options {
    /// How long to keep retrying the file lock before failing with `Timeout`.
    /// Zero means a single attempt.
    pub timeout: Duration,

    /// Open for reading only. Takes a shared lock and rejects write transactions.
    pub read_only: bool,

    /// Maximum number of closures coalesced into one batch commit.
    pub max_batch_size: usize,

    /// Maximum time a batch waits for more closures before committing.
    /// Closures submitted to an idle database do not wait.
    pub max_batch_delay: Duration,

    /// Compact the log once it is this many times larger than a fresh snapshot.
    /// Zero disables compaction.
    pub compaction_ratio: u32,

    /// Whether to sync the file on every commit.
    pub sync_on_commit: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            read_only: false,
            max_batch_size: 1000,
            max_batch_delay: Duration::from_millis(10),
            compaction_ratio: 4,
            sync_on_commit: true,
        }
    }
}

impl Options {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lock acquisition timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets the maximum batch size.
    #[must_use]
    pub const fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the maximum batch delay.
    #[must_use]
    pub const fn max_batch_delay(mut self, delay: Duration) -> Self {
        self.max_batch_delay = delay;
        self
    }

    /// Sets the compaction ratio.
    #[must_use]
    pub const fn compaction_ratio(mut self, ratio: u32) -> Self {
        self.compaction_ratio = ratio;
        self
    }

    /// Sets whether to sync on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.max_batch_size, 1000);
        assert_eq!(options.max_batch_delay, Duration::from_millis(10));
        assert!(!options.read_only);
        assert!(options.sync_on_commit);
    }

    #[test]
    fn builder_pattern() {
        let options = Options::new()
            .read_only(true)
            .compaction_ratio(0)
            .max_batch_size(8);

        assert!(options.read_only);
        assert_eq!(options.compaction_ratio, 0);
        assert_eq!(options.max_batch_size, 8);
    }
}
