//! Directory configuration.

use crate::error::{DirectoryError, DirectoryResult};
use reldir_storage::Options;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for opening a directory.
///
/// Can be built in code or loaded from TOML, where durations are given in
/// milliseconds:
///
/// ```
/// use reldir_core::Config;
///
/// let config = Config::from_toml_str(
///     r#"
///     db_path = "/var/lib/reldir/directory.db"
///     request_timeout = 2000
///     seed = true
///     "#,
/// )
/// .unwrap();
/// assert!(config.seed);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the database file.
    pub db_path: PathBuf,

    /// How long to wait for the file lock on open.
    #[serde(deserialize_with = "millis")]
    pub request_timeout: Duration,

    /// Most write requests coalesced into one commit.
    pub max_batch_size: usize,

    /// Longest a write request waits for others to join its commit. A
    /// request arriving while the database is idle commits at once; one
    /// arriving behind an open write transaction may wait this long. A
    /// request rejected inside a shared commit is validated a second time
    /// on its own before its error is returned.
    #[serde(deserialize_with = "millis")]
    pub max_batch_delay: Duration,

    /// Whether to install the built-in manifest when none is stored.
    pub seed: bool,

    /// Log compaction trigger: file size over live data size.
    pub compaction_ratio: u32,

    /// Open without write access. Migrations and seeding are skipped.
    pub read_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::new(),
            request_timeout: Duration::from_secs(5),
            max_batch_size: 1000,
            max_batch_delay: Duration::from_millis(10),
            seed: false,
            compaction_ratio: 4,
            read_only: false,
        }
    }
}

impl Config {
    /// Creates a configuration for the database at `db_path`.
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Parses a configuration from TOML.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the document is not valid TOML or has fields of
    /// the wrong type.
    pub fn from_toml_str(source: &str) -> DirectoryResult<Self> {
        toml::from_str(source).map_err(|e| DirectoryError::Config(e.to_string()))
    }

    /// Sets the lock acquisition timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the largest write batch.
    #[must_use]
    pub const fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the write batching delay.
    #[must_use]
    pub const fn max_batch_delay(mut self, delay: Duration) -> Self {
        self.max_batch_delay = delay;
        self
    }

    /// Sets whether the built-in manifest is installed on open.
    #[must_use]
    pub const fn seed(mut self, value: bool) -> Self {
        self.seed = value;
        self
    }

    /// Sets the log compaction ratio.
    #[must_use]
    pub const fn compaction_ratio(mut self, ratio: u32) -> Self {
        self.compaction_ratio = ratio;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Checks the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the offending field.
    pub fn validate(&self) -> DirectoryResult<()> {
        if self.db_path.as_os_str().is_empty() {
            return Err(DirectoryError::Config("db_path is required".into()));
        }
        if self.max_batch_size == 0 {
            return Err(DirectoryError::Config(
                "max_batch_size must be at least 1".into(),
            ));
        }
        if self.compaction_ratio < 2 {
            return Err(DirectoryError::Config(
                "compaction_ratio must be at least 2".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn storage_options(&self) -> Options {
        Options::new()
            .timeout(self.request_timeout)
            .read_only(self.read_only)
            .max_batch_size(self.max_batch_size)
            .max_batch_delay(self.max_batch_delay)
            .compaction_ratio(self.compaction_ratio)
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
