//! Database handle: open, recovery, transactions and compaction.

use crate::backend::StorageBackend;
use crate::batch::Batcher;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::lock::FileLock;
use crate::memory::InMemoryBackend;
use crate::options::Options;
use crate::record::{self, encode_header, encode_record};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::tree::Bucket;
use crate::tx::{ReadTx, WriteTx};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Logs below this size are never compacted.
const MIN_COMPACT_SIZE: u64 = 64 * 1024;

/// An open database.
///
/// `Db` is a cheap handle; clones share the same database. The file lock is
/// released when the last clone is dropped.
///
/// # Concurrency
///
/// Any number of [`ReadTx`] may run at once, each on its own snapshot. One
/// [`WriteTx`] runs at a time; further writers block until it finishes.
#[derive(Clone)]
pub struct Db {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) path: Option<PathBuf>,
    pub(crate) options: Options,
    pub(crate) committed: RwLock<Arc<Bucket>>,
    pub(crate) writer: Mutex<Writer>,
    pub(crate) batcher: Batcher,
    pub(crate) stats: EngineStats,
    _lock: Option<FileLock>,
}

pub(crate) struct Writer {
    pub(crate) backend: Box<dyn StorageBackend>,
    compact_at: u64,
}

impl Db {
    /// Opens or creates the database file at `path`.
    ///
    /// The file lock is taken first, exclusive for writers and shared for
    /// read-only opens. The log is then replayed; a torn final record left
    /// by a crash is discarded.
    ///
    /// # Errors
    ///
    /// `Timeout` if the lock stays held by someone else, `InvalidFormat`,
    /// `IncompatibleVersion` or `Corrupted` for a bad file, or an I/O error.
    pub fn open(path: impl AsRef<Path>, options: Options) -> StorageResult<Self> {
        let path = path.as_ref();
        if !options.read_only {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }

        let lock = FileLock::acquire(path, options.read_only, options.timeout)?;
        let backend: Box<dyn StorageBackend> = if options.read_only {
            Box::new(FileBackend::open_read_only(path)?)
        } else {
            Box::new(FileBackend::open(path)?)
        };

        let read_only = options.read_only;
        let db = Self::open_backend(backend, options, Some(path.to_path_buf()), Some(lock))?;
        info!(path = %path.display(), read_only, "opened database");
        Ok(db)
    }

    /// Opens an empty database that lives only in memory.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches [`Db::open`].
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()), Options::default())
    }

    /// Opens a database over an arbitrary backend, for instance an
    /// [`InMemoryBackend`] holding a backup image.
    ///
    /// # Errors
    ///
    /// Same as [`Db::open`], without the locking errors.
    pub fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        options: Options,
    ) -> StorageResult<Self> {
        Self::open_backend(backend, options, None, None)
    }

    fn open_backend(
        mut backend: Box<dyn StorageBackend>,
        options: Options,
        path: Option<PathBuf>,
        lock: Option<FileLock>,
    ) -> StorageResult<Self> {
        let data = backend.read_all()?;
        let mut root = Bucket::default();

        if data.is_empty() {
            if !options.read_only {
                backend.append(&encode_header())?;
                backend.sync()?;
            }
        } else {
            let replay = record::replay(&data)?;
            for ops in &replay.records {
                for op in ops {
                    root.apply(op).map_err(|e| {
                        StorageError::Corrupted(format!("log does not replay: {e}"))
                    })?;
                }
            }
            if let Some(reason) = replay.torn_tail {
                warn!(%reason, valid_len = replay.valid_len, "discarding torn commit record");
                if !options.read_only {
                    backend.truncate(replay.valid_len)?;
                }
            }
            debug!(records = replay.records.len(), "replayed commit log");
        }

        let compact_at = backend.size()?.max(MIN_COMPACT_SIZE);
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                options,
                committed: RwLock::new(Arc::new(root)),
                writer: Mutex::new(Writer {
                    backend,
                    compact_at,
                }),
                batcher: Batcher::default(),
                stats: EngineStats::default(),
                _lock: lock,
            }),
        })
    }

    /// Returns the database file path, or `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Returns true if the database was opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.options.read_only
    }

    /// Returns the options the database was opened with.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Starts a read transaction on the latest committed state.
    #[must_use]
    pub fn begin_read(&self) -> ReadTx {
        self.inner.stats.record_read_tx();
        ReadTx::new(Arc::clone(&self.inner.committed.read()))
    }

    /// Starts the write transaction, waiting for the current writer if any.
    ///
    /// # Errors
    ///
    /// `ReadOnly` on a read-only database.
    pub fn begin_write(&self) -> StorageResult<WriteTx<'_>> {
        WriteTx::begin(&self.inner)
    }

    /// Runs `f` inside a read transaction.
    ///
    /// # Errors
    ///
    /// Whatever `f` returns.
    pub fn view<T, E>(&self, f: impl FnOnce(&ReadTx) -> Result<T, E>) -> Result<T, E> {
        let tx = self.begin_read();
        f(&tx)
    }

    /// Runs `f` inside a write transaction and commits if it succeeds.
    ///
    /// # Errors
    ///
    /// Whatever `f` returns, in which case nothing is committed, or the
    /// commit error.
    pub fn update<T, E>(&self, f: impl FnOnce(&mut WriteTx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        self.inner.update(f)
    }

    /// Returns the engine counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Inner {
    pub(crate) fn update<T, E>(
        &self,
        f: impl FnOnce(&mut WriteTx<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let mut tx = WriteTx::begin(self)?;
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }
}

impl Writer {
    /// Rewrites the log as one snapshot record once it has grown past
    /// `compaction_ratio` times the snapshot size.
    pub(crate) fn maybe_compact(&mut self, inner: &Inner, root: &Bucket) {
        let ratio = u64::from(inner.options.compaction_ratio);
        if ratio == 0 {
            return;
        }
        let size = match self.backend.size() {
            Ok(size) if size > self.compact_at => size,
            _ => return,
        };

        let image = match snapshot_image(root) {
            Ok(image) => image,
            Err(err) => {
                warn!(error = %err, "could not encode snapshot for compaction");
                return;
            }
        };
        let image_len = image.len() as u64;
        if size > image_len.saturating_mul(ratio) {
            match self.backend.replace(&image) {
                Ok(()) => {
                    inner.stats.record_compaction();
                    info!(before = size, after = image_len, "compacted commit log");
                }
                Err(err) => warn!(error = %err, "log compaction failed"),
            }
        }
        self.compact_at = image_len.saturating_mul(ratio).max(MIN_COMPACT_SIZE);
    }
}

/// Encodes `root` as a standalone database image.
pub(crate) fn snapshot_image(root: &Bucket) -> StorageResult<Vec<u8>> {
    let mut image = encode_header().to_vec();
    let ops = root.snapshot_ops();
    if !ops.is_empty() {
        image.extend(encode_record(&ops)?);
    }
    Ok(image)
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.inner.path)
            .field("read_only", &self.inner.options.read_only)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::Tx;
    use tempfile::tempdir;

    const OBJECTS: &[&str] = &["objects"];

    #[test]
    fn committed_writes_are_visible() {
        let db = Db::open_in_memory().unwrap();
        db.update(|tx| -> StorageResult<()> {
            tx.create_bucket(OBJECTS)?;
            tx.put(OBJECTS, b"user:alice", b"a")
        })
        .unwrap();

        let tx = db.begin_read();
        assert_eq!(tx.get(OBJECTS, b"user:alice").unwrap().as_ref(), b"a");
        assert!(matches!(
            tx.get(OBJECTS, b"user:bob"),
            Err(StorageError::KeyNotFound)
        ));
        assert!(matches!(
            tx.get(&["relations"], b"x"),
            Err(StorageError::PathNotFound { .. })
        ));
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let db = Db::open_in_memory().unwrap();
        db.update(|tx| tx.create_bucket(OBJECTS)).unwrap();

        let before = db.begin_read();
        db.update(|tx| tx.put(OBJECTS, b"k", b"v")).unwrap();

        assert!(before.get(OBJECTS, b"k").is_err());
        assert!(db.begin_read().get(OBJECTS, b"k").is_ok());
    }

    #[test]
    fn failed_closure_rolls_back() {
        let db = Db::open_in_memory().unwrap();
        db.update(|tx| tx.create_bucket(OBJECTS)).unwrap();

        let result: StorageResult<()> = db.update(|tx| {
            tx.put(OBJECTS, b"k", b"v")?;
            Err(StorageError::KeyNotFound)
        });
        assert!(result.is_err());
        assert!(db.begin_read().get(OBJECTS, b"k").is_err());
        assert_eq!(db.stats().rollbacks, 1);
    }

    #[test]
    fn dropped_write_tx_discards_changes() {
        let db = Db::open_in_memory().unwrap();
        {
            let mut tx = db.begin_write().unwrap();
            tx.create_bucket(OBJECTS).unwrap();
        }
        assert!(!db.begin_read().bucket_exists(OBJECTS));
    }

    #[test]
    fn explicit_rollback() {
        let db = Db::open_in_memory().unwrap();
        let mut tx = db.begin_write().unwrap();
        tx.create_bucket(OBJECTS).unwrap();
        tx.rollback();

        assert!(!db.begin_read().bucket_exists(OBJECTS));
        assert_eq!(db.stats().rollbacks, 1);
        assert!(db.begin_write().is_ok());
    }

    #[test]
    fn reopen_replays_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("directory.db");
        {
            let db = Db::open(&path, Options::default()).unwrap();
            db.update(|tx| -> StorageResult<()> {
                tx.create_bucket_if_not_exists(&["_manifest", "default"])?;
                tx.put(&["_manifest", "default"], b"body", b"yaml")
            })
            .unwrap();
            db.update(|tx| tx.delete_bucket(&["_manifest", "default"]))
                .unwrap();
            db.update(|tx| tx.create_bucket(OBJECTS)).unwrap();
        }

        let db = Db::open(&path, Options::default()).unwrap();
        let tx = db.begin_read();
        assert!(tx.bucket_exists(&["_manifest"]));
        assert!(!tx.bucket_exists(&["_manifest", "default"]));
        assert_eq!(tx.bucket_names(&[]).unwrap(), ["_manifest", "objects"]);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let backend = InMemoryBackend::new();
        {
            let db = Db::open_with_backend(Box::new(backend.clone()), Options::default()).unwrap();
            db.update(|tx| tx.create_bucket(OBJECTS)).unwrap();
            db.update(|tx| tx.put(OBJECTS, b"k", b"v")).unwrap();
        }
        let mut data = backend.data();
        let intact = data.len();
        data.extend_from_slice(b"RDCM\xff\xff");

        let torn = InMemoryBackend::with_data(data);
        let db = Db::open_with_backend(Box::new(torn.clone()), Options::default()).unwrap();
        assert!(db.begin_read().get(OBJECTS, b"k").is_ok());
        assert_eq!(torn.data().len(), intact);
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("directory.db");
        {
            let db = Db::open(&path, Options::default()).unwrap();
            db.update(|tx| tx.create_bucket(OBJECTS)).unwrap();
        }

        let db = Db::open(&path, Options::default().read_only(true)).unwrap();
        assert!(db.begin_read().bucket_exists(OBJECTS));
        assert!(matches!(db.begin_write(), Err(StorageError::ReadOnly)));
    }

    #[test]
    fn second_writer_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("directory.db");
        let _first = Db::open(&path, Options::default()).unwrap();

        let options = Options::default().timeout(std::time::Duration::from_millis(100));
        assert!(matches!(Db::open(&path, options), Err(StorageError::Timeout)));
    }

    #[test]
    fn write_to_exports_openable_image() {
        let db = Db::open_in_memory().unwrap();
        db.update(|tx| -> StorageResult<()> {
            tx.create_bucket(OBJECTS)?;
            tx.put(OBJECTS, b"user:alice", b"a")?;
            tx.put(OBJECTS, b"user:bob", b"b")
        })
        .unwrap();

        let mut image = Vec::new();
        let written = db.begin_read().write_to(&mut image).unwrap();
        assert_eq!(written, image.len() as u64);

        let copy = Db::open_with_backend(
            Box::new(InMemoryBackend::with_data(image)),
            Options::default().read_only(true),
        )
        .unwrap();
        let tx = copy.begin_read();
        let keys: Vec<_> = tx.cursor(OBJECTS).unwrap().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(keys, vec![b"user:alice".to_vec(), b"user:bob".to_vec()]);
    }

    #[test]
    fn log_compacts_when_it_grows() {
        let backend = InMemoryBackend::new();
        let db = Db::open_with_backend(
            Box::new(backend.clone()),
            Options::default().compaction_ratio(2),
        )
        .unwrap();
        db.update(|tx| tx.create_bucket(OBJECTS)).unwrap();

        let value = vec![7u8; 1024];
        for _ in 0..200 {
            db.update(|tx| tx.put(OBJECTS, b"hot-key", &value)).unwrap();
        }

        assert!(db.stats().compactions >= 1);
        assert!((backend.data().len() as u64) < MIN_COMPACT_SIZE * 2);

        let reopened = Db::open_with_backend(Box::new(backend), Options::default()).unwrap();
        assert_eq!(reopened.begin_read().get(OBJECTS, b"hot-key").unwrap().len(), 1024);
    }
}
