//! Read and write transactions.

use crate::cursor::Cursor;
use crate::db::{snapshot_image, Inner, Writer};
use crate::error::{StorageError, StorageResult};
use crate::record::{encode_record, Op};
use crate::tree::{validate_path, Bucket};
use bytes::Bytes;
use parking_lot::MutexGuard;
use std::io::Write;
use std::mem;
use std::sync::Arc;
use tracing::warn;

/// Read access shared by both transaction kinds.
pub trait Tx {
    /// The root bucket of the snapshot this transaction sees.
    fn root(&self) -> &Bucket;

    /// Returns the bucket at `path`.
    ///
    /// # Errors
    ///
    /// `PathNotFound` if any bucket along the path is missing.
    fn bucket(&self, path: &[&str]) -> StorageResult<&Bucket> {
        validate_path(path)?;
        self.root()
            .bucket(path)
            .ok_or_else(|| StorageError::path_not_found(path))
    }

    /// Returns true if the bucket at `path` exists.
    fn bucket_exists(&self, path: &[&str]) -> bool {
        !path.is_empty() && self.root().bucket(path).is_some()
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// `PathNotFound` for a missing bucket, `KeyNotFound` for a missing key.
    fn get(&self, path: &[&str], key: &[u8]) -> StorageResult<Bytes> {
        self.bucket(path)?
            .get(key)
            .cloned()
            .ok_or(StorageError::KeyNotFound)
    }

    /// Opens an ordered cursor over the bucket at `path`.
    ///
    /// # Errors
    ///
    /// `PathNotFound` if the bucket does not exist.
    fn cursor(&self, path: &[&str]) -> StorageResult<Cursor<'_>> {
        Ok(Cursor::new(self.bucket(path)?.entries()))
    }

    /// Lists the child buckets of `path`; an empty path lists top-level buckets.
    ///
    /// # Errors
    ///
    /// `PathNotFound` if the bucket does not exist.
    fn bucket_names(&self, path: &[&str]) -> StorageResult<Vec<String>> {
        let bucket = if path.is_empty() {
            self.root()
        } else {
            self.bucket(path)?
        };
        Ok(bucket.bucket_names().map(str::to_string).collect())
    }

    /// Writes a compacted, self-contained database image of this snapshot.
    ///
    /// Returns the number of bytes written. The image opens like any other
    /// database file.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    fn write_to<W: Write>(&self, out: &mut W) -> StorageResult<u64>
    where
        Self: Sized,
    {
        let image = snapshot_image(self.root())?;
        out.write_all(&image)?;
        out.flush()?;
        Ok(image.len() as u64)
    }
}

/// A read-only view of one committed state.
///
/// Read transactions never block writers and see none of their changes.
#[derive(Debug, Clone)]
pub struct ReadTx {
    root: Arc<Bucket>,
}

impl ReadTx {
    pub(crate) fn new(root: Arc<Bucket>) -> Self {
        Self { root }
    }
}

impl Tx for ReadTx {
    fn root(&self) -> &Bucket {
        &self.root
    }
}

/// The single write transaction of a database.
///
/// Changes are made on a private copy of the tree and become visible to new
/// readers only when [`WriteTx::commit`] returns. Dropping the transaction
/// without committing discards them.
pub struct WriteTx<'db> {
    inner: &'db Inner,
    writer: MutexGuard<'db, Writer>,
    root: Bucket,
    ops: Vec<Op>,
    hooks: Vec<Box<dyn FnOnce() + 'db>>,
    done: bool,
}

impl<'db> WriteTx<'db> {
    pub(crate) fn begin(inner: &'db Inner) -> StorageResult<Self> {
        if inner.options.read_only {
            return Err(StorageError::ReadOnly);
        }
        let writer = inner.writer.lock();
        let root = Bucket::clone(&inner.committed.read());
        inner.stats.record_write_tx();
        Ok(Self {
            inner,
            writer,
            root,
            ops: Vec::new(),
            hooks: Vec::new(),
            done: false,
        })
    }

    /// Creates a bucket. Its parent must exist.
    ///
    /// # Errors
    ///
    /// `BucketExists` or `PathNotFound`.
    pub fn create_bucket(&mut self, path: &[&str]) -> StorageResult<()> {
        self.root.create_bucket(path)?;
        self.ops.push(Op::CreateBucket { path: owned(path) });
        Ok(())
    }

    /// Creates a bucket and any missing parents.
    ///
    /// # Errors
    ///
    /// `InvalidPath` for an empty path.
    pub fn create_bucket_if_not_exists(&mut self, path: &[&str]) -> StorageResult<()> {
        validate_path(path)?;
        for depth in 1..=path.len() {
            let prefix = &path[..depth];
            if self.root.bucket(prefix).is_none() {
                self.create_bucket(prefix)?;
            }
        }
        Ok(())
    }

    /// Deletes a bucket and everything below it.
    ///
    /// # Errors
    ///
    /// `PathNotFound` if it does not exist.
    pub fn delete_bucket(&mut self, path: &[&str]) -> StorageResult<()> {
        self.root.delete_bucket(path)?;
        self.ops.push(Op::DeleteBucket { path: owned(path) });
        Ok(())
    }

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// `PathNotFound` if the bucket does not exist.
    pub fn put(&mut self, path: &[&str], key: &[u8], value: &[u8]) -> StorageResult<()> {
        let key = Bytes::copy_from_slice(key);
        let value = Bytes::copy_from_slice(value);
        self.root.put(path, key.clone(), value.clone())?;
        self.ops.push(Op::Put {
            path: owned(path),
            key,
            value,
        });
        Ok(())
    }

    /// Removes `key`. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// `PathNotFound` if the bucket does not exist.
    pub fn delete(&mut self, path: &[&str], key: &[u8]) -> StorageResult<()> {
        if self.root.delete(path, key)? {
            self.ops.push(Op::Delete {
                path: owned(path),
                key: Bytes::copy_from_slice(key),
            });
        }
        Ok(())
    }

    /// Registers a callback that runs after a successful commit, while the
    /// writer lock is still held.
    pub fn on_commit(&mut self, hook: impl FnOnce() + 'db) {
        self.hooks.push(Box::new(hook));
    }

    /// Makes the changes durable and visible.
    ///
    /// # Errors
    ///
    /// If the commit record cannot be written the log is restored to its
    /// previous length and nothing becomes visible.
    pub fn commit(mut self) -> StorageResult<()> {
        self.done = true;
        if let Err(err) = self.persist() {
            self.inner.stats.record_rollback();
            return Err(err);
        }
        for hook in mem::take(&mut self.hooks) {
            hook();
        }
        Ok(())
    }

    /// Discards all changes.
    pub fn rollback(self) {}

    fn persist(&mut self) -> StorageResult<()> {
        if self.ops.is_empty() {
            self.inner.stats.record_commit(0);
            return Ok(());
        }

        let frame = encode_record(&self.ops)?;
        let writer = &mut *self.writer;
        let before = writer.backend.size()?;
        let mut written = writer.backend.append(&frame).map(|_| ());
        if written.is_ok() && self.inner.options.sync_on_commit {
            written = writer.backend.sync();
        }
        if let Err(err) = written {
            if let Err(undo) = writer.backend.truncate(before) {
                warn!(error = %undo, "could not remove partial commit record");
            }
            return Err(err);
        }

        self.inner.stats.record_commit(frame.len() as u64);
        let root = Arc::new(mem::take(&mut self.root));
        *self.inner.committed.write() = Arc::clone(&root);
        writer.maybe_compact(self.inner, &root);
        Ok(())
    }
}

impl Tx for WriteTx<'_> {
    fn root(&self) -> &Bucket {
        &self.root
    }
}

impl Drop for WriteTx<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.inner.stats.record_rollback();
        }
    }
}

impl std::fmt::Debug for WriteTx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTx")
            .field("pending_ops", &self.ops.len())
            .finish_non_exhaustive()
    }
}

fn owned(path: &[&str]) -> Vec<String> {
    path.iter().map(|s| (*s).to_string()).collect()
}
