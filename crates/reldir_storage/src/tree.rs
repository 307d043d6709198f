//! Copy-on-write bucket tree.
//!
//! Every committed state of the database is one immutable [`Bucket`] root.
//! Readers clone the root `Arc`; the writer clones the root value (two
//! `Arc` bumps) and mutates through `Arc::make_mut`, so only the buckets it
//! touches are copied.

use crate::error::{StorageError, StorageResult};
use crate::record::Op;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Ordered key/value entries of one bucket.
pub type Entries = BTreeMap<Bytes, Bytes>;

/// A named container of ordered keys and nested buckets.
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    entries: Arc<Entries>,
    children: Arc<BTreeMap<String, Bucket>>,
}

impl Bucket {
    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.entries.get(key)
    }

    /// Returns the ordered entries of this bucket.
    #[must_use]
    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    /// Returns the number of keys in this bucket.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the bucket holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the names of the direct child buckets, in order.
    pub fn bucket_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// Looks up a nested bucket.
    #[must_use]
    pub fn bucket(&self, path: &[&str]) -> Option<&Bucket> {
        path.iter()
            .try_fold(self, |bucket, name| bucket.children.get(*name))
    }

    fn bucket_mut(&mut self, path: &[&str]) -> Option<&mut Bucket> {
        let mut bucket = self;
        for name in path {
            bucket = Arc::make_mut(&mut bucket.children).get_mut(*name)?;
        }
        Some(bucket)
    }

    fn existing_mut(&mut self, path: &[&str]) -> StorageResult<&mut Bucket> {
        validate_path(path)?;
        if self.bucket(path).is_none() {
            return Err(StorageError::path_not_found(path));
        }
        self.bucket_mut(path)
            .ok_or_else(|| StorageError::path_not_found(path))
    }

    /// Creates the bucket at `path`. Its parent must exist.
    ///
    /// # Errors
    ///
    /// `BucketExists` if it is already there, `PathNotFound` if the parent
    /// is missing.
    pub fn create_bucket(&mut self, path: &[&str]) -> StorageResult<()> {
        validate_path(path)?;
        let (name, parent_path) = split_last(path)?;
        if self.bucket(path).is_some() {
            return Err(StorageError::bucket_exists(path));
        }
        let parent = if parent_path.is_empty() {
            self
        } else {
            self.existing_mut(parent_path)?
        };
        Arc::make_mut(&mut parent.children).insert(name.to_string(), Bucket::default());
        Ok(())
    }

    /// Removes the bucket at `path` together with everything below it.
    ///
    /// # Errors
    ///
    /// `PathNotFound` if there is no such bucket.
    pub fn delete_bucket(&mut self, path: &[&str]) -> StorageResult<()> {
        validate_path(path)?;
        let (name, parent_path) = split_last(path)?;
        if self.bucket(path).is_none() {
            return Err(StorageError::path_not_found(path));
        }
        let parent = if parent_path.is_empty() {
            self
        } else {
            self.existing_mut(parent_path)?
        };
        Arc::make_mut(&mut parent.children).remove(name);
        Ok(())
    }

    /// Stores `value` under `key` in the bucket at `path`.
    ///
    /// # Errors
    ///
    /// `PathNotFound` if the bucket does not exist.
    pub fn put(&mut self, path: &[&str], key: Bytes, value: Bytes) -> StorageResult<()> {
        let bucket = self.existing_mut(path)?;
        Arc::make_mut(&mut bucket.entries).insert(key, value);
        Ok(())
    }

    /// Removes `key` from the bucket at `path`, returning whether it existed.
    ///
    /// # Errors
    ///
    /// `PathNotFound` if the bucket does not exist.
    pub fn delete(&mut self, path: &[&str], key: &[u8]) -> StorageResult<bool> {
        let bucket = self.existing_mut(path)?;
        if !bucket.entries.contains_key(key) {
            return Ok(false);
        }
        Ok(Arc::make_mut(&mut bucket.entries).remove(key).is_some())
    }

    /// Applies one logged operation during replay.
    ///
    /// # Errors
    ///
    /// Fails if the operation does not fit the current tree, which means
    /// the log is inconsistent.
    pub fn apply(&mut self, op: &Op) -> StorageResult<()> {
        match op {
            Op::CreateBucket { path } => self.create_bucket(&as_refs(path)),
            Op::DeleteBucket { path } => self.delete_bucket(&as_refs(path)),
            Op::Put { path, key, value } => self.put(&as_refs(path), key.clone(), value.clone()),
            Op::Delete { path, key } => self.delete(&as_refs(path), key).map(|_| ()),
        }
    }

    /// Returns the operations that rebuild this tree from nothing.
    #[must_use]
    pub fn snapshot_ops(&self) -> Vec<Op> {
        let mut ops = Vec::new();
        let mut path = Vec::new();
        self.collect_ops(&mut path, &mut ops);
        ops
    }

    fn collect_ops(&self, path: &mut Vec<String>, ops: &mut Vec<Op>) {
        for (name, child) in self.children.iter() {
            path.push(name.clone());
            ops.push(Op::CreateBucket { path: path.clone() });
            for (key, value) in child.entries.iter() {
                ops.push(Op::Put {
                    path: path.clone(),
                    key: key.clone(),
                    value: value.clone(),
                });
            }
            child.collect_ops(path, ops);
            path.pop();
        }
    }
}

fn as_refs(path: &[String]) -> Vec<&str> {
    path.iter().map(String::as_str).collect()
}

fn split_last<'a, 'p>(path: &'p [&'a str]) -> StorageResult<(&'a str, &'p [&'a str])> {
    path.split_last()
        .map(|(name, parent)| (*name, parent))
        .ok_or_else(|| StorageError::InvalidPath("empty bucket path".into()))
}

/// Rejects empty paths and empty segments.
///
/// # Errors
///
/// `InvalidPath` describing the problem.
pub fn validate_path(path: &[&str]) -> StorageResult<()> {
    if path.is_empty() {
        return Err(StorageError::InvalidPath("empty bucket path".into()));
    }
    if path.iter().any(|name| name.is_empty()) {
        return Err(StorageError::InvalidPath(format!(
            "empty segment in {}",
            path.join("/")
        )));
    }
    Ok(())
}
