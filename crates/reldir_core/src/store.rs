//! Typed access to buckets and prefix iterators.
//!
//! Iterators borrow the transaction they were opened on, so they cannot
//! outlive it.

use crate::error::{DirectoryError, DirectoryResult};
use reldir_codec::Codec;
use reldir_storage::{Cursor, StorageError, Tx, WriteTx};
use serde::{Deserialize, Serialize};
use std::iter::Peekable;
use std::marker::PhantomData;

/// Default and largest page size.
pub const MAX_PAGE_SIZE: usize = 100;

/// Reads and decodes one value; `None` if the key or bucket is absent.
///
/// # Errors
///
/// Decoding errors.
pub fn get<C, T>(tx: &impl Tx, path: &[&str], key: &[u8]) -> DirectoryResult<Option<T>>
where
    C: Codec<T>,
{
    match tx.get(path, key) {
        Ok(bytes) => Ok(Some(C::decode(&bytes)?)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Encodes and writes one value.
///
/// # Errors
///
/// Encoding or storage errors, including `PathNotFound` for a missing
/// bucket.
pub fn put<C, T>(tx: &mut WriteTx<'_>, path: &[&str], key: &[u8], value: &T) -> DirectoryResult<()>
where
    C: Codec<T>,
{
    tx.put(path, key, &C::encode(value)?)?;
    Ok(())
}

/// Whether `key` exists in `path`.
#[must_use]
pub fn contains(tx: &impl Tx, path: &[&str], key: &[u8]) -> bool {
    tx.bucket(path)
        .map(|bucket| bucket.get(key).is_some())
        .unwrap_or(false)
}

/// Deletes a bucket, tolerating its absence.
///
/// # Errors
///
/// Storage errors other than a missing bucket.
pub fn delete_bucket_if_exists(tx: &mut WriteTx<'_>, path: &[&str]) -> DirectoryResult<()> {
    match tx.delete_bucket(path) {
        Ok(()) => Ok(()),
        Err(StorageError::PathNotFound { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Raw entries of a bucket sharing a key prefix.
///
/// A missing bucket scans as empty.
#[derive(Debug, Clone)]
pub struct PrefixScan<'tx> {
    cursor: Option<Cursor<'tx>>,
    prefix: Vec<u8>,
    start: Option<Vec<u8>>,
}

impl<'tx> PrefixScan<'tx> {
    /// Opens a scan over `path` for keys starting with `prefix`.
    pub fn new(tx: &'tx impl Tx, path: &[&str], prefix: impl Into<Vec<u8>>) -> Self {
        let prefix = prefix.into();
        Self {
            cursor: tx.cursor(path).ok(),
            start: Some(prefix.clone()),
            prefix,
        }
    }

    /// Starts the scan at `token` instead of the first matching key. An
    /// empty token is ignored.
    #[must_use]
    pub fn from_token(mut self, token: &[u8]) -> Self {
        if token > self.prefix.as_slice() {
            self.start = Some(token.to_vec());
        }
        self
    }
}

impl<'tx> Iterator for PrefixScan<'tx> {
    type Item = (&'tx [u8], &'tx [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor.as_mut()?;
        let item = match self.start.take() {
            Some(start) => cursor.seek(&start),
            None => cursor.next(),
        };
        match item {
            Some((key, value)) if key.starts_with(&self.prefix) => Some((key, value)),
            _ => {
                self.cursor = None;
                None
            }
        }
    }
}

/// Decoded entries of a bucket sharing a key prefix.
#[derive(Debug)]
pub struct ScanIterator<'tx, T, C> {
    scan: PrefixScan<'tx>,
    _codec: PhantomData<fn() -> (T, C)>,
}

impl<'tx, T, C: Codec<T>> ScanIterator<'tx, T, C> {
    /// Opens a scan over `path` for keys starting with `key_filter`,
    /// beginning at `start_token` when given.
    pub fn new(
        tx: &'tx impl Tx,
        path: &[&str],
        key_filter: &str,
        start_token: Option<&str>,
    ) -> Self {
        let mut scan = PrefixScan::new(tx, path, key_filter);
        if let Some(token) = start_token {
            scan = scan.from_token(token.as_bytes());
        }
        Self {
            scan,
            _codec: PhantomData,
        }
    }
}

impl<'tx, T, C: Codec<T>> Iterator for ScanIterator<'tx, T, C> {
    type Item = DirectoryResult<(&'tx [u8], T)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = self.scan.next()?;
        Some(C::decode(value).map(|v| (key, v)).map_err(Into::into))
    }
}

/// Paging parameters of a listing request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PaginationRequest {
    /// Requested page size; `0` means the default.
    pub size: u32,
    /// Token returned by the previous page; empty for the first page.
    pub token: String,
}

impl PaginationRequest {
    /// Requests a page of `size` entries from the start.
    #[must_use]
    pub fn size(size: u32) -> Self {
        Self {
            size,
            token: String::new(),
        }
    }

    /// Requests the page starting at `token`.
    #[must_use]
    pub fn next(size: u32, token: impl Into<String>) -> Self {
        Self {
            size,
            token: token.into(),
        }
    }

    /// Page size clamped to `1..=MAX_PAGE_SIZE`.
    #[must_use]
    pub fn page_size(&self) -> usize {
        match self.size {
            0 => MAX_PAGE_SIZE,
            n => (n as usize).min(MAX_PAGE_SIZE),
        }
    }
}

/// Paging state of a listing response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PaginationResponse {
    /// Token of the next page; empty when the listing is complete.
    pub next_token: String,
    /// Entries in this page.
    pub result_size: u32,
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Entries of the page.
    pub results: Vec<T>,
    /// Paging state.
    pub page: PaginationResponse,
}

type Loader<'tx, T> = Box<dyn FnMut(&'tx [u8], &'tx [u8]) -> DirectoryResult<Option<T>> + 'tx>;

/// Collects a scan into pages.
///
/// The loader turns a raw entry into a result or skips it by returning
/// `None`; skipped entries do not count towards the page.
pub struct PageIterator<'tx, T> {
    scan: Peekable<PrefixScan<'tx>>,
    load: Loader<'tx, T>,
    page_size: usize,
    next_token: Vec<u8>,
}

impl<'tx, T> PageIterator<'tx, T> {
    /// Pages over `scan` with a custom loader.
    pub fn new(
        scan: PrefixScan<'tx>,
        page_size: usize,
        load: impl FnMut(&'tx [u8], &'tx [u8]) -> DirectoryResult<Option<T>> + 'tx,
    ) -> Self {
        Self {
            scan: scan.peekable(),
            load: Box::new(load),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            next_token: Vec::new(),
        }
    }

    /// Pages over the values of `path` under `key_filter`, decoded with `C`.
    pub fn decoded<C: Codec<T> + 'tx>(
        tx: &'tx impl Tx,
        path: &[&str],
        key_filter: &str,
        page: &PaginationRequest,
    ) -> Self
    where
        T: 'tx,
    {
        let scan = PrefixScan::new(tx, path, key_filter).from_token(page.token.as_bytes());
        Self::new(scan, page.page_size(), |_, value| {
            C::decode(value).map(Some).map_err(Into::into)
        })
    }

    /// Collects the next page.
    ///
    /// # Errors
    ///
    /// The first error of the loader.
    pub fn next_page(&mut self) -> DirectoryResult<Vec<T>> {
        let mut results = Vec::new();
        self.next_token.clear();
        while let Some(&(key, value)) = self.scan.peek() {
            let Some(item) = (self.load)(key, value)? else {
                self.scan.next();
                continue;
            };
            if results.len() == self.page_size {
                // The next matching entry starts the following page.
                self.next_token = key.to_vec();
                break;
            }
            results.push(item);
            self.scan.next();
        }
        Ok(results)
    }

    /// Key the next page starts at, or empty when the scan is exhausted.
    #[must_use]
    pub fn next_token(&self) -> &[u8] {
        &self.next_token
    }

    /// Collects the next page with its paging state.
    ///
    /// # Errors
    ///
    /// See [`PageIterator::next_page`].
    pub fn page(mut self) -> DirectoryResult<Page<T>> {
        let results = self.next_page()?;
        let next_token = String::from_utf8(self.next_token)
            .map_err(|_| DirectoryError::key_format("page token is not UTF-8"))?;
        Ok(Page {
            page: PaginationResponse {
                next_token,
                result_size: u32::try_from(results.len()).unwrap_or(u32::MAX),
            },
            results,
        })
    }
}

impl<T> std::fmt::Debug for PageIterator<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageIterator")
            .field("page_size", &self.page_size)
            .field("next_token", &String::from_utf8_lossy(&self.next_token))
            .finish_non_exhaustive()
    }
}
