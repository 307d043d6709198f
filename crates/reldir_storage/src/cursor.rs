//! Ordered cursors over a bucket.

use crate::tree::Entries;
use bytes::Bytes;
use std::ops::Bound;

/// A restartable cursor over the keys of one bucket, in byte order.
///
/// The cursor borrows the transaction that created it, so it can never
/// outlive the snapshot it reads. Iterating a fresh cursor starts at the
/// first key; after [`Cursor::seek`] iteration continues past the key the
/// seek returned.
#[derive(Debug, Clone)]
pub struct Cursor<'tx> {
    entries: &'tx Entries,
    position: Option<&'tx [u8]>,
    exhausted: bool,
}

/// A key/value pair borrowed from a transaction snapshot.
pub type Item<'tx> = (&'tx [u8], &'tx [u8]);

impl<'tx> Cursor<'tx> {
    pub(crate) fn new(entries: &'tx Entries) -> Self {
        Self {
            entries,
            position: None,
            exhausted: false,
        }
    }

    /// Moves to the first key.
    pub fn first(&mut self) -> Option<Item<'tx>> {
        let item = self.entries.iter().next().map(pair);
        self.settle(item)
    }

    /// Moves to the last key.
    pub fn last(&mut self) -> Option<Item<'tx>> {
        let item = self.entries.iter().next_back().map(pair);
        self.settle(item)
    }

    /// Moves to the first key greater than or equal to `key`.
    pub fn seek(&mut self, key: &[u8]) -> Option<Item<'tx>> {
        let item = self
            .entries
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(pair);
        self.settle(item)
    }

    fn advance(&mut self) -> Option<Item<'tx>> {
        if self.exhausted {
            return None;
        }
        match self.position {
            None => self.first(),
            Some(current) => {
                let item = self
                    .entries
                    .range::<[u8], _>((Bound::Excluded(current), Bound::Unbounded))
                    .next()
                    .map(pair);
                self.settle(item)
            }
        }
    }

    fn settle(&mut self, item: Option<Item<'tx>>) -> Option<Item<'tx>> {
        self.position = item.map(|(key, _)| key);
        self.exhausted = item.is_none();
        item
    }
}

impl<'tx> Iterator for Cursor<'tx> {
    type Item = Item<'tx>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance()
    }
}

fn pair<'tx>((key, value): (&'tx Bytes, &'tx Bytes)) -> Item<'tx> {
    (key.as_ref(), value.as_ref())
}
