//! Bulk export.

use crate::directory::Directory;
use crate::error::{DirectoryError, DirectoryResult};
use crate::keys::{OBJECTS, RELATIONS};
use crate::manifest;
use crate::model::Stats;
use crate::store::ScanIterator;
use crate::types::{Manifest, Object, Relation};
use reldir_codec::Binary;
use serde::Serialize;
use std::ops::{BitOr, BitOrAssign};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Which categories an export emits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExportOptions(u32);

impl ExportOptions {
    /// Nothing.
    pub const NONE: Self = Self(0);
    /// The stored manifest.
    pub const MANIFEST: Self = Self(1);
    /// Every object.
    pub const OBJECTS: Self = Self(1 << 1);
    /// Every relation.
    pub const RELATIONS: Self = Self(1 << 2);
    /// The census.
    pub const STATS: Self = Self(1 << 3);
    /// Manifest, objects and relations.
    pub const DATA: Self = Self(Self::MANIFEST.0 | Self::OBJECTS.0 | Self::RELATIONS.0);

    /// Builds options from raw bits, ignoring unknown ones.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & 0b1111)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ExportOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ExportOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One exported record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportItem {
    /// The manifest; emitted only when one is stored.
    Manifest(Manifest),
    /// An object.
    Object(Object),
    /// A relation.
    Relation(Relation),
    /// The census.
    Stats(Stats),
}

impl Directory {
    /// Emits the requested categories to `sink` in the order manifest,
    /// objects, relations, stats, all from one snapshot. Returns the number
    /// of items emitted.
    ///
    /// # Errors
    ///
    /// `Cancelled`, decoding errors, or the first error of `sink`.
    pub fn export(
        &self,
        options: ExportOptions,
        cancel: &CancellationToken,
        mut sink: impl FnMut(ExportItem) -> DirectoryResult<()>,
    ) -> DirectoryResult<usize> {
        let tx = self.shared.db.begin_read();
        let mut emitted = 0usize;
        let mut emit = |item| {
            if cancel.is_cancelled() {
                return Err(DirectoryError::Cancelled);
            }
            emitted += 1;
            sink(item)
        };

        if options.contains(ExportOptions::MANIFEST) {
            if let Some(manifest) = manifest::get_manifest(&tx)? {
                emit(ExportItem::Manifest(manifest))?;
            }
        }
        if options.contains(ExportOptions::OBJECTS) {
            for entry in ScanIterator::<Object, Binary>::new(&tx, OBJECTS, "", None) {
                let (_, object) = entry?;
                emit(ExportItem::Object(object))?;
            }
        }
        if options.contains(ExportOptions::RELATIONS) {
            for entry in ScanIterator::<Relation, Binary>::new(&tx, RELATIONS, "", None) {
                let (_, relation) = entry?;
                emit(ExportItem::Relation(relation))?;
            }
        }
        if options.contains(ExportOptions::STATS) {
            emit(ExportItem::Stats(Stats::compute(&tx)?))?;
        }

        info!(options = options.bits(), items = emitted, "export finished");
        Ok(emitted)
    }
}
