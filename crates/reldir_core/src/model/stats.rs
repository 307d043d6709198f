//! Census of stored objects and relations.

use super::{Assignment, WILDCARD};
use crate::error::DirectoryResult;
use crate::keys::{self, Index, OBJECTS};
use crate::store::PrefixScan;
use reldir_storage::Tx;
use serde::Serialize;
use std::collections::BTreeMap;

/// Counts of stored data per object type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// Per object type, including types only seen on relations.
    pub object_types: BTreeMap<String, ObjectTypeStats>,
}

/// Counts for one object type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTypeStats {
    /// Stored objects of the type.
    pub objects: u64,
    /// Relations whose object side has the type, by relation name.
    pub relations: BTreeMap<String, RelationStats>,
}

/// Counts for one relation of an object type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationStats {
    /// Stored relations.
    pub count: u64,
    /// Break-down by subject type.
    pub subjects: BTreeMap<String, SubjectStats>,
}

/// Counts for one subject type of a relation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    /// Stored relations with this subject type.
    pub count: u64,
    /// Of those, the ones with a subject relation, by subject relation.
    pub subject_relations: BTreeMap<String, u64>,
    /// Of those, the ones with a wildcard subject.
    pub wildcards: u64,
}

impl Stats {
    /// Counts everything in the object bucket and the object-major index.
    ///
    /// # Errors
    ///
    /// `KeyFormat` for a malformed key.
    pub fn compute(tx: &impl Tx) -> DirectoryResult<Self> {
        let mut stats = Self::default();
        for (key, _) in PrefixScan::new(tx, OBJECTS, "") {
            let id = keys::parse_bytes(key, keys::parse_object_key)?;
            stats.entry(&id.object_type).objects += 1;
        }
        for (key, _) in PrefixScan::new(tx, Index::ObjectMajor.path(), "") {
            let rel = Index::ObjectMajor.parse(key)?;
            let relation = stats
                .entry(&rel.object_type)
                .relations
                .entry(rel.relation)
                .or_default();
            relation.count += 1;
            let subject = relation.subjects.entry(rel.subject_type).or_default();
            subject.count += 1;
            if !rel.subject_relation.is_empty() {
                *subject
                    .subject_relations
                    .entry(rel.subject_relation)
                    .or_default() += 1;
            } else if rel.subject_id == WILDCARD {
                subject.wildcards += 1;
            }
        }
        Ok(stats)
    }

    fn entry(&mut self, object_type: &str) -> &mut ObjectTypeStats {
        self.object_types
            .entry(object_type.to_string())
            .or_default()
    }

    /// Total stored objects.
    #[must_use]
    pub fn object_count(&self) -> u64 {
        self.object_types.values().map(|t| t.objects).sum()
    }

    /// Total stored relations.
    #[must_use]
    pub fn relation_count(&self) -> u64 {
        self.object_types.values().map(ObjectTypeStats::relation_count).sum()
    }
}

impl ObjectTypeStats {
    /// Stored relations on objects of this type.
    #[must_use]
    pub fn relation_count(&self) -> u64 {
        self.relations.values().map(|r| r.count).sum()
    }

    /// Whether any object or relation depends on the type.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.objects > 0 || self.relation_count() > 0
    }
}

impl SubjectStats {
    /// Relations without subject relation or wildcard.
    #[must_use]
    pub fn direct(&self) -> u64 {
        let indirect: u64 = self.subject_relations.values().sum();
        self.count.saturating_sub(indirect + self.wildcards)
    }

    /// The assignments in use, with how many relations use each.
    pub fn assignments(&self, subject_type: &str) -> Vec<(Assignment, u64)> {
        let mut used = Vec::new();
        if self.direct() > 0 {
            used.push((Assignment::direct(subject_type), self.direct()));
        }
        if self.wildcards > 0 {
            used.push((Assignment::wildcard(subject_type), self.wildcards));
        }
        for (relation, &count) in &self.subject_relations {
            if count > 0 {
                used.push((Assignment::userset(subject_type, relation), count));
            }
        }
        used
    }
}
