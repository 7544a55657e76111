//! Per-worker index shard.
//!
//! Each scanning task appends into its own shard with no synchronization;
//! shards are concatenated into a [`MergedIndex`](super::MergedIndex) after
//! all workers join. Parent links inside a shard use shard-local entry
//! indices and are rebased during the merge.

use std::ops::Range;

use crate::core::{DieKey, IndexEntry, ParentLink, UnitId};

#[derive(Debug, Default)]
pub struct IndexShard {
    pub entries: Vec<IndexEntry>,
    /// Code address ranges attributed to a unit.
    pub unit_ranges: Vec<(Range<u64>, UnitId)>,
    /// DIE-subtree ranges in address-key space, mapping to the shard-local
    /// index of the owning entry. Covers `[die + 1, subtree_end)` so a DIE
    /// never encloses itself.
    pub die_ranges: Vec<(Range<u64>, usize)>,
    /// Shard-local indices of entries whose parent is still a placeholder.
    pub deferred: Vec<usize>,
    /// Cross-unit edges observed while chasing references or imports.
    pub dependencies: Vec<(UnitId, UnitId)>,
    /// Malformed-input notes, deduplicated at merge.
    pub complaints: Vec<String>,
}

impl IndexShard {
    pub fn new() -> Self {
        IndexShard::default()
    }

    pub fn push_entry(&mut self, entry: IndexEntry) -> usize {
        let idx = self.entries.len();
        if let ParentLink::Deferred(_) = entry.parent {
            self.deferred.push(idx);
        }
        self.entries.push(entry);
        idx
    }

    pub fn record_unit_range(&mut self, range: Range<u64>, unit: UnitId) {
        if range.start < range.end {
            self.unit_ranges.push((range, unit));
        }
    }

    pub fn record_die_range(&mut self, start: DieKey, end: DieKey, entry: usize) {
        debug_assert_eq!(start.is_aux(), end.is_aux());
        if start.raw() < end.raw() {
            self.die_ranges.push((start.raw()..end.raw(), entry));
        }
    }

    pub fn note_dependency(&mut self, from: UnitId, to: UnitId) {
        if from != to {
            self.dependencies.push((from, to));
        }
    }

    pub fn complain(&mut self, message: impl Into<String>) {
        self.complaints.push(message.into());
    }
}
