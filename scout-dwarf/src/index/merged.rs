//! The merged, queryable index built from worker shards.

use rangemap::RangeMap;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::shard::IndexShard;
use crate::core::{DieKey, IndexEntry, ParentLink, UnitId};

/// Lookup mode for name queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameMatch {
    Exact,
    /// Prefix match, for interactive completion.
    Completion,
}

#[derive(Debug, Default)]
pub struct MergedIndex {
    entries: Vec<IndexEntry>,
    /// Entry indices sorted by name; built last, after the deferred pass.
    name_table: Vec<u32>,
    /// Code address -> owning unit.
    unit_map: RangeMap<u64, UnitId>,
    /// DIE address-key -> innermost enclosing entry.
    die_map: RangeMap<u64, u32>,
    main_entry: Option<usize>,
    dependencies: Vec<(UnitId, UnitId)>,
    deferred: Vec<usize>,
    resolved_parents: usize,
}

impl MergedIndex {
    /// Concatenate worker shards, rebasing shard-local parent links and
    /// range values to global entry indices. Returns the index plus the
    /// deduplicated complaint list.
    pub fn from_shards(shards: Vec<IndexShard>) -> (Self, Vec<String>) {
        let total: usize = shards.iter().map(|s| s.entries.len()).sum();
        let mut merged = MergedIndex {
            entries: Vec::with_capacity(total),
            ..MergedIndex::default()
        };
        let mut die_ranges: Vec<(std::ops::Range<u64>, u32)> = Vec::new();
        let mut complaints = Vec::new();
        let mut seen = HashSet::new();

        for shard in shards {
            let base = merged.entries.len();
            for mut entry in shard.entries {
                if let ParentLink::Entry(local) = entry.parent {
                    entry.parent = ParentLink::Entry(local + base);
                }
                merged.entries.push(entry);
            }
            merged
                .deferred
                .extend(shard.deferred.into_iter().map(|i| i + base));
            for (range, unit) in shard.unit_ranges {
                merged.unit_map.insert(range, unit);
            }
            for (range, local) in shard.die_ranges {
                die_ranges.push((range, (local + base) as u32));
            }
            merged.dependencies.extend(shard.dependencies);
            for complaint in shard.complaints {
                if seen.insert(complaint.clone()) {
                    complaints.push(complaint);
                }
            }
        }

        // Outer subtrees start earlier than the subtrees they contain, so
        // inserting in ascending start order leaves the innermost entry
        // winning every overlap.
        die_ranges.sort_by_key(|(range, _)| range.start);
        for (range, entry) in die_ranges {
            merged.die_map.insert(range, entry);
        }

        merged.main_entry = merged.pick_main_entry();
        debug!(
            entries = merged.entries.len(),
            deferred = merged.deferred.len(),
            "merged index shards"
        );
        (merged, complaints)
    }

    /// Entries with a source name outrank linkage-name twins for the main
    /// designation.
    fn pick_main_entry(&self) -> Option<usize> {
        let mut fallback = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            if !entry.flags.is_main {
                continue;
            }
            if !entry.flags.is_linkage {
                return Some(idx);
            }
            fallback.get_or_insert(idx);
        }
        fallback
    }

    /// Replace deferred parent placeholders with resolved entry indices by
    /// looking the target key up in the DIE-range map. Runs single-threaded
    /// after all scans have joined. Placeholders whose target falls outside
    /// every recorded subtree degrade to no-parent.
    pub fn resolve_deferred(&mut self) -> usize {
        let mut resolved = 0;
        for idx in std::mem::take(&mut self.deferred) {
            let ParentLink::Deferred(key) = self.entries[idx].parent else {
                continue;
            };
            match self.die_map.get(&key.raw()).copied() {
                Some(parent) if parent as usize != idx => {
                    self.entries[idx].parent = ParentLink::Entry(parent as usize);
                    resolved += 1;
                }
                _ => {
                    warn!(target = %key, "deferred parent target not in any indexed scope");
                    self.entries[idx].parent = ParentLink::None;
                }
            }
        }
        self.resolved_parents = resolved;
        resolved
    }

    /// Build the sorted name table. Must run after [`resolve_deferred`];
    /// lookups are meaningless before this.
    pub fn build_name_table(&mut self) {
        self.name_table = (0..self.entries.len() as u32).collect();
        let entries = &self.entries;
        self.name_table.sort_unstable_by(|&a, &b| {
            let ea = &entries[a as usize];
            let eb = &entries[b as usize];
            ea.name
                .as_ref()
                .cmp(eb.name.as_ref())
                .then(ea.die.raw().cmp(&eb.die.raw()))
        });
    }

    /// Look up entries by name. Completion mode returns every entry whose
    /// name starts with `name`, bounded by binary search on both sides.
    pub fn find_by_name(&self, name: &str, mode: NameMatch) -> Vec<&IndexEntry> {
        let lower = self
            .name_table
            .partition_point(|&i| self.entries[i as usize].name.as_ref() < name);
        let upper = self.name_table.partition_point(|&i| {
            let n = self.entries[i as usize].name.as_ref();
            match mode {
                NameMatch::Exact => n <= name,
                NameMatch::Completion => n < name || n.starts_with(name),
            }
        });
        self.name_table[lower..upper]
            .iter()
            .map(|&i| &self.entries[i as usize])
            .collect()
    }

    pub fn unit_for_address(&self, address: u64) -> Option<UnitId> {
        self.unit_map.get(&address).copied()
    }

    /// Innermost indexed entry whose DIE subtree contains `key`.
    pub fn entry_enclosing_key(&self, key: DieKey) -> Option<usize> {
        self.die_map.get(&key.raw()).map(|&i| i as usize)
    }

    pub fn entry(&self, idx: usize) -> &IndexEntry {
        &self.entries[idx]
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn main_entry(&self) -> Option<&IndexEntry> {
        self.main_entry.map(|i| &self.entries[i])
    }

    pub fn dependencies(&self) -> &[(UnitId, UnitId)] {
        &self.dependencies
    }

    pub fn resolved_parents(&self) -> usize {
        self.resolved_parents
    }

    /// Placeholders still queued for the deferred pass.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// True if any entry still carries a deferred placeholder. Must be
    /// false once a run completes.
    pub fn has_dangling_deferred(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.parent, ParentLink::Deferred(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntryFlags;
    use std::sync::Arc;

    fn entry(name: &str, die: u64) -> IndexEntry {
        IndexEntry {
            name: Arc::from(name),
            die: DieKey::main(die),
            tag: gimli::DW_TAG_variable,
            unit: UnitId(0),
            flags: EntryFlags::default(),
            parent: ParentLink::None,
        }
    }

    fn merged_with(names: &[(&str, u64)]) -> MergedIndex {
        let mut shard = IndexShard::new();
        for &(name, die) in names {
            shard.push_entry(entry(name, die));
        }
        let (mut merged, _) = MergedIndex::from_shards(vec![shard]);
        merged.build_name_table();
        merged
    }

    #[test]
    fn exact_lookup_returns_all_duplicates() {
        let merged = merged_with(&[("dup", 10), ("dup", 20), ("other", 30)]);
        let hits = merged.find_by_name("dup", NameMatch::Exact);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|e| e.name.as_ref() == "dup"));
    }

    #[test]
    fn completion_stops_at_prefix_upper_bound() {
        // "fuo" is the exact successor boundary of the "fun" prefix block.
        let merged = merged_with(&[("function", 10), ("fuo", 20), ("other", 30)]);
        let hits = merged.find_by_name("fun", NameMatch::Completion);
        let names: Vec<_> = hits.iter().map(|e| e.name.as_ref()).collect();
        assert_eq!(names, ["function"]);

        let hits = merged.find_by_name("fu", NameMatch::Completion);
        let names: Vec<_> = hits.iter().map(|e| e.name.as_ref()).collect();
        assert_eq!(names, ["function", "fuo"]);
    }

    #[test]
    fn completion_of_empty_prefix_matches_everything() {
        let merged = merged_with(&[("a", 10), ("b", 20)]);
        assert_eq!(merged.find_by_name("", NameMatch::Completion).len(), 2);
        assert!(merged.find_by_name("", NameMatch::Exact).is_empty());
    }

    #[test]
    fn merge_rebases_parent_links_across_shards() {
        let mut first = IndexShard::new();
        first.push_entry(entry("pad", 5));

        let mut second = IndexShard::new();
        let parent = second.push_entry(entry("scope", 100));
        let mut child = entry("member", 110);
        child.parent = ParentLink::Entry(parent);
        second.push_entry(child);

        let (merged, _) = MergedIndex::from_shards(vec![first, second]);
        let member = merged
            .entries()
            .iter()
            .find(|e| e.name.as_ref() == "member")
            .unwrap();
        let ParentLink::Entry(p) = member.parent else {
            panic!("parent not rebased");
        };
        assert_eq!(merged.entry(p).name.as_ref(), "scope");
    }

    #[test]
    fn die_map_prefers_innermost_scope() {
        let mut shard = IndexShard::new();
        let outer = shard.push_entry(entry("outer", 100));
        let inner = shard.push_entry(entry("inner", 110));
        shard.record_die_range(DieKey::main(101), DieKey::main(200), outer);
        shard.record_die_range(DieKey::main(111), DieKey::main(150), inner);

        let (merged, _) = MergedIndex::from_shards(vec![shard]);
        assert_eq!(merged.entry_enclosing_key(DieKey::main(120)), Some(inner));
        assert_eq!(merged.entry_enclosing_key(DieKey::main(160)), Some(outer));
        assert_eq!(merged.entry_enclosing_key(DieKey::main(300)), None);
    }

    #[test]
    fn deferred_placeholder_degrades_when_target_unknown() {
        let mut shard = IndexShard::new();
        let mut orphan = entry("orphan", 50);
        orphan.parent = ParentLink::Deferred(DieKey::main(9999));
        shard.push_entry(orphan);

        let (mut merged, _) = MergedIndex::from_shards(vec![shard]);
        assert_eq!(merged.resolve_deferred(), 0);
        assert!(!merged.has_dangling_deferred());
        assert_eq!(merged.entry(0).parent, ParentLink::None);
    }
}
