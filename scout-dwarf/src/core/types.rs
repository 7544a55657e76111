//! Shared types for the index: address keys, unit descriptors, entries.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Address key of a DIE: its byte offset in `.debug_info`, tagged with the
/// container it lives in. Offsets in the supplementary container occupy a
/// disjoint key range so the two spaces never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DieKey(u64);

impl DieKey {
    const AUX_BIT: u64 = 1 << 63;

    pub fn new(offset: u64, aux: bool) -> Self {
        debug_assert!(offset & Self::AUX_BIT == 0);
        DieKey(if aux { offset | Self::AUX_BIT } else { offset })
    }

    pub fn main(offset: u64) -> Self {
        DieKey::new(offset, false)
    }

    pub fn aux(offset: u64) -> Self {
        DieKey::new(offset, true)
    }

    /// Byte offset within the owning container's `.debug_info`.
    pub fn offset(self) -> u64 {
        self.0 & !Self::AUX_BIT
    }

    pub fn is_aux(self) -> bool {
        self.0 & Self::AUX_BIT != 0
    }

    /// Raw tagged value, usable as a map key over one linear key space.
    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        DieKey(raw)
    }
}

impl std::fmt::Display for DieKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_aux() {
            write!(f, "sup+{:#x}", self.offset())
        } else {
            write!(f, "{:#x}", self.offset())
        }
    }
}

/// Index of a unit in the descriptor table for one indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub usize);

/// Per-unit bookkeeping for one indexing run.
///
/// The claim flag is the single source of truth for which worker scans a
/// unit: whichever task wins the compare-and-swap owns the scan, everyone
/// else skips it. Descriptors are rebuilt for every run, so the flags never
/// leak state across runs.
#[derive(Debug)]
pub struct UnitDescriptor {
    id: UnitId,
    /// Offset of the unit header in its container's `.debug_info`.
    offset: u64,
    /// Total unit length including the header.
    length: u64,
    aux: bool,
    is_type_unit: bool,
    version: u16,
    language: OnceLock<gimli::DwLang>,
    claimed: AtomicBool,
    queued: AtomicBool,
    ranges_recorded: AtomicBool,
    scan_passes: AtomicUsize,
}

impl UnitDescriptor {
    pub fn new(id: UnitId, offset: u64, length: u64, aux: bool, is_type_unit: bool, version: u16) -> Self {
        UnitDescriptor {
            id,
            offset,
            length,
            aux,
            is_type_unit,
            version,
            language: OnceLock::new(),
            claimed: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            ranges_recorded: AtomicBool::new(false),
            scan_passes: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_aux(&self) -> bool {
        self.aux
    }

    pub fn is_type_unit(&self) -> bool {
        self.is_type_unit
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    /// Address key of the unit header itself.
    pub fn key(&self) -> DieKey {
        DieKey::new(self.offset, self.aux)
    }

    /// Address key for a DIE at the given unit-relative offset.
    pub fn die_key(&self, unit_offset: u64) -> DieKey {
        DieKey::new(self.offset + unit_offset, self.aux)
    }

    /// Whether `key` falls inside this unit's slice of `.debug_info`.
    pub fn contains_key(&self, key: DieKey) -> bool {
        key.is_aux() == self.aux
            && key.offset() >= self.offset
            && key.offset() < self.offset + self.length
    }

    /// Atomically claim this unit for scanning. Returns true exactly once
    /// per run; the loser of a race must not scan.
    pub fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    pub fn mark_queued(&self) {
        self.queued.store(true, Ordering::Release);
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// One-shot guard for recording the unit's address ranges.
    pub fn try_mark_ranges_recorded(&self) -> bool {
        self.ranges_recorded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_language(&self, lang: gimli::DwLang) {
        let _ = self.language.set(lang);
    }

    pub fn language(&self) -> Option<gimli::DwLang> {
        self.language.get().copied()
    }

    pub fn note_scan_pass(&self) {
        self.scan_passes.fetch_add(1, Ordering::Relaxed);
    }

    /// How many times a full scan ran over this unit. Must be exactly one
    /// after a completed run.
    pub fn scan_passes(&self) -> usize {
        self.scan_passes.load(Ordering::Relaxed)
    }
}

/// Boolean properties of an index entry, kept unpacked for cheap access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryFlags {
    /// Program entry point (`DW_AT_main_subprogram`).
    pub is_main: bool,
    /// Declaration-only DIE, definition lives elsewhere.
    pub is_declaration: bool,
    /// Internal linkage (no `DW_AT_external`).
    pub is_static: bool,
    /// Scoped enumeration; its enumerators nest under the enum name.
    pub is_enum_class: bool,
    /// This entry carries the mangled linkage name, not the source name.
    pub is_linkage: bool,
}

/// Parent relation of an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentLink {
    /// Top-level entry, no enclosing scope.
    None,
    /// Resolved: index of the parent entry in the same table.
    Entry(usize),
    /// Placeholder for a cross-unit or forward reference, resolved in the
    /// deferred pass after all scans finish. Holds the reference target's
    /// address key.
    Deferred(DieKey),
}

/// One record of the name index. Deliberately small: a couple of words plus
/// the shared name string.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub name: Arc<str>,
    /// Address key of the DIE this entry describes.
    pub die: DieKey,
    pub tag: gimli::DwTag,
    pub unit: UnitId,
    pub flags: EntryFlags,
    pub parent: ParentLink,
}

/// Completion level of an indexing run, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexState {
    /// Nothing usable yet.
    Initial,
    /// The program's entry-point name is known; the full index is not.
    MainAvailable,
    /// Index fully built, name table and address maps published.
    Done,
}

/// Summary counters published when a run reaches [`IndexState::Done`].
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexStats {
    pub units: usize,
    pub entries: usize,
    pub deferred_entries: usize,
    pub resolved_parents: usize,
    pub elapsed_ms: u64,
}
