//! Debug-info container loading.
//!
//! A [`DwarfContainer`] owns the bytes backing a `gimli::Dwarf` (a mapped
//! file or raw section buffers) and hands out unit descriptors for the
//! indexing pipeline. An optional supplementary container (DWZ-style shared
//! debug info) can ride along; its units get their own descriptors and a
//! disjoint address-key range.

use gimli::{DebugInfoOffset, EndianSlice, LittleEndian, UnitSectionOffset};
use object::{Object, ObjectSection};
use std::path::Path;
use tracing::{debug, warn};

use crate::core::{DieKey, IndexError, Result, UnitDescriptor, UnitId};

/// Reader type used throughout the crate.
pub type Reader = EndianSlice<'static, LittleEndian>;

/// Raw section bytes, for building a container without an object file.
/// Sections not supplied read as empty.
#[derive(Debug, Default, Clone)]
pub struct SectionBytes {
    pub debug_info: Vec<u8>,
    pub debug_abbrev: Vec<u8>,
    pub debug_str: Vec<u8>,
    pub debug_ranges: Vec<u8>,
    pub debug_rnglists: Vec<u8>,
    pub debug_line: Vec<u8>,
}

enum Backing {
    Mapped {
        _map: memmap2::Mmap,
        /// Decompressed section copies that outlive the load closure.
        _stash: Vec<Box<[u8]>>,
    },
    Sections(Box<SectionBytes>),
}

struct Part {
    dwarf: gimli::Dwarf<Reader>,
    _backing: Backing,
}

/// A loaded debug-info container, optionally paired with a supplementary one.
pub struct DwarfContainer {
    main: Part,
    sup: Option<Part>,
}

impl DwarfContainer {
    /// Map a binary from disk and locate its DWARF sections.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(IndexError::Io)?;
        // SAFETY: the mapping stays alive as long as the container; we never
        // hand out references that outlive it.
        let map = unsafe { memmap2::Mmap::map(&file) }.map_err(IndexError::Io)?;
        let object = object::File::parse(&map[..]).map_err(IndexError::Object)?;

        let mut stash: Vec<Box<[u8]>> = Vec::new();
        let dwarf = gimli::Dwarf::load(|id| -> std::result::Result<Reader, gimli::Error> {
            let data = match object.section_by_name(id.name()) {
                Some(section) => section
                    .uncompressed_data()
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..])),
                None => std::borrow::Cow::Borrowed(&[][..]),
            };
            let slice: &[u8] = match data {
                std::borrow::Cow::Borrowed(b) => b,
                std::borrow::Cow::Owned(v) => {
                    stash.push(v.into_boxed_slice());
                    stash.last().unwrap()
                }
            };
            // SAFETY: `slice` points either into the mapping or into a boxed
            // buffer in `stash`; both live in the Backing next to this Dwarf
            // and are never mutated.
            let slice: &'static [u8] = unsafe { std::mem::transmute(slice) };
            Ok(EndianSlice::new(slice, LittleEndian))
        })?;
        drop(object);

        debug!(path = %path.display(), "loaded debug-info container");
        Ok(DwarfContainer {
            main: Part {
                dwarf,
                _backing: Backing::Mapped { _map: map, _stash: stash },
            },
            sup: None,
        })
    }

    /// Build a container from raw section bytes. Used for in-memory debug
    /// info and by tests that assemble sections by hand.
    pub fn from_sections(sections: SectionBytes) -> Result<Self> {
        Ok(DwarfContainer {
            main: Self::part_from_sections(sections)?,
            sup: None,
        })
    }

    /// Attach a supplementary container from raw section bytes.
    pub fn attach_supplementary(&mut self, sections: SectionBytes) -> Result<()> {
        self.sup = Some(Self::part_from_sections(sections)?);
        Ok(())
    }

    /// Attach a supplementary container mapped from disk.
    pub fn attach_supplementary_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let loaded = DwarfContainer::open(path)?;
        self.sup = Some(loaded.main);
        Ok(())
    }

    fn part_from_sections(sections: SectionBytes) -> Result<Part> {
        let boxed = Box::new(sections);
        let dwarf = gimli::Dwarf::load(|id| -> std::result::Result<Reader, gimli::Error> {
            let bytes: &[u8] = match id {
                gimli::SectionId::DebugInfo => &boxed.debug_info,
                gimli::SectionId::DebugAbbrev => &boxed.debug_abbrev,
                gimli::SectionId::DebugStr => &boxed.debug_str,
                gimli::SectionId::DebugRanges => &boxed.debug_ranges,
                gimli::SectionId::DebugRngLists => &boxed.debug_rnglists,
                gimli::SectionId::DebugLine => &boxed.debug_line,
                _ => &[],
            };
            // SAFETY: the Vec buffers live inside the Box stored in the
            // Backing next to this Dwarf; they are never mutated or dropped
            // before it.
            let bytes: &'static [u8] = unsafe { std::mem::transmute(bytes) };
            Ok(EndianSlice::new(bytes, LittleEndian))
        })?;
        Ok(Part {
            dwarf,
            _backing: Backing::Sections(boxed),
        })
    }

    pub fn dwarf(&self) -> &gimli::Dwarf<Reader> {
        &self.main.dwarf
    }

    pub fn sup_dwarf(&self) -> Option<&gimli::Dwarf<Reader>> {
        self.sup.as_ref().map(|p| &p.dwarf)
    }

    pub fn has_supplementary(&self) -> bool {
        self.sup.is_some()
    }

    /// Enumerate all units, main container first, then supplementary.
    /// Returns fresh descriptors; the atomic flags start cleared.
    pub fn unit_descriptors(&self) -> Result<Vec<UnitDescriptor>> {
        let mut descriptors = Vec::new();
        Self::collect_units(&self.main.dwarf, false, &mut descriptors)?;
        if let Some(sup) = &self.sup {
            Self::collect_units(&sup.dwarf, true, &mut descriptors)?;
        }
        debug!(units = descriptors.len(), "enumerated units");
        Ok(descriptors)
    }

    fn collect_units(
        dwarf: &gimli::Dwarf<Reader>,
        aux: bool,
        out: &mut Vec<UnitDescriptor>,
    ) -> Result<()> {
        let mut iter = dwarf.units();
        while let Some(header) = iter.next()? {
            let offset = match header.offset() {
                UnitSectionOffset::DebugInfoOffset(DebugInfoOffset(o)) => o as u64,
                // DWARF v4 `.debug_types` units live in a separate offset
                // space; we do not index them.
                UnitSectionOffset::DebugTypesOffset(_) => {
                    warn!("skipping .debug_types unit");
                    continue;
                }
            };
            let id = UnitId(out.len());
            out.push(UnitDescriptor::new(
                id,
                offset,
                header.length_including_self() as u64,
                aux,
                matches!(header.type_(), gimli::UnitType::Type { .. }),
                header.version(),
            ));
        }
        Ok(())
    }

    /// Find the descriptor whose slice of `.debug_info` contains `key`.
    pub fn descriptor_for_key<'a>(
        units: &'a [UnitDescriptor],
        key: DieKey,
    ) -> Option<&'a UnitDescriptor> {
        // Descriptors are ordered main-then-aux, ascending by offset within
        // each group, which matches the DieKey tagged ordering.
        let idx = units.partition_point(|u| u.key() <= key);
        if idx == 0 {
            return None;
        }
        let candidate = &units[idx - 1];
        candidate.contains_key(key).then_some(candidate)
    }
}

impl std::fmt::Debug for DwarfContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DwarfContainer")
            .field("has_supplementary", &self.sup.is_some())
            .finish()
    }
}
