//! Per-unit DIE scanner.
//!
//! One pass over a unit's raw DIE stream produces the unit's slice of the
//! index: entries for every nameable node, code ranges for the address map,
//! and subtree ranges for the deferred parent-resolution pass. The walk
//! reads abbreviations and attributes directly via [`gimli::EntriesRaw`],
//! never materializing a tree, and skips uninteresting subtrees in O(1)
//! through sanity-checked `DW_AT_sibling` links.

use std::sync::Arc;
use tracing::trace;

use crate::container::Reader;
use crate::core::{DieKey, EntryFlags, IndexEntry, ParentLink, Result, UnitDescriptor, UnitId};
use crate::index::IndexShard;
use crate::pipeline::ScanContext;

/// Reference chains longer than this are treated as malformed.
const MAX_REF_HOPS: usize = 16;

/// Scan a unit the pipeline claimed. The caller must hold the claim.
pub(crate) fn scan_unit(cx: &ScanContext, unit: UnitId, shard: &mut IndexShard) -> Result<()> {
    scan_unit_scoped(cx, cx.unit(unit), shard, None)
}

/// Scan `desc` with its top-level children parented to `scope` (the scope of
/// the importing site for inline-scanned imported units, `None` otherwise).
fn scan_unit_scoped(
    cx: &ScanContext,
    desc: &UnitDescriptor,
    shard: &mut IndexShard,
    scope: Option<usize>,
) -> Result<()> {
    desc.note_scan_pass();
    let loaded = cx.cache().ensure_loaded(desc)?;
    let dwarf = cx.dwarf_for(desc)?;
    let unit = &loaded.unit;

    let mut iter = unit.entries_raw(None)?;
    let offset = iter.next_offset();
    let Some(abbrev) = iter.read_abbreviation()? else {
        return Ok(());
    };
    let root = read_node(dwarf, unit, desc, &mut iter, abbrev, offset)?;

    if let Some(lang) = root.language {
        desc.set_language(lang);
    }
    if desc.try_mark_ranges_recorded() {
        record_unit_bounds(dwarf, unit, desc, shard);
    }

    trace!(unit = %desc.key(), scoped = scope.is_some(), "scanning unit");
    if root.has_children {
        let scan = UnitScan {
            cx,
            desc,
            dwarf,
            unit,
            deep: language_needs_deep_scan(desc.language()),
        };
        scan.scan_level(&mut iter, shard, scope)?;
    }
    Ok(())
}

/// Whether a language nests indexable definitions arbitrarily deep inside
/// other definitions, forcing a full-expansion walk.
fn language_needs_deep_scan(lang: Option<gimli::DwLang>) -> bool {
    matches!(
        lang,
        Some(
            gimli::DW_LANG_Ada83
                | gimli::DW_LANG_Ada95
                | gimli::DW_LANG_Ada2005
                | gimli::DW_LANG_Ada2012
                | gimli::DW_LANG_Fortran77
                | gimli::DW_LANG_Fortran90
                | gimli::DW_LANG_Fortran95
                | gimli::DW_LANG_Fortran03
                | gimli::DW_LANG_Fortran08
                | gimli::DW_LANG_Fortran18
        )
    )
}

/// Record the unit's code bounds in the address map. Failures here are
/// complaints, not scan failures.
fn record_unit_bounds(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    desc: &UnitDescriptor,
    shard: &mut IndexShard,
) {
    match dwarf.unit_ranges(unit) {
        Ok(mut ranges) => loop {
            match ranges.next() {
                Ok(Some(range)) => {
                    shard.record_unit_range(range.begin..range.end, desc.id());
                }
                Ok(None) => break,
                Err(e) => {
                    shard.complain(format!("bad range list in unit {}: {e}", desc.key()));
                    break;
                }
            }
        },
        Err(e) => shard.complain(format!("bad ranges for unit {}: {e}", desc.key())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Function,
    Variable,
    Type,
    Aggregate,
    Enum,
    Enumerator,
    Namespace,
    ImportedUnit,
    Other,
}

fn classify(tag: gimli::DwTag) -> NodeKind {
    match tag {
        gimli::DW_TAG_subprogram
        | gimli::DW_TAG_entry_point
        | gimli::DW_TAG_inlined_subroutine => NodeKind::Function,
        gimli::DW_TAG_variable | gimli::DW_TAG_constant => NodeKind::Variable,
        gimli::DW_TAG_base_type | gimli::DW_TAG_typedef | gimli::DW_TAG_unspecified_type => {
            NodeKind::Type
        }
        gimli::DW_TAG_structure_type
        | gimli::DW_TAG_class_type
        | gimli::DW_TAG_union_type
        | gimli::DW_TAG_interface_type => NodeKind::Aggregate,
        gimli::DW_TAG_enumeration_type => NodeKind::Enum,
        gimli::DW_TAG_enumerator => NodeKind::Enumerator,
        gimli::DW_TAG_namespace | gimli::DW_TAG_module => NodeKind::Namespace,
        gimli::DW_TAG_imported_unit => NodeKind::ImportedUnit,
        _ => NodeKind::Other,
    }
}

#[derive(Debug, Clone, Copy)]
enum HighPc {
    Addr(u64),
    Size(u64),
}

/// The narrow attribute slice the scanner cares about, decoded in one pass
/// over a DIE's abbreviation.
struct RawNode {
    offset: gimli::UnitOffset<usize>,
    tag: gimli::DwTag,
    has_children: bool,
    name: Option<Arc<str>>,
    linkage_name: Option<Arc<str>>,
    low_pc: Option<u64>,
    high_pc: Option<HighPc>,
    ranges: Option<gimli::RawRangeListsOffset<usize>>,
    language: Option<gimli::DwLang>,
    declaration: bool,
    external: Option<bool>,
    main_subprogram: bool,
    enum_class: bool,
    /// `DW_AT_specification` / `DW_AT_abstract_origin` / `DW_AT_extension`.
    reference: Option<DieKey>,
    sibling: Option<gimli::UnitOffset<usize>>,
    import: Option<DieKey>,
}

fn read_node(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    desc: &UnitDescriptor,
    iter: &mut gimli::EntriesRaw<'_, '_, Reader>,
    abbrev: &gimli::Abbreviation,
    offset: gimli::UnitOffset<usize>,
) -> Result<RawNode> {
    let mut node = RawNode {
        offset,
        tag: abbrev.tag(),
        has_children: abbrev.has_children(),
        name: None,
        linkage_name: None,
        low_pc: None,
        high_pc: None,
        ranges: None,
        language: None,
        declaration: false,
        external: None,
        main_subprogram: false,
        enum_class: false,
        reference: None,
        sibling: None,
        import: None,
    };
    for spec in abbrev.attributes() {
        let attr = iter.read_attribute(*spec)?;
        match attr.name() {
            gimli::DW_AT_name => node.name = attr_to_string(dwarf, unit, attr.value()),
            gimli::DW_AT_linkage_name | gimli::DW_AT_MIPS_linkage_name => {
                node.linkage_name = attr_to_string(dwarf, unit, attr.value())
            }
            gimli::DW_AT_low_pc => {
                if let gimli::AttributeValue::Addr(a) = attr.value() {
                    node.low_pc = Some(a);
                }
            }
            gimli::DW_AT_high_pc => match attr.value() {
                gimli::AttributeValue::Addr(a) => node.high_pc = Some(HighPc::Addr(a)),
                gimli::AttributeValue::Udata(size) => node.high_pc = Some(HighPc::Size(size)),
                _ => {}
            },
            gimli::DW_AT_ranges => {
                if let gimli::AttributeValue::RangeListsRef(r) = attr.value() {
                    node.ranges = Some(r);
                }
            }
            gimli::DW_AT_language => {
                if let gimli::AttributeValue::Language(lang) = attr.value() {
                    node.language = Some(lang);
                }
            }
            gimli::DW_AT_declaration => node.declaration = attr_flag(attr.value()),
            gimli::DW_AT_external => node.external = Some(attr_flag(attr.value())),
            gimli::DW_AT_main_subprogram => node.main_subprogram = attr_flag(attr.value()),
            gimli::DW_AT_enum_class => node.enum_class = attr_flag(attr.value()),
            gimli::DW_AT_specification | gimli::DW_AT_abstract_origin | gimli::DW_AT_extension => {
                node.reference = reference_key(desc, attr.value())
            }
            gimli::DW_AT_sibling => {
                if let gimli::AttributeValue::UnitRef(o) = attr.value() {
                    node.sibling = Some(o);
                }
            }
            gimli::DW_AT_import => node.import = reference_key(desc, attr.value()),
            _ => {}
        }
    }
    Ok(node)
}

fn attr_flag(value: gimli::AttributeValue<Reader>) -> bool {
    matches!(value, gimli::AttributeValue::Flag(true))
}

/// Decode a name-bearing attribute. Unnamable sentinels read as no name.
fn attr_to_string(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    value: gimli::AttributeValue<Reader>,
) -> Option<Arc<str>> {
    let bytes = dwarf.attr_string(unit, value).ok()?;
    let s = bytes.to_string_lossy();
    if s.is_empty() || s == "::" {
        return None;
    }
    Some(Arc::from(s.as_ref()))
}

/// Translate a reference-form attribute into an address key, honoring the
/// container the referencing unit lives in.
fn reference_key(desc: &UnitDescriptor, value: gimli::AttributeValue<Reader>) -> Option<DieKey> {
    match value {
        gimli::AttributeValue::UnitRef(off) => Some(desc.die_key(off.0 as u64)),
        gimli::AttributeValue::DebugInfoRef(o) => Some(DieKey::new(o.0 as u64, desc.is_aux())),
        gimli::AttributeValue::DebugInfoRefSup(o) => Some(DieKey::aux(o.0 as u64)),
        _ => None,
    }
}

#[derive(Default)]
struct NodeNames {
    name: Option<Arc<str>>,
    linkage: Option<Arc<str>>,
}

struct UnitScan<'a> {
    cx: &'a ScanContext,
    desc: &'a UnitDescriptor,
    dwarf: &'a gimli::Dwarf<Reader>,
    unit: &'a gimli::Unit<Reader>,
    /// Full-expansion walk: descend into functions and unrecognized nodes.
    deep: bool,
}

impl<'a> UnitScan<'a> {
    /// Scan one nesting level until its null terminator (or stream end).
    fn scan_level(
        &self,
        iter: &mut gimli::EntriesRaw<'a, 'a, Reader>,
        shard: &mut IndexShard,
        scope: Option<usize>,
    ) -> Result<()> {
        loop {
            if iter.is_empty() {
                return Ok(());
            }
            let offset = iter.next_offset();
            let Some(abbrev) = iter.read_abbreviation()? else {
                return Ok(());
            };
            let node = read_node(self.dwarf, self.unit, self.desc, iter, abbrev, offset)?;
            self.process_node(iter, shard, scope, node)?;
        }
    }

    fn process_node(
        &self,
        iter: &mut gimli::EntriesRaw<'a, 'a, Reader>,
        shard: &mut IndexShard,
        scope: Option<usize>,
        node: RawNode,
    ) -> Result<()> {
        let kind = classify(node.tag);

        if kind == NodeKind::ImportedUnit {
            self.handle_import(shard, scope, &node)?;
            if node.has_children {
                self.skip_children(iter, shard, &node)?;
            }
            return Ok(());
        }

        if kind == NodeKind::Other {
            if node.has_children {
                if self.deep {
                    // Transparent under full expansion: children keep the
                    // current scope.
                    self.scan_level(iter, shard, scope)?;
                } else {
                    self.skip_children(iter, shard, &node)?;
                }
            }
            return Ok(());
        }

        let mut names = NodeNames {
            name: node.name.clone(),
            linkage: node.linkage_name.clone(),
        };
        let mut deferred_target = None;
        if names.name.is_none() && names.linkage.is_none() {
            if kind == NodeKind::Namespace {
                names.name = Some(Arc::from("(anonymous namespace)"));
            } else if let Some(target) = node.reference {
                self.resolve_reference_names(shard, target, &mut names)?;
                // The local scope wins when present; only a scopeless node
                // inherits its parent from the reference target, resolved
                // later against the subtree map.
                if scope.is_none() && (names.name.is_some() || names.linkage.is_some()) {
                    deferred_target = Some(target);
                }
            }
        }

        let die = self.desc.die_key(node.offset.0 as u64);
        let parent = match (scope, deferred_target) {
            (Some(s), _) => ParentLink::Entry(s),
            (None, Some(target)) => ParentLink::Deferred(target),
            (None, None) => ParentLink::None,
        };

        let mut primary = None;
        if names.name.is_some() || names.linkage.is_some() {
            let base = EntryFlags {
                is_main: false,
                is_declaration: node.declaration,
                is_static: matches!(kind, NodeKind::Function | NodeKind::Variable)
                    && node.external != Some(true),
                is_enum_class: node.enum_class,
                is_linkage: false,
            };
            if let Some(name) = names.name.clone() {
                let mut flags = base;
                flags.is_main = node.main_subprogram;
                primary = Some(shard.push_entry(IndexEntry {
                    name,
                    die,
                    tag: node.tag,
                    unit: self.desc.id(),
                    flags,
                    parent,
                }));
            }
            if let Some(linkage) = names.linkage.clone() {
                if names.name.as_deref() != Some(linkage.as_ref()) {
                    let mut flags = base;
                    flags.is_linkage = true;
                    // A present source name outranks the mangled twin.
                    flags.is_main = node.main_subprogram && names.name.is_none();
                    let idx = shard.push_entry(IndexEntry {
                        name: linkage,
                        die,
                        tag: node.tag,
                        unit: self.desc.id(),
                        flags,
                        parent,
                    });
                    primary.get_or_insert(idx);
                }
            }
        }

        if kind == NodeKind::Function {
            self.record_code_ranges(shard, &node);
        }

        if node.has_children {
            let descend = match kind {
                NodeKind::Namespace | NodeKind::Aggregate | NodeKind::Enum => true,
                _ => self.deep,
            };
            if descend {
                let child_scope = match kind {
                    NodeKind::Namespace | NodeKind::Aggregate | NodeKind::Function => {
                        primary.or(scope)
                    }
                    // Plain enums spill their enumerators into the outer
                    // scope; scoped enums nest them.
                    NodeKind::Enum if node.enum_class => primary.or(scope),
                    _ => scope,
                };
                self.scan_level(iter, shard, child_scope)?;
            } else {
                self.skip_children(iter, shard, &node)?;
            }
            if let Some(primary) = primary {
                let end = self.desc.die_key(iter.next_offset().0 as u64);
                shard.record_die_range(
                    DieKey::new(die.offset() + 1, die.is_aux()),
                    end,
                    primary,
                );
            }
        }
        Ok(())
    }

    /// Skip the current node's subtree. Prefers the `DW_AT_sibling` shortcut
    /// when the link passes sanity checks, falling back to a linear walk
    /// with a complaint when it does not.
    fn skip_children(
        &self,
        iter: &mut gimli::EntriesRaw<'a, 'a, Reader>,
        shard: &mut IndexShard,
        node: &RawNode,
    ) -> Result<()> {
        if let Some(sibling) = node.sibling {
            if sibling.0 > node.offset.0 && (sibling.0 as u64) < self.desc.length() {
                *iter = self.unit.entries_raw(Some(sibling))?;
                return Ok(());
            }
            shard.complain(format!(
                "ignoring bad DW_AT_sibling {:#x} at {}",
                sibling.0,
                self.desc.die_key(node.offset.0 as u64)
            ));
        }
        let mut depth = 1usize;
        while depth > 0 {
            if iter.is_empty() {
                shard.complain(format!("truncated DIE tree in unit {}", self.desc.key()));
                return Ok(());
            }
            match iter.read_abbreviation()? {
                None => depth -= 1,
                Some(abbrev) => {
                    for spec in abbrev.attributes() {
                        iter.read_attribute(*spec)?;
                    }
                    if abbrev.has_children() {
                        depth += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Chase a specification / abstract-origin / extension chain for names,
    /// loading target units through the cache on demand.
    fn resolve_reference_names(
        &self,
        shard: &mut IndexShard,
        start: DieKey,
        names: &mut NodeNames,
    ) -> Result<()> {
        let mut key = start;
        for _ in 0..MAX_REF_HOPS {
            let Some(target) = self.cx.unit_containing(key) else {
                shard.complain(format!("reference {key} points outside every unit"));
                return Ok(());
            };
            let tdesc = self.cx.unit(target);
            shard.note_dependency(self.desc.id(), tdesc.id());
            let loaded = self.cx.cache().ensure_loaded(tdesc)?;
            let tdwarf = self.cx.dwarf_for(tdesc)?;
            let unit_offset = gimli::UnitOffset((key.offset() - tdesc.offset()) as usize);
            let die = match loaded
                .unit
                .header
                .entry(&loaded.unit.abbreviations, unit_offset)
            {
                Ok(die) => die,
                Err(e) => {
                    shard.complain(format!("reference {key} is not a DIE: {e}"));
                    return Ok(());
                }
            };

            let mut next = None;
            let mut attrs = die.attrs();
            while let Some(attr) = attrs.next()? {
                match attr.name() {
                    gimli::DW_AT_name => {
                        if names.name.is_none() {
                            names.name = attr_to_string(tdwarf, &loaded.unit, attr.value());
                        }
                    }
                    gimli::DW_AT_linkage_name | gimli::DW_AT_MIPS_linkage_name => {
                        if names.linkage.is_none() {
                            names.linkage = attr_to_string(tdwarf, &loaded.unit, attr.value());
                        }
                    }
                    gimli::DW_AT_specification
                    | gimli::DW_AT_abstract_origin
                    | gimli::DW_AT_extension => {
                        next = reference_key(tdesc, attr.value());
                    }
                    _ => {}
                }
            }
            if names.name.is_some() {
                return Ok(());
            }
            match next {
                // A self-reference is terminal, not worth another hop.
                Some(n) if n != key => key = n,
                _ => return Ok(()),
            }
        }
        shard.complain(format!("reference chain too long starting at {start}"));
        Ok(())
    }

    /// A `DW_TAG_imported_unit` pulls another unit's top level into the
    /// current scope. Whoever wins the claim scans the target inline; the
    /// loser just records the dependency edge.
    fn handle_import(
        &self,
        shard: &mut IndexShard,
        scope: Option<usize>,
        node: &RawNode,
    ) -> Result<()> {
        let Some(target_key) = node.import else {
            shard.complain(format!(
                "DW_TAG_imported_unit without usable DW_AT_import at {}",
                self.desc.die_key(node.offset.0 as u64)
            ));
            return Ok(());
        };
        let Some(target) = self.cx.unit_containing(target_key) else {
            shard.complain(format!("import {target_key} points outside every unit"));
            return Ok(());
        };
        if target == self.desc.id() {
            return Ok(());
        }
        shard.note_dependency(self.desc.id(), target);
        let tdesc = self.cx.unit(target);
        if tdesc.try_claim() {
            scan_unit_scoped(self.cx, tdesc, shard, scope)?;
        }
        Ok(())
    }

    fn record_code_ranges(&self, shard: &mut IndexShard, node: &RawNode) {
        if let (Some(low), Some(high)) = (node.low_pc, node.high_pc) {
            let end = match high {
                HighPc::Addr(a) => Some(a),
                HighPc::Size(size) => low.checked_add(size),
            };
            match end {
                Some(end) => shard.record_unit_range(low..end, self.desc.id()),
                None => shard.complain(format!(
                    "DW_AT_high_pc overflows the address space at {}",
                    self.desc.die_key(node.offset.0 as u64)
                )),
            }
        }
        if let Some(raw) = node.ranges {
            let offset = self.dwarf.ranges_offset_from_raw(self.unit, raw);
            match self.dwarf.ranges(self.unit, offset) {
                Ok(mut ranges) => loop {
                    match ranges.next() {
                        Ok(Some(range)) => {
                            shard.record_unit_range(range.begin..range.end, self.desc.id())
                        }
                        Ok(None) => break,
                        Err(e) => {
                            shard.complain(format!(
                                "bad range list at {}: {e}",
                                self.desc.die_key(node.offset.0 as u64)
                            ));
                            break;
                        }
                    }
                },
                Err(e) => shard.complain(format!(
                    "unreadable range list at {}: {e}",
                    self.desc.die_key(node.offset.0 as u64)
                )),
            }
        }
    }
}
