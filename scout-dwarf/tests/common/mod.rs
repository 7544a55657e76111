//! Hand-assembled DWARF v4 sections for hermetic tests.
//!
//! All units share one abbreviation table at offset 0. Offsets are exposed
//! through [`DwarfBuilder::here`] so tests can wire up reference-form
//! attributes, with fixups for forward references.

#![allow(dead_code)]

use scout_dwarf::SectionBytes;

/// Position of a 4-byte reference payload awaiting its target offset.
#[derive(Debug, Clone, Copy)]
pub struct Fixup(usize);

#[derive(Debug, Clone, Copy)]
pub enum AttrValue {
    Str(&'static str),
    /// Inline string from raw bytes, NUL appended. Need not be valid UTF-8.
    StrBytes(&'static [u8]),
    Data1(u8),
    Data8(u64),
    Addr(u64),
    Flag(bool),
    FlagPresent,
    /// Unit-relative 4-byte reference.
    Ref4(u32),
    /// Section-absolute 4-byte reference (`DW_FORM_ref_addr` or
    /// `DW_FORM_GNU_ref_alt`).
    RefAddr(u32),
    /// Placeholder reference payload, patched later via the returned fixup.
    Patch,
}

#[derive(Default)]
pub struct DwarfBuilder {
    abbrev: Vec<u8>,
    info: Vec<u8>,
    abbrev_next: u64,
    unit_start: Option<usize>,
}

fn uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

impl DwarfBuilder {
    pub fn new() -> Self {
        DwarfBuilder {
            abbrev_next: 1,
            ..DwarfBuilder::default()
        }
    }

    /// Declare an abbreviation, returning its code.
    pub fn abbrev(
        &mut self,
        tag: gimli::DwTag,
        children: bool,
        attrs: &[(gimli::DwAt, gimli::DwForm)],
    ) -> u64 {
        let code = self.abbrev_next;
        self.abbrev_next += 1;
        uleb(&mut self.abbrev, code);
        uleb(&mut self.abbrev, tag.0 as u64);
        self.abbrev.push(children as u8);
        for (at, form) in attrs {
            uleb(&mut self.abbrev, at.0 as u64);
            uleb(&mut self.abbrev, form.0 as u64);
        }
        uleb(&mut self.abbrev, 0);
        uleb(&mut self.abbrev, 0);
        code
    }

    /// Start a DWARF32 v4 unit (8-byte addresses, abbrev table at 0).
    pub fn begin_unit(&mut self) {
        assert!(self.unit_start.is_none(), "unit already open");
        self.unit_start = Some(self.info.len());
        self.info.extend_from_slice(&0u32.to_le_bytes()); // length, patched
        self.info.extend_from_slice(&4u16.to_le_bytes()); // version
        self.info.extend_from_slice(&0u32.to_le_bytes()); // abbrev offset
        self.info.push(8); // address size
    }

    pub fn end_unit(&mut self) {
        let start = self.unit_start.take().expect("no open unit");
        let length = (self.info.len() - start - 4) as u32;
        self.info[start..start + 4].copy_from_slice(&length.to_le_bytes());
    }

    /// Section offset of the next DIE.
    pub fn here(&self) -> u64 {
        self.info.len() as u64
    }

    /// Unit-relative offset of the next DIE.
    pub fn here_rel(&self) -> u32 {
        (self.info.len() - self.unit_start.expect("no open unit")) as u32
    }

    /// Emit a DIE. Returns one fixup per [`AttrValue::Patch`] payload, in
    /// attribute order.
    pub fn die(&mut self, code: u64, values: &[AttrValue]) -> Vec<Fixup> {
        let mut fixups = Vec::new();
        uleb(&mut self.info, code);
        for value in values {
            match *value {
                AttrValue::Str(s) => {
                    self.info.extend_from_slice(s.as_bytes());
                    self.info.push(0);
                }
                AttrValue::StrBytes(b) => {
                    self.info.extend_from_slice(b);
                    self.info.push(0);
                }
                AttrValue::Data1(b) => self.info.push(b),
                AttrValue::Data8(v) => self.info.extend_from_slice(&v.to_le_bytes()),
                AttrValue::Addr(a) => self.info.extend_from_slice(&a.to_le_bytes()),
                AttrValue::Flag(b) => self.info.push(b as u8),
                AttrValue::FlagPresent => {}
                AttrValue::Ref4(rel) => self.info.extend_from_slice(&rel.to_le_bytes()),
                AttrValue::RefAddr(abs) => self.info.extend_from_slice(&abs.to_le_bytes()),
                AttrValue::Patch => {
                    fixups.push(Fixup(self.info.len()));
                    self.info.extend_from_slice(&0u32.to_le_bytes());
                }
            }
        }
        fixups
    }

    /// Terminate the current DIE's child list.
    pub fn end_children(&mut self) {
        self.info.push(0);
    }

    pub fn patch(&mut self, fixup: Fixup, value: u32) {
        self.info[fixup.0..fixup.0 + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn finish(mut self) -> SectionBytes {
        assert!(self.unit_start.is_none(), "unit left open");
        self.abbrev.push(0); // table terminator
        SectionBytes {
            debug_info: self.info,
            debug_abbrev: self.abbrev,
            ..SectionBytes::default()
        }
    }
}
