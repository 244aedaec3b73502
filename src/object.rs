//! Object descriptor and section descriptor (§3, §6.2).
use crate::alloc_tags::{alloc_del, alloc_new, AllocTag};
use crate::error::{format_error, Result};
use alloc::string::String;
use alloc::vec::Vec;
use core::ptr::NonNull;

bitflags::bitflags! {
    /// Object descriptor state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjFlags: u32 {
        /// Mid-constructor or mid-destructor; unload must fail fast.
        const LOCKED = 1 << 0;
        /// At least one relocation could not be resolved at load time.
        const UNRESOLVED = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Section classification bits (§3 "Section descriptor").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const TEXT  = 1 << 0;
        const DATA  = 1 << 1;
        const CONST = 1 << 2;
        const BSS   = 1 << 3;
        const LOAD  = 1 << 4;
        const ZERO  = 1 << 5;
        const REL   = 1 << 6;
        const RELA  = 1 << 7;
        const SYM   = 1 << 8;
        const STR   = 1 << 9;
        const CTOR  = 1 << 10;
        const DTOR  = 1 << 11;
    }
}

/// One section inside a loaded object, either ELF- or RAP-sourced.
#[derive(Debug, Clone)]
pub struct Section {
    /// Source-file section index (ELF) or stream position (RAP).
    pub section: usize,
    pub name: String,
    pub size: usize,
    /// Position of the section's data in the source file/stream.
    pub offset: u64,
    pub alignment: usize,
    /// ELF `sh_link` / RAP's owning-section cross reference; 0 if unused.
    pub link: usize,
    /// ELF `sh_info`; identifies a REL/RELA section's target section.
    pub info: usize,
    pub flags: SectionFlags,
    /// Runtime address once loaded; `None` before stage 2/3 of the loader.
    pub base: Option<usize>,
}

impl Section {
    pub fn new(section: usize, name: String, size: usize, offset: u64, alignment: usize) -> Self {
        Section {
            section,
            name,
            size,
            offset,
            alignment,
            link: 0,
            info: 0,
            flags: SectionFlags::empty(),
            base: None,
        }
    }
}

/// The four non-overlapping sub-regions of a loaded object's module memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryMap {
    pub text_base: usize,
    pub const_base: usize,
    pub data_base: usize,
    pub bss_base: usize,
    pub exec_size: usize,
}

/// One module-global symbol: a name (into the object's own string pool) and
/// a resolved runtime value.
#[derive(Debug, Clone)]
pub struct ObjSymbol {
    pub name: String,
    pub value: usize,
}

/// The central in-memory entity: one per loaded module (§3).
pub struct Object {
    pub oname: String,
    pub aname: Option<String>,
    pub fname: String,
    pub ooffset: u64,
    pub fsize: u64,
    pub sections: Vec<Section>,
    pub map: MemoryMap,
    /// The object's owning allocation for text/const/data/bss, if allocated.
    pub module_memory: Option<NonNull<u8>>,
    pub global_table: Vec<ObjSymbol>,
    pub entry: Option<usize>,
    pub flags: ObjFlags,
    pub users: u32,
    /// Stable identity used as the symbol table's `owner` key and as the
    /// handle the POSIX façade hands back to callers.
    pub id: u64,
}

impl Object {
    pub fn new(id: u64, oname: String, aname: Option<String>, fname: String) -> Self {
        Object {
            oname,
            aname,
            fname,
            ooffset: 0,
            fsize: 0,
            sections: Vec::new(),
            map: MemoryMap::default(),
            module_memory: None,
            global_table: Vec::new(),
            entry: None,
            flags: ObjFlags::empty(),
            users: 0,
            id,
        }
    }

    /// Sections carrying the CTOR flag, in file order (§4.8: "constructors
    /// run in section-file order").
    pub fn ctor_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.flags.contains(SectionFlags::CTOR))
    }

    /// Sections carrying the DTOR flag, in the same order as ctors
    /// (no reverse-order guarantee; §9 Open Question 2).
    pub fn dtor_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.flags.contains(SectionFlags::DTOR))
    }

    pub fn find_section(&self, index: usize) -> Option<&Section> {
        self.sections.iter().find(|s| s.section == index)
    }

    /// Free `module_memory`; the descriptor itself and its name strings are
    /// freed by the caller (the RTL façade), which also owns the allocation
    /// tag bookkeeping for those.
    pub fn free_module_memory(&mut self) {
        if let Some(ptr) = self.module_memory.take() {
            alloc_del(AllocTag::Module, Some(ptr));
        }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        self.free_module_memory();
    }
}

/// A parsed `object[@offset]` or `archive:object[@offset]` name per §6.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectName<'a> {
    pub archive: Option<&'a str>,
    pub object: &'a str,
    pub offset: Option<u64>,
}

/// Parse the object name grammar: `object[@offset]` or
/// `archive:object[@offset]`. `offset` is base-0 (accepts `0x` hex or plain
/// decimal).
pub fn parse_object_name(input: &str) -> Result<ObjectName<'_>> {
    let (rest, archive) = match input.split_once(':') {
        Some((a, rest)) => (rest, Some(a)),
        None => (input, None),
    };
    let (object, offset) = match rest.split_once('@') {
        Some((obj, off)) => {
            let offset = parse_base0(off).ok_or_else(|| {
                format_error(alloc::format!("invalid object offset: {off}"))
            })?;
            (obj, Some(offset))
        }
        None => (rest, None),
    };
    if object.is_empty() {
        return Err(format_error("empty object name"));
    }
    Ok(ObjectName {
        archive,
        object,
        offset,
    })
}

fn parse_base0(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u64>().ok()
    }
}
