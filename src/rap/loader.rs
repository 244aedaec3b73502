//! The RAP post-header stream parser (§4.6 steps 1-8).
use crate::alloc_tags::{alloc_new, AllocTag};
use crate::error::{format_error, resource_error, Result};
use crate::io::RtlFile;
use crate::object::{MemoryMap, Object, ObjSymbol, Section, SectionFlags};
use crate::rap::{parse_header, Compression};
use crate::reloc::{RelRecord, RelaRecord, RelocBackend};
use crate::symtab::{SymFlags, SymTab};
use alloc::string::String;
use alloc::vec::Vec;

/// The platform identifiers a RAP file's `machinetype`/`datatype`/`class`
/// triple must match (§4.6 step 1).
#[derive(Debug, Clone, Copy)]
pub struct RapPlatform {
    pub machine_type: u32,
    pub data_type: u32,
    pub class: u32,
}

/// The six fixed RAP sections, in the stream's mandated order.
const SECTION_NAMES: [&str; 6] = [".text", ".const", ".ctor", ".dtor", ".data", ".bss"];

fn section_class_flags(i: usize) -> SectionFlags {
    match i {
        0 => SectionFlags::TEXT | SectionFlags::LOAD,
        1 => SectionFlags::CONST | SectionFlags::LOAD,
        2 => SectionFlags::CONST | SectionFlags::LOAD | SectionFlags::CTOR,
        3 => SectionFlags::CONST | SectionFlags::LOAD | SectionFlags::DTOR,
        4 => SectionFlags::DATA | SectionFlags::LOAD,
        5 => SectionFlags::BSS | SectionFlags::ZERO,
        _ => unreachable!(),
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(format_error("unexpected end of RAP stream"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Read the whole post-header stream into memory, decompressing it first
/// if the header declared LZ77 compression.
fn read_stream(file: &mut dyn RtlFile, header_len: u64) -> Result<Vec<u8>> {
    let total_len = file
        .len()
        .map_err(|e| crate::error::io_error(alloc::format!("RAP length unavailable: {e}")))?;
    let avail = total_len.saturating_sub(header_len);
    let mut raw = alloc::vec![0u8; avail as usize];
    let n = file
        .read_at(header_len, &mut raw)
        .map_err(|e| crate::error::io_error(alloc::format!("RAP read failed: {e}")))?;
    raw.truncate(n);
    Ok(raw)
}

fn decode_stream(raw: Vec<u8>, compression: Compression, declen: u32) -> Result<Vec<u8>> {
    match compression {
        Compression::None => {
            if raw.len() < declen as usize {
                return Err(format_error("RAP stream shorter than declared length"));
            }
            let mut raw = raw;
            raw.truncate(declen as usize);
            Ok(raw)
        }
        Compression::Lz77 => {
            #[cfg(feature = "lz77")]
            {
                crate::rap::lz77::decompress(&raw, declen as usize)
            }
            #[cfg(not(feature = "lz77"))]
            {
                Err(format_error("RAP file uses LZ77 compression but the lz77 feature is disabled"))
            }
        }
    }
}

/// Run the full RAP load pipeline against `obj`.
pub fn load(
    obj: &mut Object,
    file: &mut dyn RtlFile,
    platform: &RapPlatform,
    symtab: &mut SymTab,
    backend: &dyn RelocBackend,
) -> Result<()> {
    let mut head = [0u8; 64];
    let n = file
        .read_at(0, &mut head)
        .map_err(|e| crate::error::io_error(alloc::format!("RAP header read failed: {e}")))?;
    let (header, header_len) = parse_header(&head[..n])?;

    let raw = read_stream(file, header_len as u64)?;
    let stream = decode_stream(raw, header.compression, header.length)?;
    let mut cur = Cursor::new(&stream);

    let machine_type = cur.u32()?;
    let data_type = cur.u32()?;
    let class = cur.u32()?;
    if machine_type != platform.machine_type || data_type != platform.data_type || class != platform.class {
        return Err(format_error("RAP platform identifiers do not match"));
    }

    let _init = cur.u32()?;
    let _fini = cur.u32()?;
    let symtab_size = cur.u32()?;
    let strtab_size = cur.u32()?;
    let relocs_size = cur.u32()?;
    let _ = relocs_size; // recomputed per-section from the stream's own headers

    let mut sizes = [0u32; 6];
    let mut aligns = [0u32; 6];
    for i in 0..6 {
        sizes[i] = cur.u32()?;
        aligns[i] = cur.u32()?;
    }

    let mut sections: Vec<Section> = (0..6)
        .map(|i| {
            let mut s = Section::new(i, String::from(SECTION_NAMES[i]), sizes[i] as usize, 0, aligns[i].max(1) as usize);
            s.flags = section_class_flags(i);
            s
        })
        .collect();

    let total: usize = {
        let mut t = 0usize;
        for s in &sections {
            t = align_up(t, s.alignment.max(1));
            t += s.size;
        }
        align_up(t, aligns.iter().copied().max().unwrap_or(1) as usize)
    };

    let module = if total > 0 {
        Some(alloc_new(AllocTag::Module, total).ok_or_else(|| resource_error("RAP module memory allocation failed"))?)
    } else {
        None
    };
    let module_addr = module.map(|m| m.as_ptr() as usize).unwrap_or(0);

    let mut cursor_addr = module_addr;
    let mut bases = [0usize; 6];
    for (i, s) in sections.iter_mut().enumerate() {
        cursor_addr = align_up(cursor_addr, s.alignment.max(1));
        bases[i] = cursor_addr;
        s.base = Some(cursor_addr);
        if s.flags.contains(SectionFlags::LOAD) {
            let body = cur.take(s.size)?;
            unsafe {
                core::ptr::copy_nonoverlapping(body.as_ptr(), cursor_addr as *mut u8, body.len());
            }
        } else if s.flags.contains(SectionFlags::ZERO) {
            unsafe { core::ptr::write_bytes(cursor_addr as *mut u8, 0, s.size) };
        }
        cursor_addr += s.size;
    }

    let strtab_bytes = cur.take(strtab_size as usize)?;

    let n_syms = symtab_size as usize / 12;
    let mut global_table = Vec::with_capacity(n_syms);
    // Maps a stream symbol index (in encounter order) to its resolved value,
    // for relocations that reference it by name later resolved through the
    // global table instead; RAP relocations name symbols directly, so this
    // module table only needs to be exported, not indexed.
    for _ in 0..n_syms {
        let data = cur.u32()?;
        let name_off = cur.u32()?;
        let value = cur.u32()?;
        let section_idx = (data >> 16) as usize;
        let Some(&base) = bases.get(section_idx) else {
            return Err(format_error("RAP symbol names an out-of-range section"));
        };
        let name = str_at(strtab_bytes, name_off as usize)?;
        if name.is_empty() {
            continue;
        }
        let abs_value = base + value as usize;
        let bind = ((data >> 8) & 0xFF) as u8;
        let flags = if bind == 2 { SymFlags::WEAK } else { SymFlags::empty() };
        symtab.insert(name, abs_value, obj.id, flags)?;
        global_table.push(ObjSymbol {
            name: String::from(name),
            value: abs_value,
        });
    }

    let mut unresolved = 0u32;
    for (i, _name) in SECTION_NAMES.iter().enumerate() {
        let header = cur.u32()?;
        let is_rela = header & 0x8000_0000 != 0;
        let count = header & 0x7FFF_FFFF;
        for _ in 0..count {
            let info = cur.u32()?;
            let offset = cur.u32()?;
            let rel_type = info & 0xFF;

            let bit31 = info & 0x8000_0000 != 0;
            let bit30 = info & 0x4000_0000 != 0;

            let (sym_value, resolved) = if !bit31 {
                // Section-index kind always carries an addend, REL or RELA.
                let target_idx = (info >> 8) as usize & 0x3F_FFFF;
                let addend = cur.u32()? as i32 as i64;
                let Some(&base) = bases.get(target_idx) else {
                    return Err(format_error("RAP relocation names an out-of-range section"));
                };
                ((base as i64 + addend) as usize, true)
            } else if !bit30 {
                let name_len = ((info & 0x3FFF_FF00) >> 8) as usize;
                let name_bytes = cur.take(name_len)?;
                let name = core::str::from_utf8(name_bytes).map_err(|_| format_error("non-UTF-8 inline RAP symbol name"))?;
                let looked_up = symtab.lookup(name).map(|e| e.value);
                let addend = if is_rela { cur.u32()? as i32 as i64 } else { 0 };
                match looked_up {
                    Some(v) => ((v as i64 + addend) as usize, true),
                    None => (0, false),
                }
            } else {
                let name_off = ((info & 0x3FFF_FF00) >> 8) as usize;
                let name = str_at(strtab_bytes, name_off)?;
                let looked_up = symtab.lookup(name).map(|e| e.value);
                let addend = if is_rela { cur.u32()? as i32 as i64 } else { 0 };
                match looked_up {
                    Some(v) => ((v as i64 + addend) as usize, true),
                    None => (0, false),
                }
            };

            if !resolved {
                #[cfg(feature = "log")]
                log::debug!("[rap reloc] type {rel_type} in {} left unresolved", SECTION_NAMES[i]);
                unresolved += 1;
                continue;
            }

            let target = &sections[i];
            #[cfg(feature = "log")]
            log::trace!(
                "[rap reloc] type {rel_type} at {}+0x{offset:x} -> 0x{sym_value:x}",
                SECTION_NAMES[i]
            );
            if is_rela {
                let rec = RelaRecord {
                    offset: offset as u64,
                    sym_index: 0,
                    rel_type,
                    addend: 0,
                };
                backend.relocate_rela(module_addr, target, &rec, sym_value)?;
            } else {
                let rec = RelRecord {
                    offset: offset as u64,
                    sym_index: 0,
                    rel_type,
                };
                backend.relocate_rel(module_addr, target, &rec, sym_value)?;
            }
        }
    }

    obj.sections = sections;
    obj.map = MemoryMap {
        text_base: bases[0],
        const_base: bases[1],
        data_base: bases[4],
        bss_base: bases[5],
        exec_size: total,
    };
    obj.module_memory = module;
    obj.global_table = global_table;
    if unresolved > 0 {
        obj.flags |= crate::object::ObjFlags::UNRESOLVED;
    }

    #[cfg(feature = "log")]
    log::debug!(
        "[rap] {} loaded: {} globals, {unresolved} unresolved relocation(s)",
        obj.oname,
        obj.global_table.len()
    );
    Ok(())
}

fn str_at(buf: &[u8], offset: usize) -> Result<&str> {
    if offset >= buf.len() {
        return Err(format_error("RAP string offset out of range"));
    }
    let end = buf[offset..].iter().position(|&b| b == 0).map(|p| offset + p).unwrap_or(buf.len());
    core::str::from_utf8(&buf[offset..end]).map_err(|_| format_error("non-UTF-8 RAP string"))
}

fn align_up(v: usize, align: usize) -> usize {
    if align <= 1 {
        v
    } else {
        (v + align - 1) & !(align - 1)
    }
}
