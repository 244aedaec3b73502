//! The five-stage ELF load pipeline (§4.5).
use crate::alloc_tags::{alloc_new, AllocTag};
use crate::cache::Caches;
use crate::elf::{read_ehdr, read_u16, read_u32, read_u64, Ehdr, Platform};
use crate::error::{format_error, resource_error, Result};
use crate::io::RtlFile;
use crate::object::{MemoryMap, Object, ObjSymbol, Section, SectionFlags};
use crate::reloc::{RelRecord, RelaRecord, RelocBackend};
use crate::symtab::{SymFlags, SymTab};
use alloc::string::String;
use alloc::vec::Vec;
use elf::abi;

struct RawShdr {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u64,
}

fn read_shdr(file: &mut dyn RtlFile, caches: &mut Caches, ehdr: &Ehdr, index: u16) -> Result<RawShdr> {
    let entsize = ehdr.e_shentsize as u64;
    let offset = ehdr.e_shoff + entsize * index as u64;
    let le = ehdr.endian == abi::ELFDATA2LSB;
    let mut buf = [0u8; 64];
    caches
        .symbols
        .read_into(file, offset, &mut buf[..entsize as usize])?;
    if ehdr.class == abi::ELFCLASS64 {
        Ok(RawShdr {
            sh_name: read_u32(&buf, 0, le),
            sh_type: read_u32(&buf, 4, le),
            sh_flags: read_u64(&buf, 8, le),
            sh_offset: read_u64(&buf, 24, le),
            sh_size: read_u64(&buf, 32, le),
            sh_link: read_u32(&buf, 40, le),
            sh_info: read_u32(&buf, 44, le),
            sh_addralign: read_u64(&buf, 48, le),
        })
    } else {
        Ok(RawShdr {
            sh_name: read_u32(&buf, 0, le),
            sh_type: read_u32(&buf, 4, le),
            sh_flags: read_u32(&buf, 8, le) as u64,
            sh_offset: read_u32(&buf, 16, le) as u64,
            sh_size: read_u32(&buf, 20, le) as u64,
            sh_link: read_u32(&buf, 24, le),
            sh_info: read_u32(&buf, 28, le),
            sh_addralign: read_u32(&buf, 32, le) as u64,
        })
    }
}

fn read_shstr(
    file: &mut dyn RtlFile,
    caches: &mut Caches,
    strtab_off: u64,
    strtab_size: u64,
    name_off: u32,
) -> Result<String> {
    if name_off as u64 >= strtab_size {
        return Err(format_error("section name offset out of range"));
    }
    let mut want = 256usize;
    let slice = caches
        .strings
        .read(file, strtab_off + name_off as u64, &mut want)?;
    let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    Ok(core::str::from_utf8(&slice[..end]).unwrap_or("").into())
}

fn classify(sh_type: u32, sh_flags: u64, name: &str) -> SectionFlags {
    let mut flags = SectionFlags::empty();
    let alloc_bit = sh_flags & abi::SHF_ALLOC as u64 != 0;
    let write_bit = sh_flags & abi::SHF_WRITE as u64 != 0;
    let exec_bit = sh_flags & abi::SHF_EXECINSTR as u64 != 0;

    match sh_type {
        t if t == abi::SHT_PROGBITS && alloc_bit && exec_bit => flags |= SectionFlags::TEXT | SectionFlags::LOAD,
        t if t == abi::SHT_PROGBITS && alloc_bit && write_bit => flags |= SectionFlags::DATA | SectionFlags::LOAD,
        t if t == abi::SHT_PROGBITS && alloc_bit => flags |= SectionFlags::CONST | SectionFlags::LOAD,
        t if t == abi::SHT_NOBITS && alloc_bit && write_bit => flags |= SectionFlags::BSS | SectionFlags::ZERO,
        t if t == abi::SHT_REL => flags |= SectionFlags::REL,
        t if t == abi::SHT_RELA => flags |= SectionFlags::RELA,
        t if t == abi::SHT_SYMTAB => flags |= SectionFlags::SYM,
        t if t == abi::SHT_STRTAB => flags |= SectionFlags::STR,
        _ => return SectionFlags::empty(),
    }
    if name == ".ctors" {
        flags |= SectionFlags::CTOR;
    } else if name == ".dtors" {
        flags |= SectionFlags::DTOR;
    }
    flags
}

/// Stage 1: scan and classify every section header.
fn scan_sections(file: &mut dyn RtlFile, caches: &mut Caches, ehdr: &Ehdr) -> Result<Vec<Section>> {
    let shstr_hdr = read_shdr(file, caches, ehdr, ehdr.e_shstrndx)?;
    let mut out = Vec::with_capacity(ehdr.e_shnum as usize);
    for i in 0..ehdr.e_shnum {
        let raw = read_shdr(file, caches, ehdr, i)?;
        let name = read_shstr(file, caches, shstr_hdr.sh_offset, shstr_hdr.sh_size, raw.sh_name)?;
        let flags = classify(raw.sh_type, raw.sh_flags, &name);
        if flags.is_empty() && raw.sh_type != abi::SHT_NULL {
            // Unclassified (e.g. debug info): dropped per §4.5.
            continue;
        }
        if raw.sh_type == abi::SHT_NULL {
            continue;
        }
        let mut section = Section::new(
            i as usize,
            name,
            raw.sh_size as usize,
            raw.sh_offset,
            raw.sh_addralign.max(1) as usize,
        );
        section.link = raw.sh_link as usize;
        section.info = raw.sh_info as usize;
        section.flags = flags;
        out.push(section);
    }
    Ok(out)
}

fn align_up(v: usize, align: usize) -> usize {
    if align <= 1 {
        v
    } else {
        (v + align - 1) & !(align - 1)
    }
}

/// Stage 2 + 3: lay out and populate TEXT/CONST/DATA/BSS in a single
/// module allocation.
fn build_memory_map(
    file: &mut dyn RtlFile,
    caches: &mut Caches,
    sections: &mut [Section],
) -> Result<(MemoryMap, Option<core::ptr::NonNull<u8>>)> {
    let classes = [
        SectionFlags::TEXT,
        SectionFlags::CONST,
        SectionFlags::DATA,
        SectionFlags::BSS,
    ];

    let mut class_align = [1usize; 4];
    let mut class_size = [0usize; 4];
    for (ci, class) in classes.iter().enumerate() {
        let mut first = true;
        let mut cursor = 0usize;
        for s in sections.iter().filter(|s| s.flags.contains(*class)) {
            if first {
                class_align[ci] = s.alignment.max(1);
                first = false;
            }
            cursor = align_up(cursor, s.alignment.max(1));
            cursor += s.size;
        }
        class_size[ci] = cursor;
    }

    let max_align = class_align.iter().copied().max().unwrap_or(1);
    let mut base = [0usize; 4];
    let mut total = 0usize;
    for i in 0..4 {
        total = align_up(total, class_align[i]);
        base[i] = total;
        total += class_size[i];
    }
    total = align_up(total, max_align);

    if total == 0 {
        return Ok((MemoryMap::default(), None));
    }

    let module = alloc_new(AllocTag::Module, total)
        .ok_or_else(|| resource_error("module memory allocation failed"))?;
    let module_addr = module.as_ptr() as usize;

    let map = MemoryMap {
        text_base: module_addr + base[0],
        const_base: module_addr + base[1],
        data_base: module_addr + base[2],
        bss_base: module_addr + base[3],
        exec_size: total,
    };

    // Stage 3: place each class's sections, reading LOAD bodies in and
    // zero-filling ZERO ones.
    for (ci, class) in classes.iter().enumerate() {
        let mut cursor = base[ci];
        for s in sections.iter_mut().filter(|s| s.flags.contains(*class)) {
            cursor = align_up(cursor, s.alignment.max(1));
            let addr = module_addr + cursor;
            if s.flags.contains(SectionFlags::LOAD) {
                let dst = unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, s.size) };
                caches.symbols.read_into(file, s.offset, dst)?;
            } else if s.flags.contains(SectionFlags::ZERO) {
                unsafe { core::ptr::write_bytes(addr as *mut u8, 0, s.size) };
            }
            s.base = Some(addr);
            cursor += s.size;
        }
    }

    Ok((map, Some(module)))
}

/// Stage 4: ingest GLOBAL/WEAK OBJECT/FUNC symbols into the object's own
/// table and the process-wide global table.
fn ingest_symbols(
    file: &mut dyn RtlFile,
    caches: &mut Caches,
    ehdr: &Ehdr,
    sections: &[Section],
    owner_id: u64,
    symtab: &mut SymTab,
) -> Result<Vec<ObjSymbol>> {
    let Some(sym_section) = sections.iter().find(|s| s.flags.contains(SectionFlags::SYM)) else {
        return Ok(Vec::new());
    };
    let Some(str_section) = sections
        .iter()
        .find(|s| s.flags.contains(SectionFlags::STR) && s.section == sym_section.link)
    else {
        return Ok(Vec::new());
    };

    let le = ehdr.endian == abi::ELFDATA2LSB;
    let entsize: u64 = if ehdr.class == abi::ELFCLASS64 { 24 } else { 16 };
    let count = sym_section.size as u64 / entsize;
    let mut out = Vec::new();

    for idx in 0..count {
        let off = sym_section.offset + idx * entsize;
        let mut buf = [0u8; 24];
        caches
            .symbols
            .read_into(file, off, &mut buf[..entsize as usize])?;
        let (name_off, value, _size, info, shndx) = if ehdr.class == abi::ELFCLASS64 {
            (
                read_u32(&buf, 0, le),
                read_u64(&buf, 8, le),
                read_u64(&buf, 16, le),
                buf[4],
                read_u16(&buf, 6, le),
            )
        } else {
            (
                read_u32(&buf, 0, le),
                read_u32(&buf, 4, le) as u64,
                read_u32(&buf, 8, le) as u64,
                buf[12],
                read_u16(&buf, 14, le),
            )
        };

        let bind = info >> 4;
        let ty = info & 0xF;
        let is_object_or_func = ty == abi::STT_OBJECT || ty == abi::STT_FUNC;
        let is_global_or_weak = bind == abi::STB_GLOBAL || bind == abi::STB_WEAK;
        if !(is_object_or_func && is_global_or_weak) {
            continue;
        }
        if shndx == 0 || shndx as u32 >= abi::SHN_LORESERVE as u32 {
            // Undefined or reserved index: nothing this loader can resolve
            // a base for; skip (external refs are handled at relocation time).
            continue;
        }
        let Some(owning) = sections.iter().find(|s| s.section == shndx as usize) else {
            continue;
        };
        let Some(owning_base) = owning.base else {
            continue;
        };

        let mut want = 256usize;
        let name_slice = caches
            .strings
            .read(file, str_section.offset + name_off as u64, &mut want)?;
        let end = name_slice.iter().position(|&b| b == 0).unwrap_or(name_slice.len());
        let name = core::str::from_utf8(&name_slice[..end]).unwrap_or("");
        if name.is_empty() {
            continue;
        }

        let value = owning_base + value as usize;
        let flags = if bind == abi::STB_WEAK {
            SymFlags::WEAK
        } else {
            SymFlags::empty()
        };
        symtab.insert(name, value, owner_id, flags)?;
        out.push(ObjSymbol {
            name: String::from(name),
            value,
        });
    }

    Ok(out)
}

/// Stage 5: walk every REL/RELA section and drive the back-end.
fn apply_relocations(
    file: &mut dyn RtlFile,
    caches: &mut Caches,
    ehdr: &Ehdr,
    sections: &[Section],
    module_base: usize,
    symtab: &SymTab,
    backend: &dyn RelocBackend,
) -> Result<u32> {
    let le = ehdr.endian == abi::ELFDATA2LSB;
    let is64 = ehdr.class == abi::ELFCLASS64;
    let mut unresolved = 0u32;

    for rs in sections
        .iter()
        .filter(|s| s.flags.intersects(SectionFlags::REL | SectionFlags::RELA))
    {
        let Some(target) = sections.iter().find(|s| s.section == rs.info) else {
            continue; // target section dropped (e.g. debug relocations)
        };
        let is_rela = rs.flags.contains(SectionFlags::RELA);
        let entsize: u64 = match (is64, is_rela) {
            (true, true) => 24,
            (true, false) => 16,
            (false, true) => 12,
            (false, false) => 8,
        };
        let count = rs.size as u64 / entsize;

        for idx in 0..count {
            let off = rs.offset + idx * entsize;
            let mut buf = [0u8; 24];
            caches
                .relocs
                .read_into(file, off, &mut buf[..entsize as usize])?;

            let (r_offset, sym_index, rel_type, addend) = if is64 {
                let r_offset = read_u64(&buf, 0, le);
                let r_info = read_u64(&buf, 8, le);
                let sym_index = (r_info >> 32) as u32;
                let rel_type = (r_info & 0xFFFF_FFFF) as u32;
                let addend = if is_rela { read_u64(&buf, 16, le) as i64 } else { 0 };
                (r_offset, sym_index, rel_type, addend)
            } else {
                let r_offset = read_u32(&buf, 0, le) as u64;
                let r_info = read_u32(&buf, 4, le);
                let sym_index = r_info >> 8;
                let rel_type = r_info & 0xFF;
                let addend = if is_rela { read_u32(&buf, 8, le) as i32 as i64 } else { 0 };
                (r_offset, sym_index, rel_type, addend)
            };

            let mut sym_value = 0usize;
            if backend.resolve_sym(rel_type) {
                let name = read_symbol_name(file, caches, ehdr, sections, sym_index as u64)?;
                match name.and_then(|n| symtab.lookup(&n)) {
                    Some(entry) => sym_value = entry.value,
                    None => {
                        #[cfg(feature = "log")]
                        log::debug!("[elf reloc] type {rel_type} in {} left unresolved", target.name);
                        unresolved += 1;
                        continue;
                    }
                }
            }

            #[cfg(feature = "log")]
            log::trace!(
                "[elf reloc] type {rel_type} at {}+0x{r_offset:x} -> 0x{sym_value:x}",
                target.name
            );

            if is_rela {
                let rec = RelaRecord {
                    offset: r_offset,
                    sym_index,
                    rel_type,
                    addend,
                };
                backend.relocate_rela(module_base, target, &rec, sym_value)?;
            } else {
                let rec = RelRecord {
                    offset: r_offset,
                    sym_index,
                    rel_type,
                };
                backend.relocate_rel(module_base, target, &rec, sym_value)?;
            }
        }
    }

    Ok(unresolved)
}

fn read_symbol_name(
    file: &mut dyn RtlFile,
    caches: &mut Caches,
    ehdr: &Ehdr,
    sections: &[Section],
    sym_index: u64,
) -> Result<Option<String>> {
    let Some(sym_section) = sections.iter().find(|s| s.flags.contains(SectionFlags::SYM)) else {
        return Ok(None);
    };
    let Some(str_section) = sections
        .iter()
        .find(|s| s.flags.contains(SectionFlags::STR) && s.section == sym_section.link)
    else {
        return Ok(None);
    };
    let le = ehdr.endian == abi::ELFDATA2LSB;
    let entsize: u64 = if ehdr.class == abi::ELFCLASS64 { 24 } else { 16 };
    let off = sym_section.offset + sym_index * entsize;
    let mut buf = [0u8; 24];
    caches.symbols.read_into(file, off, &mut buf[..entsize as usize])?;
    let name_off = read_u32(&buf, 0, le);
    let mut want = 256usize;
    let slice = caches
        .strings
        .read(file, str_section.offset + name_off as u64, &mut want)?;
    let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    let name = core::str::from_utf8(&slice[..end]).unwrap_or("");
    if name.is_empty() {
        Ok(None)
    } else {
        Ok(Some(String::from(name)))
    }
}

/// Run all five stages against `obj`, populating its sections, memory map,
/// global table, and applying relocations.
pub fn load(
    obj: &mut Object,
    file: &mut dyn RtlFile,
    caches: &mut Caches,
    platform: &Platform,
    symtab: &mut SymTab,
    backend: &dyn RelocBackend,
) -> Result<()> {
    let ehdr = read_ehdr(file, caches, platform)?;
    let mut sections = scan_sections(file, caches, &ehdr)?;
    let (map, module) = build_memory_map(file, caches, &mut sections)?;
    let module_base = module.map(|m| m.as_ptr() as usize).unwrap_or(0);
    let global_table = ingest_symbols(file, caches, &ehdr, &sections, obj.id, symtab)?;
    let unresolved = apply_relocations(file, caches, &ehdr, &sections, module_base, symtab, backend)?;

    obj.sections = sections;
    obj.map = map;
    obj.module_memory = module;
    obj.global_table = global_table;
    if unresolved > 0 {
        obj.flags |= crate::object::ObjFlags::UNRESOLVED;
    }

    #[cfg(feature = "log")]
    log::debug!(
        "[elf] {} loaded: {} globals, {unresolved} unresolved relocation(s)",
        obj.oname,
        obj.global_table.len()
    );
    Ok(())
}
