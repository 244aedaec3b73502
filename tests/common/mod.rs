//! Shared fixture builders for integration tests.
use std::io::Write;

use object::write::{Object as ObjWriter, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope};

const HEADER_SIZE: usize = 60;

fn ar_header(name: &str, size: usize) -> [u8; HEADER_SIZE] {
    let mut h = [b' '; HEADER_SIZE];
    let name_bytes = name.as_bytes();
    h[..name_bytes.len()].copy_from_slice(name_bytes);
    let size_str = size.to_string();
    h[48..48 + size_str.len()].copy_from_slice(size_str.as_bytes());
    h[58] = b'`';
    h[59] = b'\n';
    h
}

/// Build a classic `ar` archive (magic + 60-byte headers, even-padded
/// bodies) containing `members`, using the GNU extended-filename `//`
/// table for any name over 15 characters (the short-name field limit).
pub fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut ext_table = Vec::new();
    let mut ext_offsets = std::collections::HashMap::new();
    for (name, _) in members {
        if name.len() > 15 {
            ext_offsets.insert(*name, ext_table.len());
            ext_table.extend_from_slice(name.as_bytes());
            ext_table.push(b'/');
            ext_table.push(b'\n');
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"!<arch>\n");

    if !ext_table.is_empty() {
        out.extend_from_slice(&ar_header("//", ext_table.len()));
        out.extend_from_slice(&ext_table);
        if ext_table.len() % 2 == 1 {
            out.push(b'\n');
        }
    }

    for (name, body) in members {
        let field = if let Some(off) = ext_offsets.get(name) {
            format!("/{off}")
        } else {
            format!("{name}/")
        };
        out.extend_from_slice(&ar_header(&field, body.len()));
        out.extend_from_slice(body);
        if body.len() % 2 == 1 {
            out.push(b'\n');
        }
    }
    out
}

/// Build a minimal ET_REL object exporting four text symbols and one BSS
/// symbol, matching the "tiny ELF" fixture described in §8 scenario 1.
pub fn build_fixture_elf() -> Vec<u8> {
    let mut obj = ObjWriter::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);

    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, &[0x90, 0x90, 0x90, 0xc3], 4);

    let bss = obj.add_section(Vec::new(), b".bss".to_vec(), SectionKind::UninitializedData);
    obj.append_section_bss(bss, 8, 8);

    for (name, offset) in [("w_writeln", 0), ("x_writeln", 1), ("y_writeln", 2), ("z_writeln", 3)] {
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size: 1,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    }
    obj.add_symbol(Symbol {
        name: b"zero".to_vec(),
        value: 0,
        size: 8,
        kind: SymbolKind::Data,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(bss),
        flags: SymbolFlags::None,
    });

    obj.write().expect("object crate should emit a valid ET_REL image")
}

/// Write `data` to a fresh temp file, returning the handle (dropped =
/// deleted) and its path as a string.
pub fn write_temp_file(data: &[u8]) -> (tempfile::NamedTempFile, String) {
    let mut f = tempfile::NamedTempFile::new().expect("create temp file");
    f.write_all(data).expect("write temp file");
    f.flush().expect("flush temp file");
    let path = f.path().to_string_lossy().into_owned();
    (f, path)
}
