//! `ar`-format archive member locator (§4.4).
use crate::cache::Cache;
use crate::error::{format_error, io_error, not_found, Result};
use crate::io::RtlFile;
use alloc::string::String;
use alloc::vec::Vec;

pub const ARCHIVE_MAGIC: &[u8; 8] = b"!<arch>\n";
const HEADER_SIZE: u64 = 60;
const NAME_FIELD_LEN: usize = 16;
const SIZE_FIELD_OFFSET: usize = 48;
const SIZE_FIELD_LEN: usize = 10;
const END_MAGIC_OFFSET: usize = 58;
const END_MAGIC: &[u8; 2] = b"`\n";

/// The resolved location of a member's body within the archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberLocation {
    pub offset: u64,
    pub size: u64,
}

struct RawHeader {
    name_field: [u8; NAME_FIELD_LEN],
    size: u64,
    /// Offset of this header's body (header start + HEADER_SIZE).
    body_offset: u64,
}

fn read_header(cache: &mut Cache, file: &mut dyn RtlFile, offset: u64) -> Result<RawHeader> {
    let mut buf = [0u8; HEADER_SIZE as usize];
    cache.read_into(file, offset, &mut buf)?;
    if &buf[END_MAGIC_OFFSET..END_MAGIC_OFFSET + 2] != END_MAGIC {
        return Err(format_error(alloc::format!(
            "malformed archive header at offset {offset}"
        )));
    }
    let mut name_field = [0u8; NAME_FIELD_LEN];
    name_field.copy_from_slice(&buf[0..NAME_FIELD_LEN]);
    let size_str = core::str::from_utf8(&buf[SIZE_FIELD_OFFSET..SIZE_FIELD_OFFSET + SIZE_FIELD_LEN])
        .map_err(|_| format_error("non-UTF-8 archive size field"))?
        .trim();
    let size: u64 = size_str
        .parse()
        .map_err(|_| format_error(alloc::format!("bad archive size field: {size_str:?}")))?;
    Ok(RawHeader {
        name_field,
        size,
        body_offset: offset + HEADER_SIZE,
    })
}

/// Even-padded body length: `ar` pads odd-length members with a trailing
/// newline so every header starts on an even offset.
fn padded(size: u64) -> u64 {
    size + (size & 1)
}

fn name_field_str(field: &[u8; NAME_FIELD_LEN]) -> &str {
    let end = field
        .iter()
        .position(|&b| b == b' ' || b == b'/')
        .unwrap_or(NAME_FIELD_LEN);
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

/// Compare a wanted member name against a raw 16-byte name field, accepting
/// `/`, `\n`, `\0` as valid terminators in the field (§4.4 matching rule).
fn name_matches(field_str: &str, wanted: &str) -> bool {
    field_str == wanted
}

/// Locate `member` inside the archive readable through `file`, starting the
/// scan from the archive's first header (offset 8, past the magic).
///
/// `hint` is an optional pre-computed body offset (§6.2's `@offset` form);
/// when present, the header at that offset is checked first and, if valid
/// and matching, used directly without a full scan.
pub fn locate_member(
    file: &mut dyn RtlFile,
    cache: &mut Cache,
    member: &str,
    hint: Option<u64>,
) -> Result<MemberLocation> {
    let mut magic = [0u8; 8];
    cache.read_into(file, 0, &mut magic)?;
    if &magic != ARCHIVE_MAGIC {
        return Err(format_error("not an ar archive: bad magic"));
    }

    if let Some(offset) = hint {
        if offset >= HEADER_SIZE {
            let header_offset = offset - HEADER_SIZE;
            if let Ok(h) = read_header(cache, file, header_offset) {
                if name_field_str(&h.name_field) == member {
                    #[cfg(feature = "log")]
                    log::trace!("[archive] {member} located via offset hint at {header_offset}");
                    return Ok(MemberLocation {
                        offset: h.body_offset,
                        size: h.size,
                    });
                }
            }
        }
    }

    let len = file
        .len()
        .map_err(|e| io_error(alloc::format!("archive length unavailable: {e}")))?;
    let mut pos = 8u64;
    // Offset+size of the "//" extended-filename table body, once seen. A
    // well-formed archive places it before any member that references it.
    let mut ext_names: Option<u64> = None;

    while pos + HEADER_SIZE <= len {
        let h = read_header(cache, file, pos)?;
        let body_len = padded(h.size);
        let field = &h.name_field;

        if field[0] == b'/' && field[1] == b' ' {
            // symbol table, skip
        } else if field[0] == b'/' && field[1] == b'/' {
            ext_names = Some(h.body_offset);
        } else if field[0] == b'/' && field[1].is_ascii_digit() {
            let digits_end = field.iter().position(|&b| b == b' ').unwrap_or(NAME_FIELD_LEN);
            let digits = core::str::from_utf8(&field[1..digits_end]).unwrap_or("");
            if let (Ok(ext_off), Some(base)) = (digits.parse::<u64>(), ext_names) {
                if let Some(name) = read_ext_name(file, cache, base, ext_off)? {
                    if name_matches(&name, member) {
                        #[cfg(feature = "log")]
                        log::trace!("[archive] {member} located via extended name table at {pos}");
                        return Ok(MemberLocation {
                            offset: h.body_offset,
                            size: h.size,
                        });
                    }
                }
            }
        } else {
            let name = name_field_str(field);
            if name_matches(name, member) {
                #[cfg(feature = "log")]
                log::trace!("[archive] {member} located at {pos}");
                return Ok(MemberLocation {
                    offset: h.body_offset,
                    size: h.size,
                });
            }
        }

        pos = h.body_offset + body_len;
    }

    #[cfg(feature = "log")]
    log::debug!("[archive] {member} not found");
    Err(not_found(alloc::format!("archive member not found: {member}")))
}

fn read_ext_name(
    file: &mut dyn RtlFile,
    cache: &mut Cache,
    table_offset: u64,
    name_offset: u64,
) -> Result<Option<String>> {
    let mut want = 256usize;
    let slice = cache.read(file, table_offset + name_offset, &mut want)?;
    let end = slice
        .iter()
        .position(|&b| b == b'/' || b == b'\n' || b == 0)
        .unwrap_or(slice.len());
    Ok(core::str::from_utf8(&slice[..end]).ok().map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tests::MemFile;

    fn ar_header(name: &str, size: u64) -> Vec<u8> {
        let mut h = alloc::vec![b' '; HEADER_SIZE as usize];
        let name_bytes = name.as_bytes();
        h[..name_bytes.len()].copy_from_slice(name_bytes);
        let size_str = alloc::format!("{size}");
        let so = SIZE_FIELD_OFFSET;
        h[so..so + size_str.len()].copy_from_slice(size_str.as_bytes());
        h[END_MAGIC_OFFSET..END_MAGIC_OFFSET + 2].copy_from_slice(END_MAGIC);
        h
    }

    fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = ARCHIVE_MAGIC.to_vec();
        for (name, body) in members {
            out.extend_from_slice(&ar_header(name, body.len() as u64));
            out.extend_from_slice(body);
            if body.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        out
    }

    #[test]
    fn locates_short_name_member() {
        let data = build_archive(&[("foo.o/", b"hello".as_slice()), ("bar.o/", b"world!!".as_slice())]);
        let mut file = MemFile::new(data);
        let mut cache = Cache::new(64);
        let loc = locate_member(&mut file, &mut cache, "bar.o", None).unwrap();
        assert_eq!(loc.size, 7);
    }

    #[test]
    fn missing_member_is_not_found() {
        let data = build_archive(&[("foo.o/", b"hello".as_slice())]);
        let mut file = MemFile::new(data);
        let mut cache = Cache::new(64);
        let err = locate_member(&mut file, &mut cache, "missing.o", None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn locates_member_via_extended_name_table() {
        let long_name = "long_name_object.o";
        let mut ext_table = alloc::vec::Vec::new();
        ext_table.extend_from_slice(long_name.as_bytes());
        ext_table.push(b'/');
        ext_table.push(b'\n');
        let mut out = ARCHIVE_MAGIC.to_vec();
        out.extend_from_slice(&ar_header("//", ext_table.len() as u64));
        out.extend_from_slice(&ext_table);
        if ext_table.len() % 2 == 1 {
            out.push(b'\n');
        }
        let body = b"payload!";
        out.extend_from_slice(&ar_header("/0", body.len() as u64));
        out.extend_from_slice(body);

        let mut file = MemFile::new(out);
        let mut cache = Cache::new(64);
        let loc = locate_member(&mut file, &mut cache, long_name, None).unwrap();
        assert_eq!(loc.size, body.len() as u64);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut file = MemFile::new(alloc::vec![0u8; 64]);
        let mut cache = Cache::new(64);
        let err = locate_member(&mut file, &mut cache, "foo.o", None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Format);
    }
}
