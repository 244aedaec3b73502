//! ELF `ET_REL` loader (§4.5).
pub mod loader;

use crate::cache::Cache;
use crate::error::{format_error, Result};
use crate::io::RtlFile;
use elf::abi;

/// The platform identifiers an ELF object must match to be accepted
/// (§4.5's "e_machine is in the platform's accepted set").
#[derive(Debug, Clone, Copy)]
pub struct Platform {
    pub class: u8,
    pub endian: u8,
    pub machines: &'static [u16],
}

impl Platform {
    /// The platform x86-64 hosted builds run the test suite against.
    pub const X86_64: Platform = Platform {
        class: abi::ELFCLASS64,
        endian: abi::ELFDATA2LSB,
        machines: &[abi::EM_X86_64 as u16],
    };
}

/// A parsed, precondition-checked ELF header (§4.5 preconditions).
#[derive(Debug, Clone, Copy)]
pub struct Ehdr {
    pub class: u8,
    pub endian: u8,
    pub e_type: u16,
    pub e_machine: u16,
    pub e_shoff: u64,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
    pub e_shentsize: u16,
}

const EI_NIDENT: usize = 16;

fn shdr_size(class: u8) -> u16 {
    if class == abi::ELFCLASS64 {
        64
    } else {
        40
    }
}

/// Read and precondition-check the ELF header through `cache`. Fails each
/// of §4.5's checks with a `Format` error; never panics on malformed input.
pub fn read_ehdr(file: &mut dyn RtlFile, cache: &mut Cache, platform: &Platform) -> Result<Ehdr> {
    let mut ident = [0u8; EI_NIDENT];
    cache.read_into(file, 0, &mut ident)?;
    if &ident[0..4] != abi::ELFMAG {
        return Err(format_error("bad ELF magic"));
    }
    let class = ident[abi::EI_CLASS];
    if class != platform.class {
        return Err(format_error("ELF class does not match platform word size"));
    }
    let endian = ident[abi::EI_DATA];
    if endian != platform.endian {
        return Err(format_error("ELF endianness does not match platform"));
    }
    if ident[abi::EI_VERSION] != abi::EV_CURRENT {
        return Err(format_error("unsupported ELF ident version"));
    }

    let rest_len = if class == abi::ELFCLASS64 { 48 } else { 36 };
    let mut rest = [0u8; 48];
    cache.read_into(file, EI_NIDENT as u64, &mut rest[..rest_len])?;
    let le = endian == abi::ELFDATA2LSB;

    let (e_type, e_machine, e_version) = (u16_at(&rest, 0, le), u16_at(&rest, 2, le), u32_at(&rest, 4, le));
    if e_version != abi::EV_CURRENT as u32 {
        return Err(format_error("unsupported ELF object version"));
    }
    if !platform.machines.contains(&e_machine) {
        return Err(format_error(alloc::format!(
            "ELF machine {e_machine} not accepted on this platform"
        )));
    }
    if e_type != abi::ET_REL {
        return Err(format_error("only relocatable (ET_REL) objects are accepted"));
    }

    let (e_shoff, e_shentsize, e_shnum, e_shstrndx) = if class == abi::ELFCLASS64 {
        (
            u64_at(&rest, 40, le),
            u16_at(&rest, 58, le),
            u16_at(&rest, 60, le),
            u16_at(&rest, 62, le),
        )
    } else {
        (
            u32_at(&rest, 32, le) as u64,
            u16_at(&rest, 46, le),
            u16_at(&rest, 48, le),
            u16_at(&rest, 50, le),
        )
    };

    if e_shentsize != shdr_size(class) {
        return Err(format_error("unexpected section header entry size"));
    }

    Ok(Ehdr {
        class,
        endian,
        e_type,
        e_machine,
        e_shoff,
        e_shnum,
        e_shstrndx,
        e_shentsize,
    })
}

fn u16_at(buf: &[u8], off: usize, le: bool) -> u16 {
    let b = [buf[off], buf[off + 1]];
    if le {
        u16::from_le_bytes(b)
    } else {
        u16::from_be_bytes(b)
    }
}

fn u32_at(buf: &[u8], off: usize, le: bool) -> u32 {
    let b = [buf[off], buf[off + 1], buf[off + 2], buf[off + 3]];
    if le {
        u32::from_le_bytes(b)
    } else {
        u32::from_be_bytes(b)
    }
}

fn u64_at(buf: &[u8], off: usize, le: bool) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    if le {
        u64::from_le_bytes(b)
    } else {
        u64::from_be_bytes(b)
    }
}

pub(crate) use {u16_at as read_u16, u32_at as read_u32, u64_at as read_u64};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tests::MemFile;
    use alloc::vec::Vec;

    fn minimal_ehdr64(e_type: u16, machine: u16) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; 64];
        buf[0..4].copy_from_slice(abi::ELFMAG);
        buf[abi::EI_CLASS] = abi::ELFCLASS64;
        buf[abi::EI_DATA] = abi::ELFDATA2LSB;
        buf[abi::EI_VERSION] = abi::EV_CURRENT;
        buf[16..18].copy_from_slice(&e_type.to_le_bytes());
        buf[18..20].copy_from_slice(&machine.to_le_bytes());
        buf[20..24].copy_from_slice(&(abi::EV_CURRENT as u32).to_le_bytes());
        buf[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
        buf[60..62].copy_from_slice(&0u16.to_le_bytes());
        buf[62..64].copy_from_slice(&0u16.to_le_bytes());
        buf
    }

    #[test]
    fn accepts_well_formed_et_rel_header() {
        let buf = minimal_ehdr64(abi::ET_REL, abi::EM_X86_64 as u16);
        let mut file = MemFile::new(buf);
        let mut cache = Cache::new(128);
        let ehdr = read_ehdr(&mut file, &mut cache, &Platform::X86_64).unwrap();
        assert_eq!(ehdr.e_type, abi::ET_REL);
    }

    #[test]
    fn rejects_non_relocatable_type() {
        let buf = minimal_ehdr64(abi::ET_EXEC, abi::EM_X86_64 as u16);
        let mut file = MemFile::new(buf);
        let mut cache = Cache::new(128);
        let err = read_ehdr(&mut file, &mut cache, &Platform::X86_64).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Format);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = minimal_ehdr64(abi::ET_REL, abi::EM_X86_64 as u16);
        buf[0] = 0;
        let mut file = MemFile::new(buf);
        let mut cache = Cache::new(128);
        let err = read_ehdr(&mut file, &mut cache, &Platform::X86_64).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Format);
    }
}
