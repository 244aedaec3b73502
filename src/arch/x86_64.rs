//! x86-64 relocation arithmetic, the one fully implemented ISA (§4.7).
use crate::error::{unsupported_relocation, Result};
use crate::object::Section;
use crate::reloc::{write_at, RelRecord, RelaRecord, RelocBackend};

// From the ELF x86-64 psABI; only the subset an `ET_REL` object loader
// actually emits without PLT/GOT support.
pub const R_X86_64_NONE: u32 = 0;
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;
pub const R_X86_64_32: u32 = 10;
pub const R_X86_64_32S: u32 = 11;
pub const R_X86_64_PC64: u32 = 24;
pub const R_X86_64_RELATIVE: u32 = 8;

pub struct Backend;

impl RelocBackend for Backend {
    fn resolve_sym(&self, rel_type: u32) -> bool {
        !matches!(rel_type, R_X86_64_NONE | R_X86_64_RELATIVE)
    }

    fn relocate_rel(&self, _base: usize, _t: &Section, rel: &RelRecord, _v: usize) -> Result<()> {
        // x86-64 objects carry explicit addends; a REL stream against this
        // ISA is itself a format error rather than silently misapplied.
        Err(unsupported_relocation(alloc::format!(
            "x86-64 does not use REL relocations (type {})",
            rel.rel_type
        )))
    }

    fn relocate_rela(
        &self,
        module_base: usize,
        target: &Section,
        rela: &RelaRecord,
        sym_value: usize,
    ) -> Result<()> {
        match rela.rel_type {
            R_X86_64_NONE => Ok(()),
            R_X86_64_64 => {
                let value = (sym_value as i64).wrapping_add(rela.addend) as u64;
                write_at(target, rela.offset, &value.to_ne_bytes())
            }
            R_X86_64_PC32 => {
                let pc = target
                    .base
                    .ok_or_else(|| crate::error::state_error("section has no base"))?
                    + rela.offset as usize;
                let value = (sym_value as i64 + rela.addend - pc as i64) as i32;
                write_at(target, rela.offset, &value.to_ne_bytes())
            }
            R_X86_64_32 => {
                let value = (sym_value as i64).wrapping_add(rela.addend);
                let v32: u32 = value
                    .try_into()
                    .map_err(|_| crate::error::format_error("R_X86_64_32 value overflow"))?;
                write_at(target, rela.offset, &v32.to_ne_bytes())
            }
            R_X86_64_32S => {
                let value = (sym_value as i64).wrapping_add(rela.addend);
                let v32: i32 = value
                    .try_into()
                    .map_err(|_| crate::error::format_error("R_X86_64_32S value overflow"))?;
                write_at(target, rela.offset, &v32.to_ne_bytes())
            }
            R_X86_64_PC64 => {
                let pc = target
                    .base
                    .ok_or_else(|| crate::error::state_error("section has no base"))?
                    + rela.offset as usize;
                let value = sym_value as i64 + rela.addend - pc as i64;
                write_at(target, rela.offset, &value.to_ne_bytes())
            }
            R_X86_64_RELATIVE => {
                let value = (module_base as i64).wrapping_add(rela.addend) as u64;
                write_at(target, rela.offset, &value.to_ne_bytes())
            }
            other => Err(unsupported_relocation(alloc::format!(
                "unsupported x86-64 relocation type {other}"
            ))),
        }
    }
}
