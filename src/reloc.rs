//! Relocation back-end interface (§4.7).
//!
//! The arithmetic for any one machine is deliberately out of scope beyond a
//! single reference implementation (x86-64); every other identifier here is
//! dispatch plumbing a host links against its own per-ISA table through.
use crate::error::{unsupported_relocation, Result};
use crate::object::Section;

/// A relocation record read off the REL stream (no addend; the addend, if
/// any, lives in the bytes already at the target location).
#[derive(Debug, Clone, Copy)]
pub struct RelRecord {
    pub offset: u64,
    pub sym_index: u32,
    pub rel_type: u32,
}

/// A relocation record read off the RELA stream (explicit addend).
#[derive(Debug, Clone, Copy)]
pub struct RelaRecord {
    pub offset: u64,
    pub sym_index: u32,
    pub rel_type: u32,
    pub addend: i64,
}

/// Per-machine relocation strategy (§4.7, §9 "a strategy interface... one
/// is selected at build time").
pub trait RelocBackend {
    /// Does this relocation type require resolving an external symbol, or
    /// is it self-contained (e.g. a `RELATIVE` relocation against the
    /// module's own load base)?
    fn resolve_sym(&self, rel_type: u32) -> bool;

    /// Apply a REL-style relocation. `target` is the section the
    /// relocation writes into; `sym_value` is the resolved symbol address,
    /// meaningless when `resolve_sym` is false for this type.
    fn relocate_rel(
        &self,
        module_base: usize,
        target: &Section,
        rel: &RelRecord,
        sym_value: usize,
    ) -> Result<()>;

    /// Apply a RELA-style relocation.
    fn relocate_rela(
        &self,
        module_base: usize,
        target: &Section,
        rela: &RelaRecord,
        sym_value: usize,
    ) -> Result<()>;
}

/// Write `bytes` at `target.base + offset`, bounds-checked against the
/// section's size. Shared by every back-end's leaf writes.
pub fn write_at(target: &Section, offset: u64, bytes: &[u8]) -> Result<()> {
    let base = target
        .base
        .ok_or_else(|| crate::error::state_error("relocation target section has no base"))?;
    let off = offset as usize;
    if off + bytes.len() > target.size {
        return Err(crate::error::format_error(
            "relocation offset out of section bounds",
        ));
    }
    unsafe {
        let dst = (base + off) as *mut u8;
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
    }
    Ok(())
}

/// A back-end that accepts no relocation types; used for machines this
/// build was not configured with arithmetic for (§4.7: arithmetic tables
/// are interface-only outside the reference ISA).
pub struct UnsupportedBackend;

impl RelocBackend for UnsupportedBackend {
    fn resolve_sym(&self, _rel_type: u32) -> bool {
        false
    }

    fn relocate_rel(&self, _b: usize, _t: &Section, rel: &RelRecord, _v: usize) -> Result<()> {
        Err(unsupported_relocation(alloc::format!(
            "relocation type {} unsupported on this target",
            rel.rel_type
        )))
    }

    fn relocate_rela(&self, _b: usize, _t: &Section, rela: &RelaRecord, _v: usize) -> Result<()> {
        Err(unsupported_relocation(alloc::format!(
            "relocation type {} unsupported on this target",
            rela.rel_type
        )))
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use crate::arch::x86_64::Backend as NativeBackend;
    } else {
        /// No arithmetic table is implemented for this target; every
        /// relocation type is reported `unsupported-relocation-type` until
        /// a host supplies its own [`RelocBackend`] (§4.7, §9: per-ISA
        /// tables are a strategy interface selected at build time).
        pub type NativeBackend = UnsupportedBackend;
    }
}
