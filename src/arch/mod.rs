//! Per-ISA relocation arithmetic, selected at build time (§4.7, §9).
//!
//! Only the reference ISA (x86-64) carries real arithmetic; every other
//! target falls back to [`crate::reloc::UnsupportedBackend`], consistent
//! with the spec treating per-machine tables as out of scope beyond their
//! interface.
#[cfg(target_arch = "x86_64")]
pub mod x86_64;
