//! An in-process runtime link editor: loads ELF (`ET_REL`) and RAP object
//! modules and archive members, resolves their symbols against a
//! process-wide global table and a base image, runs constructors on load
//! and destructors on unload, and exposes a POSIX-style `open`/`close`/
//! `sym`/`error`/`info` surface for host code.
//!
//! Everything that touches the filesystem, memory mapping, or
//! synchronization primitives is expressed as a trait ([`io::RtlFile`],
//! [`io::RtlFs`], [`sync::RtlLock`]) so the core builds `no_std` + `alloc`;
//! the `std` feature supplies ready host backends for all three.
#![cfg_attr(not(feature = "std"), no_std)]
extern crate alloc;

pub mod alloc_tags;
pub mod archive;
pub mod arch;
pub mod cache;
pub mod elf;
pub mod error;
pub mod io;
pub mod object;
pub mod posix;
pub mod rap;
pub mod reloc;
pub mod rtl;
pub mod sync;
pub mod symtab;

pub use error::{Error, ErrorKind, Result};
pub use object::{parse_object_name, ObjectName};
pub use rtl::{debugger_notify, new_rtl, DebugEvent, Handle, Rtl, RtlConfig, BASE_IMAGE_HANDLE};

#[cfg(feature = "std")]
pub use rtl::instance;
pub use rtl::instance_with_fs;
