//! POSIX-style façade (§6.1): thin wrappers over [`crate::rtl::Rtl`] with
//! the handle/sentinel and `dlerror`-style semantics the host expects.
use crate::rtl::{Handle, Rtl, BASE_IMAGE_HANDLE};
use alloc::string::String;

/// `dlopen`-style mode flags. Only `now` binding exists (no lazy/PLT
/// binding is a stated non-goal); `global`/`local` only affects whether a
/// future `dlsym(RTLD_DEFAULT, ...)` style lookup would see this object's
/// exports, which in this single-namespace loader is always the case, so
/// the flag is accepted but has no observable effect.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub global: bool,
}

/// §6.1 `open(name, mode) -> handle`. `name` of `None` (or empty) maps to
/// the base image, matching `RTLD_DEFAULT`/`RTLD_SELF`/`RTLD_NEXT` all
/// degrading to the base image in this single-namespace loader
/// (`examples/original_source/dlfcn.c`).
pub fn open(rtl: &spin::Mutex<Rtl>, name: Option<&str>, _flags: OpenFlags) -> Option<Handle> {
    let name = name.unwrap_or("");
    if name.is_empty() {
        return Some(BASE_IMAGE_HANDLE);
    }
    let mut rtl = rtl.lock();
    rtl.load_object(name).ok()
}

/// §6.1 `close(handle) -> 0|-1`.
pub fn close(rtl: &spin::Mutex<Rtl>, handle: Handle) -> i32 {
    let mut rtl = rtl.lock();
    match rtl.unload_object(handle) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// §6.1 `sym(handle, name) -> address|null`. An invalid handle returns
/// `None` and sets no error, per §8's testable property.
pub fn sym(rtl: &spin::Mutex<Rtl>, handle: Handle, name: &str) -> Option<usize> {
    let rtl = rtl.lock();
    rtl.sym(handle, name)
}

/// §6.1 `error() -> string`: the thread-shared 64-byte message buffer,
/// cleared on read. Returns `None` when nothing is latched, matching
/// `dlerror()`'s `NULL`-on-empty behavior rather than an empty string.
pub fn error(rtl: &spin::Mutex<Rtl>) -> Option<String> {
    let rtl = rtl.lock();
    rtl.take_error()
}

/// The only supported `info` request (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoRequest {
    Unresolved,
}

/// §6.1 `info(handle, request, out) -> 0|-1`.
pub fn info(rtl: &spin::Mutex<Rtl>, handle: Handle, request: InfoRequest) -> Result<bool, ()> {
    let rtl = rtl.lock();
    match request {
        InfoRequest::Unresolved => rtl.is_unresolved(handle).ok_or(()),
    }
}
