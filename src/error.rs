//! Error taxonomy and the thread-shared error latch.
use alloc::borrow::Cow;
use alloc::string::String;
use core::fmt::Display;

/// Coarse classification of a failure, matching the taxonomy a POSIX-style
/// front-end needs to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No such file on any search path entry, or no such archive member.
    NotFound,
    /// Bad magic, unsupported class/machine/endianness, truncated stream,
    /// malformed header fields.
    Format,
    /// Allocation failure, lock creation failure.
    Resource,
    /// A non-weak symbol was already defined.
    DuplicateSymbol,
    /// A relocation referenced a symbol that could not be resolved. Soft:
    /// the object stays loaded with `ObjFlags::UNRESOLVED` set.
    UnresolvedRelocation,
    /// A relocation record named a type the back-end does not implement.
    UnsupportedRelocationType,
    /// Unload while locked, invalid handle, or other state misuse.
    State,
    /// Read/seek/write failure against the backing file.
    Io,
}

/// An RTL error: a kind plus a short, human-readable message.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    msg: Cow<'static, str>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Self {
        Error {
            kind,
            msg: msg.into(),
        }
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.msg
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

#[cold]
#[inline(never)]
pub(crate) fn not_found(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::NotFound, msg)
}

#[cold]
#[inline(never)]
pub(crate) fn format_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Format, msg)
}

#[cold]
#[inline(never)]
pub(crate) fn resource_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Resource, msg)
}

#[cold]
#[inline(never)]
pub(crate) fn duplicate_symbol(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::DuplicateSymbol, msg)
}

#[cold]
#[inline(never)]
pub(crate) fn unresolved_relocation(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::UnresolvedRelocation, msg)
}

#[cold]
#[inline(never)]
pub(crate) fn unsupported_relocation(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::UnsupportedRelocationType, msg)
}

#[cold]
#[inline(never)]
pub(crate) fn state_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::State, msg)
}

#[cold]
#[inline(never)]
pub(crate) fn io_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Io, msg)
}

/// Maximum length of a latched error message, matching the 64-byte buffer
/// the POSIX facade's `dlerror()`-style call reads from.
pub const LATCH_MSG_LEN: usize = 64;

/// A tiny fixed-capacity, UTF-8-safe buffer, avoiding a heap allocation for
/// the common case of a short diagnostic message.
struct Msg {
    buf: [u8; LATCH_MSG_LEN],
    len: usize,
}

impl Msg {
    fn from_str(s: &str) -> Self {
        let bytes = s.as_bytes();
        let mut len = bytes.len().min(LATCH_MSG_LEN);
        // Don't split a multi-byte UTF-8 sequence at the truncation boundary.
        while len > 0 && (bytes[len - 1] & 0b1100_0000) == 0b1000_0000 {
            len -= 1;
        }
        let mut buf = [0u8; LATCH_MSG_LEN];
        buf[..len].copy_from_slice(&bytes[..len]);
        Msg { buf, len }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

/// The thread-shared latch the POSIX facade's `rtl_error()` reads from.
/// Holds the last error set by any failing internal call; reading it clears
/// it, per §7's propagation policy.
pub struct Latch {
    inner: spin::Mutex<Option<(ErrorKind, Msg)>>,
}

impl Latch {
    pub const fn new() -> Self {
        Latch {
            inner: spin::Mutex::new(None),
        }
    }

    /// Latch an error, truncating its message to `LATCH_MSG_LEN` bytes.
    pub fn set(&self, err: &Error) {
        let mut slot = self.inner.lock();
        *slot = Some((err.kind, Msg::from_str(&err.msg)));
    }

    /// Read and clear the latched error's message, or `None` if empty.
    pub fn take_message(&self) -> Option<String> {
        let mut slot = self.inner.lock();
        slot.take().map(|(_, msg)| msg.as_str().into())
    }

    /// Read and clear the latched error's kind, or `None` if empty.
    pub fn take_kind(&self) -> Option<ErrorKind> {
        let mut slot = self.inner.lock();
        slot.take().map(|(kind, _)| kind)
    }

    /// True if an error is currently latched, without clearing it.
    pub fn is_set(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_round_trips_and_clears() {
        let latch = Latch::new();
        assert!(!latch.is_set());
        latch.set(&not_found("object file not found: foo.o"));
        assert!(latch.is_set());
        assert_eq!(latch.take_kind(), Some(ErrorKind::NotFound));
        assert!(!latch.is_set());
    }

    #[test]
    fn latch_truncates_long_messages() {
        let latch = Latch::new();
        let long = "x".repeat(200);
        latch.set(&format_error(long));
        let msg = latch.take_message().unwrap();
        assert!(msg.len() <= LATCH_MSG_LEN);
    }

    #[test]
    fn latch_truncation_does_not_split_utf8() {
        let latch = Latch::new();
        // 64 ascii 'a's followed by a 2-byte UTF-8 character straddling the cut.
        let mut s = "a".repeat(63);
        s.push('é');
        latch.set(&format_error(s));
        let msg = latch.take_message().unwrap();
        assert!(core::str::from_utf8(msg.as_bytes()).is_ok());
    }
}
