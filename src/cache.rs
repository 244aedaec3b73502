//! Bounded read-ahead caches for streaming loaders (§4.2).
//!
//! Three caches exist so fills for section headers/symbols, string bytes,
//! and relocation records don't thrash each other while a loader streams
//! through a single file.
use crate::error::{io_error, Result};
use crate::io::RtlFile;
use alloc::vec;
use alloc::vec::Vec;

/// Default buffer size for each cache (§4.2: "2048 bytes is a reasonable
/// default").
pub const DEFAULT_CACHE_SIZE: usize = 2048;

/// A single fixed-size, single-file read-ahead buffer.
///
/// Not reentrant: a cache holds at most one open file's data at a time.
/// Callers must finish one loader pass (and call [`Cache::flush`]) before
/// starting another against a different file.
pub struct Cache {
    buf: Vec<u8>,
    /// Offset in the file the buffer's first byte corresponds to.
    base: u64,
    /// Number of valid bytes currently in `buf`, starting at index 0.
    valid: usize,
}

impl Cache {
    pub fn new(size: usize) -> Self {
        Cache {
            buf: vec![0u8; size.max(1)],
            base: 0,
            valid: 0,
        }
    }

    #[inline]
    fn contains(&self, offset: u64, len: usize) -> bool {
        self.valid > 0
            && offset >= self.base
            && (offset - self.base) as usize + len <= self.valid
    }

    fn fill(&mut self, file: &mut dyn RtlFile, offset: u64) -> Result<()> {
        let n = file
            .read_at(offset, &mut self.buf)
            .map_err(|e| io_error(alloc::format!("cache fill failed: {e}")))?;
        self.base = offset;
        self.valid = n;
        Ok(())
    }

    /// Return a slice into the cache covering up to `*len` bytes starting
    /// at `offset`, refilling the cache if the range isn't already
    /// resident. If the requested length exceeds the cache's capacity,
    /// `*len` is reduced to what the cache can hold — string reads are
    /// thus bounded by the cache size.
    pub fn read<'a>(
        &'a mut self,
        file: &mut dyn RtlFile,
        offset: u64,
        len: &mut usize,
    ) -> Result<&'a [u8]> {
        *len = (*len).min(self.buf.len());
        if !self.contains(offset, *len) {
            self.fill(file, offset)?;
        }
        let start = (offset - self.base) as usize;
        let available = self.valid.saturating_sub(start);
        *len = (*len).min(available);
        if *len == 0 && self.valid == 0 {
            return Err(io_error("short read past end of file"));
        }
        Ok(&self.buf[start..start + *len])
    }

    /// Copy exactly `dst.len()` bytes starting at `offset` into `dst`,
    /// refilling as needed. Used for fixed-size records whose lifetime must
    /// outlive the cache's next fill.
    pub fn read_into(&mut self, file: &mut dyn RtlFile, offset: u64, dst: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < dst.len() {
            let mut want = dst.len() - done;
            let chunk = self.read(file, offset + done as u64, &mut want)?;
            if chunk.is_empty() {
                return Err(io_error("short read past end of file"));
            }
            dst[done..done + chunk.len()].copy_from_slice(chunk);
            done += chunk.len();
        }
        Ok(())
    }

    /// Invalidate the cache's contents without releasing its buffer.
    pub fn flush(&mut self) {
        self.valid = 0;
        self.base = 0;
    }
}

/// The three caches a loader uses while streaming a single object: one for
/// section headers and symbol table entries, one for string bytes, and one
/// for relocation records.
pub struct Caches {
    pub symbols: Cache,
    pub strings: Cache,
    pub relocs: Cache,
}

impl Caches {
    pub fn new(size: usize) -> Self {
        Caches {
            symbols: Cache::new(size),
            strings: Cache::new(size),
            relocs: Cache::new(size),
        }
    }

    /// Invalidate all three caches; called between separate file
    /// operations (§4.2: `caches_flush`).
    pub fn flush(&mut self) {
        self.symbols.flush();
        self.strings.flush();
        self.relocs.flush();
    }
}
