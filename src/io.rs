//! Host file I/O seam.
//!
//! The core never opens a file itself; everything it needs from a backing
//! object file or archive comes through [`RtlFile`], matching the teacher's
//! `ElfObject`-style host trait seam. The `std` feature supplies a ready
//! backend over `std::fs::File` so the crate is directly usable and
//! testable hosted.
use alloc::string::String;

/// A readable, seekable object the loaders pull bytes from. Implementors
/// need not be `Send`/`Sync`; the façade above this trait owns locking.
pub trait RtlFile {
    /// Read up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read (short reads are only valid at EOF).
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, String>;

    /// Total length of the file in bytes.
    fn len(&mut self) -> Result<u64, String>;

    fn is_empty(&mut self) -> Result<bool, String> {
        Ok(self.len()? == 0)
    }
}

use alloc::boxed::Box;

/// Host filesystem seam: resolves a search-path entry plus object name into
/// an open [`RtlFile`], and answers whether a path exists (§4.8 step 3:
/// "searching each `:`-separated entry of `paths` with a `stat`").
pub trait RtlFs {
    fn exists(&self, path: &str) -> bool;
    fn open(&self, path: &str) -> Result<Box<dyn RtlFile>, String>;
}

#[cfg(feature = "std")]
mod std_backend {
    use super::{RtlFile, RtlFs};
    use alloc::boxed::Box;
    use alloc::string::{String, ToString};
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};
    use std::path::Path;

    /// Host file backend over `std::fs::File`.
    pub struct StdFile {
        file: File,
    }

    impl StdFile {
        pub fn open(path: &Path) -> Result<Self, String> {
            let file = File::open(path).map_err(|e| e.to_string())?;
            Ok(StdFile { file })
        }
    }

    impl RtlFile for StdFile {
        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, String> {
            self.file
                .seek(SeekFrom::Start(offset))
                .map_err(|e| e.to_string())?;
            let mut total = 0;
            while total < buf.len() {
                match self.file.read(&mut buf[total..]) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(e) => return Err(e.to_string()),
                }
            }
            Ok(total)
        }

        fn len(&mut self) -> Result<u64, String> {
            self.file.metadata().map(|m| m.len()).map_err(|e| e.to_string())
        }
    }

    /// Host filesystem backend over `std::fs`.
    pub struct StdFs;

    impl RtlFs for StdFs {
        fn exists(&self, path: &str) -> bool {
            Path::new(path).is_file()
        }

        fn open(&self, path: &str) -> Result<Box<dyn RtlFile>, String> {
            StdFile::open(Path::new(path)).map(|f| Box::new(f) as Box<dyn RtlFile>)
        }
    }
}

#[cfg(feature = "std")]
pub use std_backend::{StdFile, StdFs};

#[cfg(test)]
pub(crate) mod tests {
    use super::{RtlFile, RtlFs};
    use alloc::boxed::Box;
    use alloc::string::{String, ToString};
    use alloc::vec::Vec;
    use hashbrown::HashMap;

    /// An in-memory `RtlFile` for tests that don't need real files.
    pub struct MemFile {
        data: Vec<u8>,
    }

    impl MemFile {
        pub fn new(data: Vec<u8>) -> Self {
            MemFile { data }
        }
    }

    impl RtlFile for MemFile {
        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, String> {
            let offset = offset as usize;
            if offset >= self.data.len() {
                return Ok(0);
            }
            let avail = &self.data[offset..];
            let n = avail.len().min(buf.len());
            buf[..n].copy_from_slice(&avail[..n]);
            Ok(n)
        }

        fn len(&mut self) -> Result<u64, String> {
            Ok(self.data.len() as u64)
        }
    }

    /// An in-memory filesystem for RTL façade tests: a fixed table of
    /// path -> bytes, nothing else resolves.
    #[derive(Default)]
    pub struct MemFs {
        files: HashMap<String, Vec<u8>>,
    }

    impl MemFs {
        pub fn new() -> Self {
            MemFs::default()
        }

        pub fn with_file(mut self, path: &str, data: Vec<u8>) -> Self {
            self.files.insert(path.to_string(), data);
            self
        }
    }

    impl RtlFs for MemFs {
        fn exists(&self, path: &str) -> bool {
            self.files.contains_key(path)
        }

        fn open(&self, path: &str) -> Result<Box<dyn RtlFile>, String> {
            self.files
                .get(path)
                .map(|data| Box::new(MemFile::new(data.clone())) as Box<dyn RtlFile>)
                .ok_or_else(|| alloc::format!("no such file: {path}"))
        }
    }
}
