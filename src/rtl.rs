//! RTL façade & object lifecycle (§4.8, §5).
use crate::archive::locate_member;
use crate::cache::{Caches, DEFAULT_CACHE_SIZE};
use crate::elf;
use crate::error::{not_found, state_error, Error, Latch, Result};
use crate::io::RtlFs;
use crate::object::{Object, ObjFlags};
use crate::rap::{self, loader::RapPlatform};
use crate::reloc::{NativeBackend, RelocBackend};
use crate::symtab::SymTab;
use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// Tunables collected for one RTL instance (§D of the expanded spec).
#[derive(Debug, Clone)]
pub struct RtlConfig {
    cache_size: usize,
    symbol_buckets: usize,
    search_path: String,
}

impl RtlConfig {
    pub const fn new() -> Self {
        RtlConfig {
            cache_size: DEFAULT_CACHE_SIZE,
            symbol_buckets: 64,
            search_path: String::new(),
        }
    }

    pub fn with_cache_size(mut self, n: usize) -> Self {
        self.cache_size = n;
        self
    }

    pub fn with_symbol_buckets(mut self, n: usize) -> Self {
        self.symbol_buckets = n;
        self
    }
}

impl Default for RtlConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Points the debugger-rendezvous hook can be called at (§4.8, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEvent {
    BeforeAdd,
    AfterAdd,
    BeforeDelete,
    AfterDelete,
}

/// An intentionally empty, never-inlined hook a debugger may set a
/// breakpoint on; reproduces the source RTL's rendezvous stub.
#[inline(never)]
pub fn debugger_notify(_event: DebugEvent) {}

/// Opaque handle to a loaded object, or the base image. §6.1 reserves `0`
/// for the base image.
pub type Handle = u64;

pub const BASE_IMAGE_HANDLE: Handle = 0;

/// Host collaborators an `Rtl` instance needs beyond what this crate
/// implements itself: where to find files, and which relocation
/// arithmetic to apply.
pub struct Rtl {
    fs: Box<dyn RtlFs>,
    backend: Box<dyn RelocBackend>,
    base: Object,
    objects: Vec<Object>,
    globals: SymTab,
    caches: Caches,
    paths: String,
    next_id: u64,
    error: Latch,
}

impl Rtl {
    fn new(config: RtlConfig, fs: Box<dyn RtlFs>, backend: Box<dyn RelocBackend>) -> Self {
        let search_path = if config.search_path.is_empty() {
            ".".to_string()
        } else {
            config.search_path.clone()
        };
        Rtl {
            fs,
            backend,
            base: Object::new(BASE_IMAGE_HANDLE, "rtems-kernel".into(), None, String::new()),
            objects: Vec::new(),
            globals: SymTab::new(config.symbol_buckets),
            caches: Caches::new(config.cache_size),
            paths: search_path,
            next_id: 1,
            error: Latch::new(),
        }
    }

    /// Export a symbol from the base image (the host's own exports), so
    /// loaded objects can resolve against it. Intended to be called once,
    /// right after `init`, before any `load_object`.
    pub fn add_base_symbol(&mut self, name: &str, value: usize) -> Result<()> {
        self.globals
            .insert(name, value, BASE_IMAGE_HANDLE, crate::symtab::SymFlags::empty())
    }

    pub fn path_append(&mut self, path: &str) {
        if !self.paths.is_empty() {
            self.paths.push(':');
        }
        self.paths.push_str(path);
    }

    pub fn path_prepend(&mut self, path: &str) {
        let mut new_paths = String::from(path);
        if !self.paths.is_empty() {
            new_paths.push(':');
            new_paths.push_str(&self.paths);
        }
        self.paths = new_paths;
    }

    /// Read and clear the latched error message, if any.
    pub fn take_error(&self) -> Option<String> {
        self.error.take_message()
    }

    fn latch(&self, err: Error) -> Error {
        self.error.set(&err);
        err
    }

    fn find_by_name(&self, oname: &str) -> Option<Handle> {
        self.objects.iter().find(|o| o.oname == oname).map(|o| o.id)
    }

    pub fn handle_by_name(&self, oname: &str) -> Option<Handle> {
        if oname.is_empty() {
            return Some(BASE_IMAGE_HANDLE);
        }
        self.find_by_name(oname)
    }

    fn object_mut(&mut self, handle: Handle) -> Option<&mut Object> {
        if handle == BASE_IMAGE_HANDLE {
            Some(&mut self.base)
        } else {
            self.objects.iter_mut().find(|o| o.id == handle)
        }
    }

    fn object(&self, handle: Handle) -> Option<&Object> {
        if handle == BASE_IMAGE_HANDLE {
            Some(&self.base)
        } else {
            self.objects.iter().find(|o| o.id == handle)
        }
    }

    fn resolve_path(&self, oname: &str) -> Result<String> {
        for entry in self.paths.split(':') {
            let candidate = if entry.is_empty() || entry == "." {
                String::from(oname)
            } else {
                alloc::format!("{entry}/{oname}")
            };
            if self.fs.exists(&candidate) {
                return Ok(candidate);
            }
        }
        Err(not_found(alloc::format!("object file not found: {oname}")))
    }

    /// §4.8 `load_object`: parse the name, resolve the file, dispatch on
    /// format, run constructors, and return the object's handle.
    pub fn load_object(&mut self, name: &str) -> Result<Handle> {
        let parsed = crate::object::parse_object_name(name).map_err(|e| self.latch(e))?;

        let oname = parsed.object.to_string();
        if let Some(existing) = self.find_by_name(&oname) {
            if let Some(obj) = self.objects.iter_mut().find(|o| o.id == existing) {
                obj.users += 1;
            }
            #[cfg(feature = "log")]
            log::trace!("[load_object] {oname} already loaded, bumping refcount on handle {existing}");
            return Ok(existing);
        }

        let fname = match parsed.archive {
            Some(archive) => self.resolve_path(archive).map_err(|e| self.latch(e))?,
            None => self.resolve_path(&oname).map_err(|e| self.latch(e))?,
        };

        let id = self.next_id;
        self.next_id += 1;
        let mut obj = Object::new(id, oname.clone(), parsed.archive.map(String::from), fname.clone());

        debugger_notify(DebugEvent::BeforeAdd);

        let result = self.load_into(&mut obj, &parsed);
        if let Err(e) = result {
            // Unwind any symbols this object managed to insert before the
            // failure (§7: partial state is unwound before returning).
            self.globals.erase_owner(id);
            #[cfg(feature = "log")]
            log::debug!("[load_object] {oname} failed to load: {e}");
            let e = self.latch(e);
            return Err(e);
        }

        obj.users = 1;
        obj.flags |= ObjFlags::LOCKED;
        self.run_ctors(&obj);
        obj.flags.remove(ObjFlags::LOCKED);

        #[cfg(feature = "log")]
        log::debug!("[load_object] {oname} loaded as handle {id}");
        self.objects.push(obj);
        debugger_notify(DebugEvent::AfterAdd);
        Ok(id)
    }

    fn load_into(&mut self, obj: &mut Object, parsed: &crate::object::ObjectName<'_>) -> Result<()> {
        let mut file = self.fs.open(&obj.fname).map_err(crate::error::io_error)?;

        if let Some(_archive) = parsed.archive {
            let loc = locate_member(file.as_mut(), &mut self.caches.symbols, parsed.object, parsed.offset)?;
            obj.ooffset = loc.offset;
            obj.fsize = loc.size;
        }

        let mut magic = [0u8; 4];
        let _ = file.read_at(obj.ooffset, &mut magic);
        self.caches.flush();

        if &magic[0..4] == b"\x7FELF" {
            elf::loader::load(
                obj,
                &mut OffsetFile {
                    inner: file.as_mut(),
                    base: obj.ooffset,
                },
                &mut self.caches,
                &elf::Platform::X86_64,
                &mut self.globals,
                self.backend.as_ref(),
            )?;
        } else if &magic[0..3] == b"RAP" {
            rap::loader::load(
                obj,
                &mut OffsetFile {
                    inner: file.as_mut(),
                    base: obj.ooffset,
                },
                &RAP_X86_64,
                &mut self.globals,
                self.backend.as_ref(),
            )?;
        } else {
            return Err(crate::error::format_error("unrecognized object format"));
        }

        self.caches.flush();
        Ok(())
    }

    fn run_ctors(&self, obj: &Object) {
        for section in obj.ctor_sections() {
            run_fn_array(section);
        }
    }

    fn run_dtors(&self, obj: &Object) {
        for section in obj.dtor_sections() {
            run_fn_array(section);
        }
    }

    /// §4.8 `unload_object`.
    pub fn unload_object(&mut self, handle: Handle) -> Result<()> {
        if handle == BASE_IMAGE_HANDLE {
            return Err(self.latch(state_error("the base image cannot be unloaded")));
        }
        let Some(obj) = self.object(handle) else {
            return Err(self.latch(state_error("invalid object handle")));
        };
        if obj.flags.contains(ObjFlags::LOCKED) {
            return Err(self.latch(state_error("object is locked (mid constructor/destructor)")));
        }

        let users = obj.users;
        if users > 1 {
            if let Some(obj) = self.object_mut(handle) {
                obj.users -= 1;
            }
            return Ok(());
        }

        debugger_notify(DebugEvent::BeforeDelete);
        if let Some(obj) = self.object_mut(handle) {
            obj.flags |= ObjFlags::LOCKED;
        }
        if let Some(obj) = self.object(handle) {
            self.run_dtors(obj);
        }
        if let Some(obj) = self.object_mut(handle) {
            obj.flags.remove(ObjFlags::LOCKED);
        }

        self.globals.erase_owner(handle);
        if let Some(pos) = self.objects.iter().position(|o| o.id == handle) {
            #[cfg(feature = "log")]
            log::debug!("[unload_object] {} unloaded (handle {handle})", self.objects[pos].oname);
            self.objects.remove(pos);
        }
        debugger_notify(DebugEvent::AfterDelete);
        Ok(())
    }

    /// §6.1 `sym`: look up a name either in a specific object's own table
    /// or, for the base image / default handles, the global table.
    pub fn sym(&self, handle: Handle, name: &str) -> Option<usize> {
        if handle == BASE_IMAGE_HANDLE {
            return self.globals.lookup(name).map(|e| e.value);
        }
        let obj = self.objects.iter().find(|o| o.id == handle)?;
        obj.global_table.iter().find(|s| s.name == name).map(|s| s.value)
    }

    /// §6.1 `info` with `request = UNRESOLVED`.
    pub fn is_unresolved(&self, handle: Handle) -> Option<bool> {
        self.object(handle).map(|o| o.flags.contains(ObjFlags::UNRESOLVED))
    }
}

const RAP_X86_64: RapPlatform = RapPlatform {
    machine_type: 62, // EM_X86_64
    data_type: 1,      // little-endian
    class: 64,
};

/// A constructor/destructor array is a run of function-pointer-sized
/// entries; null entries are skipped (§4.8).
fn run_fn_array(section: &crate::object::Section) {
    let Some(base) = section.base else { return };
    let count = section.size / core::mem::size_of::<usize>();
    for i in 0..count {
        let slot = unsafe { ((base + i * core::mem::size_of::<usize>()) as *const usize).read() };
        if slot == 0 {
            continue;
        }
        let f: extern "C" fn() = unsafe { core::mem::transmute(slot) };
        #[cfg(feature = "log")]
        log::trace!("[{}] calling entry at 0x{slot:x}", section.name);
        f();
    }
}

/// A view over a backing file that rebases every read by a fixed offset,
/// so the ELF/RAP loaders can treat an archive member as if it were its
/// own standalone file (§4.8 step 5/6: archive members are dispatched
/// through the same format loaders as plain files).
struct OffsetFile<'a> {
    inner: &'a mut dyn crate::io::RtlFile,
    base: u64,
}

impl<'a> crate::io::RtlFile for OffsetFile<'a> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> core::result::Result<usize, String> {
        self.inner.read_at(self.base + offset, buf)
    }

    fn len(&mut self) -> core::result::Result<u64, String> {
        Ok(self.inner.len()?.saturating_sub(self.base))
    }
}

/// Construct an `Rtl` instance directly (tests, or a host managing its own
/// singleton lifetime outside the `spin::Once` helper below).
pub fn new_rtl(config: RtlConfig, fs: Box<dyn RtlFs>, backend: Box<dyn RelocBackend>) -> Rtl {
    Rtl::new(config, fs, backend)
}

static INSTANCE: spin::Once<spin::Mutex<Rtl>> = spin::Once::new();

/// Lazily create the process-wide RTL singleton under `std`, using the
/// default host filesystem and the native relocation back-end. Repeated
/// calls return the same instance; the configuration from the first call
/// wins (§5: "lazily-initialised... teardown-forbidden").
#[cfg(feature = "std")]
pub fn instance(config: RtlConfig) -> &'static spin::Mutex<Rtl> {
    INSTANCE.call_once(|| {
        spin::Mutex::new(Rtl::new(
            config,
            Box::new(crate::io::StdFs),
            Box::new(NativeBackend),
        ))
    })
}

/// Like [`instance`], for a `no_std` host supplying its own filesystem.
pub fn instance_with_fs(config: RtlConfig, fs: Box<dyn RtlFs>) -> &'static spin::Mutex<Rtl> {
    INSTANCE.call_once(|| spin::Mutex::new(Rtl::new(config, fs, Box::new(NativeBackend))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tests::MemFs;

    #[test]
    fn load_object_missing_file_reports_not_found() {
        let fs = MemFs::new();
        let mut rtl = new_rtl(RtlConfig::new(), Box::new(fs), Box::new(NativeBackend));
        let err = rtl.load_object("missing.o").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        assert!(rtl.take_error().unwrap().starts_with("object file not found"));
    }

    #[test]
    fn path_append_and_prepend_build_colon_list() {
        let fs = MemFs::new();
        let mut rtl = new_rtl(RtlConfig::new(), Box::new(fs), Box::new(NativeBackend));
        rtl.path_append("/lib");
        rtl.path_prepend("/opt");
        assert_eq!(rtl.paths, "/opt:.:/lib");
    }

    #[test]
    fn base_image_handle_is_zero_and_always_present() {
        let fs = MemFs::new();
        let rtl = new_rtl(RtlConfig::new(), Box::new(fs), Box::new(NativeBackend));
        assert_eq!(rtl.handle_by_name(""), Some(BASE_IMAGE_HANDLE));
    }

    #[test]
    fn unload_base_image_is_rejected() {
        let fs = MemFs::new();
        let mut rtl = new_rtl(RtlConfig::new(), Box::new(fs), Box::new(NativeBackend));
        let err = rtl.unload_object(BASE_IMAGE_HANDLE).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::State);
    }

    #[test]
    fn unload_unknown_handle_is_state_error() {
        let fs = MemFs::new();
        let mut rtl = new_rtl(RtlConfig::new(), Box::new(fs), Box::new(NativeBackend));
        let err = rtl.unload_object(42).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::State);
    }

    #[test]
    fn base_symbol_resolves_through_sym() {
        let fs = MemFs::new();
        let mut rtl = new_rtl(RtlConfig::new(), Box::new(fs), Box::new(NativeBackend));
        rtl.add_base_symbol("kernel_exported_symbol", 0x4000).unwrap();
        assert_eq!(rtl.sym(BASE_IMAGE_HANDLE, "kernel_exported_symbol"), Some(0x4000));
    }

    fn be32(v: u32) -> [u8; 4] {
        v.to_be_bytes()
    }

    /// A RAP stream exporting a single strong symbol named `name` from
    /// `.text`, no relocations.
    fn build_rap(name: &str) -> Vec<u8> {
        let text = alloc::vec![0x90u8; 8];
        let strtab = {
            let mut s = name.as_bytes().to_vec();
            s.push(0);
            s
        };

        let mut stream = Vec::new();
        stream.extend_from_slice(&be32(62));
        stream.extend_from_slice(&be32(1));
        stream.extend_from_slice(&be32(64));
        stream.extend_from_slice(&be32(0));
        stream.extend_from_slice(&be32(0));
        stream.extend_from_slice(&be32(12)); // symtab_size: one triple
        stream.extend_from_slice(&be32(strtab.len() as u32));
        stream.extend_from_slice(&be32(6 * 4));

        let pairs = [(text.len() as u32, 4u32), (0, 0), (0, 0), (0, 0), (0, 0), (0, 0)];
        for (size, align) in pairs {
            stream.extend_from_slice(&be32(size));
            stream.extend_from_slice(&be32(align));
        }
        stream.extend_from_slice(&text);
        stream.extend_from_slice(&strtab);

        let data_word = (0u32 << 16) | ((1u32 << 8) | 2); // section 0, GLOBAL, FUNC
        stream.extend_from_slice(&be32(data_word));
        stream.extend_from_slice(&be32(0));
        stream.extend_from_slice(&be32(0));

        for _ in 0..6 {
            stream.extend_from_slice(&be32(0));
        }

        let declen = stream.len();
        let header = alloc::format!("RAP,{declen},1,NONE,0\n");
        let mut out = header.into_bytes();
        out.extend_from_slice(&stream);
        out
    }

    /// Two strong definitions of the same symbol name, so the second
    /// object's load fails partway through symbol ingestion.
    fn build_rap_two_symbols(a: &str, b: &str) -> Vec<u8> {
        let text = alloc::vec![0x90u8; 8];
        let strtab = {
            let mut s = Vec::new();
            s.extend_from_slice(a.as_bytes());
            s.push(0);
            s.extend_from_slice(b.as_bytes());
            s.push(0);
            s
        };
        let b_off = a.len() as u32 + 1;

        let mut stream = Vec::new();
        stream.extend_from_slice(&be32(62));
        stream.extend_from_slice(&be32(1));
        stream.extend_from_slice(&be32(64));
        stream.extend_from_slice(&be32(0));
        stream.extend_from_slice(&be32(0));
        stream.extend_from_slice(&be32(24)); // symtab_size: two triples
        stream.extend_from_slice(&be32(strtab.len() as u32));
        stream.extend_from_slice(&be32(6 * 4));

        let pairs = [(text.len() as u32, 4u32), (0, 0), (0, 0), (0, 0), (0, 0), (0, 0)];
        for (size, align) in pairs {
            stream.extend_from_slice(&be32(size));
            stream.extend_from_slice(&be32(align));
        }
        stream.extend_from_slice(&text);
        stream.extend_from_slice(&strtab);

        let data_word = (0u32 << 16) | ((1u32 << 8) | 2);
        stream.extend_from_slice(&be32(data_word));
        stream.extend_from_slice(&be32(0));
        stream.extend_from_slice(&be32(0));
        stream.extend_from_slice(&be32(data_word));
        stream.extend_from_slice(&be32(b_off));
        stream.extend_from_slice(&be32(0));

        for _ in 0..6 {
            stream.extend_from_slice(&be32(0));
        }

        let declen = stream.len();
        let header = alloc::format!("RAP,{declen},1,NONE,0\n");
        let mut out = header.into_bytes();
        out.extend_from_slice(&stream);
        out
    }

    #[test]
    fn load_then_unload_restores_the_global_symbol_table() {
        let fs = MemFs::new().with_file("a.rap", build_rap("solo_symbol"));
        let mut rtl = new_rtl(RtlConfig::new(), Box::new(fs), Box::new(NativeBackend));

        let handle = rtl.load_object("a.rap").unwrap();
        assert_eq!(rtl.sym(BASE_IMAGE_HANDLE, "solo_symbol").is_some(), true);

        rtl.unload_object(handle).unwrap();
        assert!(rtl.sym(BASE_IMAGE_HANDLE, "solo_symbol").is_none());
        // The object is gone, so a second unload sees an invalid handle.
        let err = rtl.unload_object(handle).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::State);
    }

    #[test]
    fn two_opens_require_two_closes_to_release() {
        let fs = MemFs::new().with_file("a.rap", build_rap("shared_symbol"));
        let mut rtl = new_rtl(RtlConfig::new(), Box::new(fs), Box::new(NativeBackend));

        let first = rtl.load_object("a.rap").unwrap();
        let second = rtl.load_object("a.rap").unwrap();
        assert_eq!(first, second);

        rtl.unload_object(first).unwrap();
        assert!(rtl.sym(BASE_IMAGE_HANDLE, "shared_symbol").is_some(), "still held open by the second user");

        rtl.unload_object(first).unwrap();
        assert!(rtl.sym(BASE_IMAGE_HANDLE, "shared_symbol").is_none());
    }

    #[test]
    fn failed_load_unwinds_partially_inserted_symbols() {
        let fs = MemFs::new()
            .with_file("first.rap", build_rap("dup_symbol"))
            .with_file("second.rap", build_rap_two_symbols("other_symbol", "dup_symbol"));
        let mut rtl = new_rtl(RtlConfig::new(), Box::new(fs), Box::new(NativeBackend));

        rtl.load_object("first.rap").unwrap();
        let err = rtl.load_object("second.rap").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DuplicateSymbol);

        // `second.rap`'s own first symbol must not have survived the unwind.
        assert!(rtl.handle_by_name("second.rap").is_none());
        assert_eq!(rtl.sym(BASE_IMAGE_HANDLE, "other_symbol"), None);
        // The first object's definition is untouched.
        assert!(rtl.sym(BASE_IMAGE_HANDLE, "dup_symbol").is_some());
    }
}
