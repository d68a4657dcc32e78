//! Host process bridge.
//!
//! Two things only the host can do: open shared objects with its own dynamic
//! loader, and call native code. Both sit behind traits so that embedders and
//! tests can substitute their own.

use std::ffi::{c_char, c_int, c_void};
#[cfg(unix)]
use std::ffi::{CStr, CString};
use std::path::Path;

/// Opaque handle returned by a [`HostLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostHandle(pub u64);

/// The host's dynamic loader.
///
/// Calls are serialized by the linker's dynamic-loader lock.
pub trait HostLoader: Send {
    fn open(&mut self, path: &Path) -> Result<HostHandle, String>;

    /// Looks `name` up in one opened object.
    fn symbol(&mut self, handle: HostHandle, name: &str) -> Option<u64>;

    /// Looks `name` up in the host process itself.
    fn global_symbol(&mut self, _name: &str) -> Option<u64> {
        None
    }

    /// `(tls module id, offset)` of a thread-local, in one opened object or,
    /// with no handle, anywhere in the host process. The id is the host
    /// loader's own, as its `__tls_get_addr` expects.
    fn tls_symbol(&mut self, _handle: Option<HostHandle>, _name: &str) -> Option<(u64, u64)> {
        None
    }

    fn close(&mut self, handle: HostHandle);
}

/// A loader that opens nothing and knows no symbols.
#[derive(Debug, Default)]
pub struct NoHostLoader;

impl HostLoader for NoHostLoader {
    fn open(&mut self, path: &Path) -> Result<HostHandle, String> {
        Err(format!("no host dynamic loader available to open {}", path.display()))
    }

    fn symbol(&mut self, _handle: HostHandle, _name: &str) -> Option<u64> {
        None
    }

    fn close(&mut self, _handle: HostHandle) {}
}

/// `dlopen`/`dlsym` of the running process.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct DlLoader;

#[cfg(unix)]
impl DlLoader {
    fn lookup(handle: *mut c_void, name: &str) -> Option<u64> {
        let name = CString::new(name).ok()?;
        // SAFETY: `handle` came from dlopen or is RTLD_DEFAULT; `name` is NUL terminated.
        let address = unsafe { libc::dlsym(handle, name.as_ptr()) };
        (!address.is_null()).then_some(address as u64)
    }

    fn raw(handle: Option<HostHandle>) -> *mut c_void {
        handle.map_or(libc::RTLD_DEFAULT, |handle| handle.0 as *mut c_void)
    }
}

#[cfg(unix)]
impl HostLoader for DlLoader {
    fn open(&mut self, path: &Path) -> Result<HostHandle, String> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| e.to_string())?;
        // SAFETY: `c_path` is NUL terminated and outlives the call.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            // SAFETY: dlerror returns NULL or a string valid until the next dl call.
            let reason = unsafe {
                let err = libc::dlerror();
                if err.is_null() {
                    "unknown error".to_string()
                } else {
                    CStr::from_ptr(err).to_string_lossy().into_owned()
                }
            };
            return Err(format!("{}: {reason}", path.display()));
        }
        Ok(HostHandle(handle as u64))
    }

    fn symbol(&mut self, handle: HostHandle, name: &str) -> Option<u64> {
        Self::lookup(Self::raw(Some(handle)), name)
    }

    fn global_symbol(&mut self, name: &str) -> Option<u64> {
        Self::lookup(Self::raw(None), name)
    }

    /// dlsym yields the calling thread's instance; the object whose TLS block
    /// holds it gives the module id and the offset.
    #[cfg(target_os = "linux")]
    fn tls_symbol(&mut self, handle: Option<HostHandle>, name: &str) -> Option<(u64, u64)> {
        let address = Self::lookup(Self::raw(handle), name)?;
        tls_block_containing(address)
    }

    fn close(&mut self, handle: HostHandle) {
        // SAFETY: handles are only ever produced by `open` and closed once.
        unsafe {
            libc::dlclose(handle.0 as *mut c_void);
        }
    }
}

/// Finds the loaded object whose TLS block, for this thread, contains `address`.
#[cfg(target_os = "linux")]
fn tls_block_containing(address: u64) -> Option<(u64, u64)> {
    struct Search {
        address: u64,
        found: Option<(u64, u64)>,
    }

    unsafe extern "C" fn visit(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut c_void) -> c_int {
        // SAFETY: the loader passes a valid entry for the duration of the call,
        // and `data` is the `Search` below.
        let (info, search) = unsafe { (&*info, &mut *data.cast::<Search>()) };
        if info.dlpi_tls_modid == 0 || info.dlpi_tls_data.is_null() || info.dlpi_phdr.is_null() {
            return 0;
        }
        // SAFETY: `dlpi_phdr` points at `dlpi_phnum` program headers.
        let headers = unsafe { std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) };
        let Some(tls) = headers.iter().find(|h| h.p_type == libc::PT_TLS) else {
            return 0;
        };
        let start = info.dlpi_tls_data as u64;
        if (start..start + tls.p_memsz as u64).contains(&search.address) {
            search.found = Some((info.dlpi_tls_modid as u64, search.address - start));
            return 1;
        }
        0
    }

    let mut search = Search { address, found: None };
    // SAFETY: `visit` only touches `search`, which outlives the walk.
    unsafe {
        libc::dl_iterate_phdr(Some(visit), (&mut search as *mut Search).cast());
    }
    search.found
}

/// Calls a module's initializers and finalizers.
pub trait InitInvoker: Send {
    fn invoke(&mut self, address: u64) -> Result<(), String>;
}

type InitFn = extern "C" fn(c_int, *const *const c_char, *const *const c_char);

/// Calls the address directly, as `main`-style `(argc, argv, envp)` with no arguments.
#[derive(Debug, Default)]
pub struct NativeInvoker;

impl InitInvoker for NativeInvoker {
    fn invoke(&mut self, address: u64) -> Result<(), String> {
        if address == 0 {
            return Err("null initializer".to_string());
        }
        tracing::debug!(address = format_args!("{address:#x}"), "calling initializer");
        // SAFETY: the linker only passes addresses inside executable segments it placed.
        let f: InitFn = unsafe { std::mem::transmute(address as usize) };
        f(0, std::ptr::null(), std::ptr::null());
        Ok(())
    }
}
