//! Virtual memory primitives.
//!
//! The linker never dereferences an address it hands out. All of its writes go
//! through a `Region`, which owns the backing storage and remembers the access
//! mode it was last given. A region refuses writes unless it is writable, so a
//! segment that has been downgraded to read-execute cannot be patched again.

use std::io;
#[cfg(unix)]
use std::ptr::NonNull;

/// Page access modes a segment can end up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryAccess {
    NoAccess,
    ReadOnly,
    ReadWrite,
    ReadExecute,
}

impl MemoryAccess {
    pub fn is_writable(self) -> bool {
        self == MemoryAccess::ReadWrite
    }

    pub fn is_executable(self) -> bool {
        self == MemoryAccess::ReadExecute
    }

    #[cfg(unix)]
    fn prot(self) -> libc::c_int {
        match self {
            MemoryAccess::NoAccess => libc::PROT_NONE,
            MemoryAccess::ReadOnly => libc::PROT_READ,
            MemoryAccess::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            MemoryAccess::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
        }
    }
}

/// An anonymous mapping, unmapped when dropped.
#[cfg(unix)]
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is owned by exactly one region and only reached through it.
#[cfg(unix)]
unsafe impl Send for Mapping {}

#[cfg(unix)]
impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `ptr..ptr + len` came from mmap and nothing borrows it past the region.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

enum Storage {
    /// Plain bytes. `offset` skips the slack used to align `base`.
    Heap { buf: Box<[u8]>, offset: usize },
    #[cfg(unix)]
    Mapped(Mapping),
}

/// A contiguous reservation handed out by a [`MemoryProvider`].
pub struct Region {
    base: u64,
    len: usize,
    access: MemoryAccess,
    storage: Storage,
}

impl Region {
    /// A heap-backed region reported at `base`.
    ///
    /// `base` is only a label: the bytes live wherever the allocator put them.
    /// Providers that simulate an address space use this; such regions must
    /// never be executed.
    pub fn detached(base: u64, len: usize, access: MemoryAccess) -> Self {
        Self {
            base,
            len,
            access,
            storage: Storage::Heap {
                buf: vec![0; len].into_boxed_slice(),
                offset: 0,
            },
        }
    }

    /// A heap allocation whose reported base is its real, `align`-aligned address.
    pub fn heap(len: usize, align: usize) -> Self {
        let buf = vec![0u8; len + align].into_boxed_slice();
        let offset = buf.as_ptr().align_offset(align.max(1));
        let base = buf.as_ptr() as u64 + offset as u64;
        Self {
            base,
            len,
            access: MemoryAccess::ReadWrite,
            storage: Storage::Heap { buf, offset },
        }
    }

    #[cfg(unix)]
    fn mapped(mapping: Mapping) -> Self {
        Self {
            base: mapping.ptr.as_ptr() as u64,
            len: mapping.len,
            access: MemoryAccess::ReadWrite,
            storage: Storage::Mapped(mapping),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> u64 {
        self.base + self.len as u64
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.base..self.end()).contains(&address)
    }

    pub fn access(&self) -> MemoryAccess {
        self.access
    }

    /// Records a new access mode without touching the storage.
    /// For providers whose storage has no protection of its own.
    pub fn set_access(&mut self, access: MemoryAccess) {
        self.access = access;
    }

    /// The region's contents. Empty for a mapping that is currently no-access.
    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Heap { buf, offset } => &buf[*offset..*offset + self.len],
            #[cfg(unix)]
            Storage::Mapped(_) if self.access == MemoryAccess::NoAccess => &[],
            // SAFETY: the mapping is readable and lives as long as `self`.
            #[cfg(unix)]
            Storage::Mapped(m) => unsafe { std::slice::from_raw_parts(m.ptr.as_ptr(), m.len) },
        }
    }

    /// The region's contents for writing, or `None` unless it is currently writable.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        if !self.access.is_writable() {
            return None;
        }
        match &mut self.storage {
            Storage::Heap { buf, offset } => Some(&mut buf[*offset..*offset + self.len]),
            // SAFETY: the mapping is writable and `&mut self` makes this the only view.
            #[cfg(unix)]
            Storage::Mapped(m) => Some(unsafe { std::slice::from_raw_parts_mut(m.ptr.as_ptr(), m.len) }),
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &format_args!("{:#x}", self.len))
            .field("access", &self.access)
            .finish()
    }
}

/// Source of the memory modules are placed in.
pub trait MemoryProvider: Send {
    /// Whether regions are real mappings whose protection can change.
    /// Without one the linker falls back to heap placement.
    fn can_map(&self) -> bool {
        true
    }

    /// Reserves `size` bytes, writable, preferably at `hint`.
    fn reserve(&mut self, size: usize, hint: Option<u64>) -> io::Result<Region>;

    /// Changes the access mode of a whole region.
    fn protect(&mut self, region: &mut Region, access: MemoryAccess) -> io::Result<()>;

    /// Gives a region back.
    fn release(&mut self, region: Region);
}

/// Anonymous private mappings from `mmap(2)`.
///
/// The hint is passed to the kernel without `MAP_FIXED`: a free hint is
/// honoured, an occupied one is not, and existing mappings are never replaced.
/// The placement policy checks every region it gets back.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct MmapProvider;

#[cfg(unix)]
impl MmapProvider {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl MemoryProvider for MmapProvider {
    fn reserve(&mut self, size: usize, hint: Option<u64>) -> io::Result<Region> {
        let addr = hint.map_or(std::ptr::null_mut(), |hint| hint as usize as *mut libc::c_void);
        // SAFETY: an anonymous mapping without MAP_FIXED touches no existing memory.
        let ptr = unsafe {
            libc::mmap(
                addr,
                size,
                MemoryAccess::ReadWrite.prot(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Region::mapped(Mapping { ptr, len: size }))
    }

    fn protect(&mut self, region: &mut Region, access: MemoryAccess) -> io::Result<()> {
        if let Storage::Mapped(mapping) = &region.storage {
            // SAFETY: the range is exactly one mapping owned by `region`, and the
            // `&mut` borrow means no slice into it is alive.
            let rc = unsafe { libc::mprotect(mapping.ptr.as_ptr().cast(), mapping.len, access.prot()) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        region.access = access;
        Ok(())
    }

    fn release(&mut self, region: Region) {
        tracing::trace!(base = format_args!("{:#x}", region.base), len = region.len, "unmapping");
        drop(region);
    }
}

/// Plain heap memory for hosts without a mapping facility.
///
/// Regions are page aligned and report their real address. Protection is
/// recorded on the region but not enforced by hardware.
#[derive(Debug)]
pub struct HeapProvider {
    align: usize,
}

impl HeapProvider {
    pub fn new(align: usize) -> Self {
        Self { align }
    }
}

impl Default for HeapProvider {
    fn default() -> Self {
        Self::new(0x1000)
    }
}

impl MemoryProvider for HeapProvider {
    fn can_map(&self) -> bool {
        false
    }

    fn reserve(&mut self, size: usize, _hint: Option<u64>) -> io::Result<Region> {
        Ok(Region::heap(size, self.align))
    }

    fn protect(&mut self, region: &mut Region, access: MemoryAccess) -> io::Result<()> {
        region.set_access(access);
        Ok(())
    }

    fn release(&mut self, region: Region) {
        drop(region);
    }
}
