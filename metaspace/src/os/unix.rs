#![cfg(all(unix, feature = "unix"))]

use core::{ffi::c_void, num::NonZeroUsize, ptr::NonNull};

use memory_addr::VirtAddr;
pub use nix::sys::mman::{MapFlags, ProtFlags};

use crate::mem::{self, Access, Accessible, Mmap, Mprotect, RawMap};

type Addr = VirtAddr;

unsafe fn as_c_void(ptr: usize) -> NonNull<c_void> {
    let ptr = ptr as *mut c_void;
    unsafe { NonNull::new_unchecked(ptr) }
}

pub struct AddrSpec;

impl mem::AddrSpec for AddrSpec {
    type Addr = Addr;
    type Flags = ProtFlags;
}

impl From<Access> for ProtFlags {
    fn from(value: Access) -> Self {
        let mut flags = ProtFlags::PROT_NONE;
        if value.contains(Access::READ) {
            flags |= ProtFlags::PROT_READ;
        }
        if value.contains(Access::WRITE) {
            flags |= ProtFlags::PROT_WRITE;
        }
        if value.contains(Access::EXEC) {
            flags |= ProtFlags::PROT_EXEC;
        }
        flags
    }
}

impl Accessible for ProtFlags {}

/// Private anonymous mappings. Reservations are mapped `PROT_NONE` and
/// committed by raising the protection of a prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonBackend;

impl Mmap for AnonBackend {
    type Spec = AddrSpec;
    type Error = nix::Error;

    fn reserve(&self, size: usize) -> Result<RawMap<Self>, Self::Error> {
        use nix::sys::mman;

        let size = NonZeroUsize::new(size).ok_or(nix::Error::EINVAL)?;
        let mflags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS;
        let pflags = ProtFlags::PROT_NONE;

        unsafe {
            let ptr = mman::mmap_anonymous(None, size, pflags, mflags)?;
            Ok(RawMap::from_ptr(ptr, size.get(), *self))
        }
    }

    fn unmap(area: &mut RawMap<Self>) -> Result<(), Self::Error> {
        let start = unsafe { as_c_void(area.spec.start().as_usize()) };
        let size = area.size();
        unsafe { nix::sys::mman::munmap(start, size) }
    }

    fn page_size(&self) -> usize {
        use std::sync::OnceLock;

        static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
        *PAGE_SIZE.get_or_init(|| {
            let n = unsafe { nix::libc::sysconf(nix::libc::_SC_PAGESIZE) };
            if n > 0 { n as usize } else { 4096 }
        })
    }
}

impl Mprotect for AnonBackend {
    unsafe fn protect(
        area: &mut RawMap<Self>,
        offset: usize,
        size: usize,
        pflags: ProtFlags,
    ) -> Result<(), Self::Error> {
        let start = unsafe { as_c_void(area.spec.start().as_usize() + offset) };
        unsafe { nix::sys::mman::mprotect(start, size, pflags) }
    }
}
