use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::ptr::NonNull;

use memory_addr::VirtAddr;

use crate::mem::{self, Access, Mmap, Mprotect, RawMap};

const PAGE_SIZE: usize = 4096;

pub struct AddrSpec;

impl mem::AddrSpec for AddrSpec {
    type Addr = VirtAddr;
    type Flags = Access;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    InvalidLayout { size: usize },
    Exhausted { size: usize },
}

/// Reservations served by the global allocator. The whole range is backed
/// up front, so committing only records the access change.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapBackend;

impl HeapBackend {
    fn layout(size: usize) -> Result<Layout, HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidLayout { size });
        }
        Layout::from_size_align(size, PAGE_SIZE).map_err(|_| HeapError::InvalidLayout { size })
    }
}

impl Mmap for HeapBackend {
    type Spec = AddrSpec;
    type Error = HeapError;

    fn reserve(&self, size: usize) -> Result<RawMap<Self>, Self::Error> {
        let layout = Self::layout(size)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(HeapError::Exhausted { size })?;
        Ok(unsafe { RawMap::from_ptr(ptr, size, *self) })
    }

    fn unmap(area: &mut RawMap<Self>) -> Result<(), Self::Error> {
        let layout = Self::layout(area.size())?;
        let ptr = area.spec.start().as_mut_ptr();
        unsafe { dealloc(ptr, layout) };
        Ok(())
    }

    fn page_size(&self) -> usize {
        PAGE_SIZE
    }
}

impl Mprotect for HeapBackend {
    unsafe fn protect(
        area: &mut RawMap<Self>,
        offset: usize,
        size: usize,
        _flags: Access,
    ) -> Result<(), Self::Error> {
        match offset.checked_add(size) {
            Some(end) if end <= area.size() => Ok(()),
            _ => Err(HeapError::InvalidLayout { size }),
        }
    }
}
