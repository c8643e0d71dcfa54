use core::ops::Deref;
use core::ptr::NonNull;

use super::{Access, AddrSpec, Error, FlagsOf, MemOps, Mmap, Mprotect};
use crate::numeric::Alignable;

pub struct MapSpec<S: AddrSpec> {
    range: memory_addr::AddrRange<S::Addr>,
}

impl<S: AddrSpec> core::fmt::Debug for MapSpec<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let start: usize = self.range.start.into();
        f.debug_struct("MapSpec")
            .field("start", &(start as *const u8))
            .field("size", &self.range.size())
            .finish()
    }
}

impl<S: AddrSpec> Clone for MapSpec<S> {
    fn clone(&self) -> Self {
        Self { range: self.range }
    }
}

impl<S: AddrSpec> MapSpec<S> {
    pub fn new(start: S::Addr, size: usize) -> Self {
        Self {
            range: memory_addr::AddrRange::from_start_size(start, size),
        }
    }

    #[inline]
    pub const fn start(&self) -> S::Addr {
        self.range.start
    }

    #[inline]
    pub const fn end(&self) -> S::Addr {
        self.range.end
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.range.size()
    }
}

/// A reserved address range whose prefix `[0, committed)` is readable and
/// writable.
pub struct RawMap<M: Mmap> {
    pub spec: MapSpec<M::Spec>,
    pub bk: M,
    committed: usize,
}

impl<M: Mmap> core::fmt::Debug for RawMap<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawMap")
            .field("area", &self.spec)
            .field("committed", &self.committed)
            .finish()
    }
}

unsafe impl<M: Mmap> MemOps for RawMap<M> {
    #[inline]
    fn start_ptr(&self) -> *const u8 {
        let start: usize = self.spec.start().into();
        start as *const u8
    }

    #[inline]
    fn end_ptr(&self) -> *const u8 {
        let end: usize = self.spec.end().into();
        end as *const u8
    }

    #[inline]
    fn size(&self) -> usize {
        self.spec.size()
    }
}

impl<M: Mmap> Deref for RawMap<M> {
    type Target = MapSpec<M::Spec>;

    fn deref(&self) -> &Self::Target {
        &self.spec
    }
}

impl<M: Mmap> RawMap<M> {
    /// ## Safety
    /// `start..start + size` must have been reserved by `bk`.
    pub unsafe fn from_ptr<T>(start: NonNull<T>, size: usize, bk: M) -> Self {
        unsafe { Self::from_raw(start.addr().get().into(), size, bk) }
    }

    /// Create a hollow area without any map operation.
    ///
    /// You should only use it in `Mmap` implementations.
    #[inline]
    pub unsafe fn from_raw(
        start: <M::Spec as AddrSpec>::Addr,
        size: usize,
        bk: M,
    ) -> Self {
        let spec = MapSpec::new(start, size);
        Self {
            spec,
            bk,
            committed: 0,
        }
    }

    #[inline]
    pub const fn committed(&self) -> usize {
        self.committed
    }

    #[inline]
    pub fn uncommitted(&self) -> usize {
        self.size() - self.committed
    }

    pub fn unmap(area: Self) -> Result<(), M::Error> {
        let mut area = area;
        M::unmap(&mut area)
    }
}

impl<M: Mprotect> RawMap<M> {
    /// Extends the committed prefix by `size` bytes.
    pub fn commit(&mut self, size: usize) -> Result<(), Error<M>> {
        let page = self.bk.page_size();
        if !size.is_aligned(&page) {
            return Err(Error::Unaligned {
                requested: size,
                align: page,
            });
        }
        if size > self.uncommitted() {
            return Err(Error::OutofSize {
                requested: size,
                bound: self.uncommitted(),
            });
        }

        let offset = self.committed;
        let flags = FlagsOf::<M>::from(Access::READ | Access::WRITE);
        unsafe { M::protect(self, offset, size, flags) }.map_err(Error::MapError)?;
        self.committed += size;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "[Area]: commit {} bytes at offset {}, committed {}",
            size,
            offset,
            self.committed
        );

        Ok(())
    }
}
