mod area;

pub use self::area::{MapSpec, RawMap};

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Debug,Clone,Copy,PartialEq,Eq)]
    pub struct Access: u8 {
        const READ  = 0x1;
        const WRITE = 0x1 << 1;
        const EXEC  = 0x1 << 2;
    }
}

impl core::fmt::Display for Access {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(&self, f)
    }
}

/// Backend protection flags, built from the portable [`Access`].
pub trait Accessible: Copy + From<Access> {}

impl Accessible for Access {}

pub trait AddrSpec {
    type Addr: memory_addr::MemoryAddr;
    type Flags: Accessible;
}

pub type FlagsOf<M> = <<M as Mmap>::Spec as AddrSpec>::Flags;

/// Address space provider. A reservation claims address space without
/// backing it; [`Mprotect`] later makes sub-ranges of it usable.
pub trait Mmap: Sized + Clone {
    type Spec: AddrSpec;
    type Error: core::fmt::Debug;

    fn reserve(&self, size: usize) -> Result<RawMap<Self>, Self::Error>;
    fn unmap(area: &mut RawMap<Self>) -> Result<(), Self::Error>;

    /// Granularity every reservation and protection change is aligned to.
    fn page_size(&self) -> usize;
}

pub trait Mprotect: Mmap {
    /// ## Safety
    /// `[offset, offset + size)` must lie within `area`, and no live
    /// reference may depend on the access rights being revoked.
    unsafe fn protect(
        area: &mut RawMap<Self>,
        offset: usize,
        size: usize,
        flags: FlagsOf<Self>,
    ) -> Result<(), Self::Error>;
}

pub enum Error<M: Mmap> {
    OutofSize { requested: usize, bound: usize },
    Unaligned { requested: usize, align: usize },
    MapError(M::Error),
}

impl<M: Mmap> core::error::Error for Error<M> {}

impl<M: Mmap> core::fmt::Debug for Error<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutofSize { requested, bound } => write!(
                f,
                "Out of upper bounded size, requested {}, upper bound {}",
                requested, bound
            ),
            Self::Unaligned { requested, align } => write!(
                f,
                "Unaligned request {}, expected alignment {}",
                requested, align
            ),
            Self::MapError(err) => write!(f, "Mapping error: {:?}", err),
        }
    }
}

impl<M: Mmap> core::fmt::Display for Error<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

pub unsafe trait MemOps {
    /// Returns the start pointer of the memory block.
    fn start_ptr(&self) -> *const u8;

    fn end_ptr(&self) -> *const u8;

    /// Returns the byte size of the memory block.
    fn size(&self) -> usize;

    /// ## Safety
    /// Writes through the returned pointer must stay within the block.
    #[inline]
    unsafe fn start_mut_ptr(&self) -> *mut u8 {
        self.start_ptr().cast_mut()
    }

    /// Returns a pointer to the memory at the given byte offset.
    #[inline]
    fn get_mut_ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.size());
        unsafe { self.start_mut_ptr().add(offset) }
    }

    #[inline]
    fn contains_ptr<T: ?Sized>(&self, ptr: *const T) -> bool {
        let addr = ptr.cast::<u8>().addr();
        self.start_ptr().addr() <= addr && addr < self.end_ptr().addr()
    }
}
