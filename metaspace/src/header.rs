use core::ops::{Deref, DerefMut};

pub type Magic = u16;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Uninitialized = 0,
    Initialized = 1,
    Corrupted = 2,
}

impl Status {
    #[inline]
    pub const fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Uninitialized,
            1 => Status::Initialized,
            _ => Status::Corrupted,
        }
    }
}

/// A record written in place at the start of a memory span it describes.
pub trait Layout: Sized {
    type Config;

    const MAGIC: Magic;

    /// ## Safety
    /// `ptr` must be valid for reads and writes of `Self` and suitably aligned.
    #[inline]
    unsafe fn from_raw<'a>(ptr: *mut Self) -> &'a mut Self {
        unsafe { &mut *ptr }
    }
    fn init(&mut self, conf: Self::Config) -> Status;
    fn attach(&self) -> Status;
    /// Marks the record as released. Returns `false` if it was already released.
    fn finalize(&mut self) -> bool;
}

#[repr(C)]
pub struct Header<T: Layout> {
    magic: Magic,
    status: u8,
    pub inner: T,
}

impl<T: Layout + core::fmt::Debug> core::fmt::Debug for Header<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("magic", &self.magic)
            .field("status", &self.status())
            .field("inner", &self.inner)
            .finish()
    }
}

impl<T: Layout> Deref for Header<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: Layout> DerefMut for Header<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<T: Layout> Header<T> {
    #[inline]
    pub fn status(&self) -> Status {
        Status::from_u8(self.status)
    }

    #[inline]
    fn valid_magic(&self) -> bool {
        self.magic == T::MAGIC
    }
}

impl<T: Layout> Layout for Header<T> {
    type Config = T::Config;

    const MAGIC: Magic = T::MAGIC;

    fn init(&mut self, conf: Self::Config) -> Status {
        if self.inner.init(conf) == Status::Initialized {
            self.magic = T::MAGIC;
            self.status = Status::Initialized as u8;
            Status::Initialized
        } else {
            self.status = Status::Corrupted as u8;
            Status::Corrupted
        }
    }

    fn attach(&self) -> Status {
        if !self.valid_magic() {
            return Status::Uninitialized;
        }

        match self.status() {
            Status::Initialized => self.inner.attach(),
            st => st,
        }
    }

    fn finalize(&mut self) -> bool {
        self.valid_magic() && self.inner.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    #[repr(C)]
    struct TestLayout {
        value: usize,
        released: bool,
    }

    impl Layout for TestLayout {
        type Config = usize;

        const MAGIC: Magic = 0x5EED;

        fn init(&mut self, conf: usize) -> Status {
            self.value = conf;
            self.released = false;
            Status::Initialized
        }

        fn attach(&self) -> Status {
            if self.released {
                Status::Corrupted
            } else {
                Status::Initialized
            }
        }

        fn finalize(&mut self) -> bool {
            !core::mem::replace(&mut self.released, true)
        }
    }

    #[test]
    fn init_attach_finalize() {
        let mut raw = [0usize; 3];
        let header = unsafe { Header::<TestLayout>::from_raw(raw.as_mut_ptr().cast()) };
        assert_eq!(header.attach(), Status::Uninitialized);
        assert_eq!(header.init(42), Status::Initialized);
        assert_eq!(header.attach(), Status::Initialized);
        assert_eq!(header.value, 42);
        assert!(header.finalize());
        assert!(!header.finalize());
        assert_eq!(header.attach(), Status::Corrupted);
    }
}
