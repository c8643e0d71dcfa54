pub mod heap;
#[cfg(all(unix, feature = "unix"))]
pub mod unix;

/// Backend used when none is named explicitly.
#[cfg(all(unix, feature = "unix"))]
pub type DefaultBackend = unix::AnonBackend;

#[cfg(not(all(unix, feature = "unix")))]
pub type DefaultBackend = heap::HeapBackend;
