#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

#[cfg(feature = "tracing")]
extern crate tracing;

mod block;
mod chunk;
mod config;
mod context;
mod domain;
mod error;
mod header;
pub mod mem;
pub mod os;
pub mod perlude;
mod policy;
mod region;
mod space;
mod stats;

pub mod lock {
    pub type SpinMutex = spin::Mutex<()>;
}

mod numeric {
    pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

    pub trait Alignable: Sized {
        fn align_down(self, other: Self) -> Self;
        fn align_up(self, other: Self) -> Self;
        fn align_offset(&self, other: &Self) -> Self;
        fn is_aligned(&self, other: &Self) -> bool;
    }

    macro_rules! align {
        ($ty:ty) => {
            impl crate::numeric::Alignable for $ty {
                #[inline(always)]
                fn align_down(self, other: Self) -> Self {
                    debug_assert!(other.is_power_of_two());
                    self & !(other - 1)
                }
                #[inline(always)]
                fn align_up(self, other: Self) -> Self {
                    debug_assert!(other.is_power_of_two());
                    (self + other - 1) & !(other - 1)
                }
                #[inline(always)]
                fn align_offset(&self, other: &Self) -> Self {
                    *self & (*other - 1)
                }
                #[inline(always)]
                fn is_aligned(&self, other: &Self) -> bool {
                    self.align_offset(other) == 0
                }
            }
        };
    }

    align!(usize);
    align!(u64);

    /// Rounds `n` up to a multiple of `unit`, which need not be a power of two.
    #[inline]
    pub const fn round_up(n: usize, unit: usize) -> usize {
        n.div_ceil(unit) * unit
    }

    #[inline]
    pub const fn words_to_bytes(words: usize) -> usize {
        words * WORD_SIZE
    }

    #[inline]
    pub const fn bytes_to_words(bytes: usize) -> usize {
        bytes / WORD_SIZE
    }

    /// Largest word count whose byte size fits an `isize`.
    pub const MAX_WORDS: usize = bytes_to_words(isize::MAX as usize);

    /// `None` past [`MAX_WORDS`].
    #[inline]
    pub const fn checked_words_to_bytes(words: usize) -> Option<usize> {
        if words > MAX_WORDS {
            None
        } else {
            Some(words * WORD_SIZE)
        }
    }

    #[inline]
    pub const fn checked_round_up(n: usize, unit: usize) -> Option<usize> {
        n.div_ceil(unit).checked_mul(unit)
    }

    #[inline]
    pub const fn words_of<T>() -> usize {
        core::mem::size_of::<T>().div_ceil(WORD_SIZE)
    }

    /// Subtracts from an accounting counter. A counter going negative means the
    /// allocator's bookkeeping is corrupted, which is not recoverable.
    #[inline]
    #[track_caller]
    pub fn checked_dec(counter: &mut usize, by: usize, what: &str) {
        match counter.checked_sub(by) {
            Some(v) => *counter = v,
            None => panic!("{what} underflow: {} - {}", *counter, by),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn align_and_round() {
            assert_eq!(13usize.align_up(8), 16);
            assert_eq!(13usize.align_down(8), 8);
            assert!(4096usize.is_aligned(&4096));
            assert_eq!(round_up(129, 128), 256);
            assert_eq!(round_up(256, 128), 256);
            assert_eq!(words_to_bytes(3), 3 * WORD_SIZE);
        }

        #[test]
        fn checked_conversions_refuse_overflow() {
            assert_eq!(checked_words_to_bytes(MAX_WORDS), Some(MAX_WORDS * WORD_SIZE));
            assert_eq!(checked_words_to_bytes(MAX_WORDS + 1), None);
            assert_eq!(checked_words_to_bytes(usize::MAX), None);
            assert_eq!(checked_round_up(usize::MAX - 3, 128), None);
            assert_eq!(checked_round_up(129, 128), Some(256));
        }

        #[test]
        #[should_panic(expected = "free words underflow")]
        fn dec_underflow_is_fatal() {
            let mut n = 3;
            checked_dec(&mut n, 4, "free words");
        }
    }
}
