use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::header::{Header, Layout, Magic, Status};
use crate::numeric::{checked_dec, words_of};

/// A block of metadata memory handed out by a domain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MetaBlock(NonNull<usize>);

unsafe impl Send for MetaBlock {}
unsafe impl Sync for MetaBlock {}

impl core::fmt::Debug for MetaBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "MetaBlock({:p})", self.0)
    }
}

impl MetaBlock {
    /// ## Safety
    /// `ptr` must point into a chunk owned by a space manager.
    #[inline]
    pub(crate) const unsafe fn from_raw(ptr: NonNull<usize>) -> Self {
        Self(ptr)
    }

    #[inline]
    pub const fn as_ptr(self) -> *mut usize {
        self.0.as_ptr()
    }

    #[inline]
    pub const fn as_non_null(self) -> NonNull<usize> {
        self.0
    }

    #[inline]
    pub const fn cast<T>(self) -> NonNull<T> {
        self.0.cast()
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr().addr()
    }

    /// ## Safety
    /// The result must stay within the block this one was carved from.
    #[inline]
    pub(crate) unsafe fn add(self, words: usize) -> Self {
        Self(unsafe { self.0.add(words) })
    }
}

#[derive(Debug)]
#[repr(C)]
pub struct BlockMeta {
    word_size: usize,
}

impl Layout for BlockMeta {
    type Config = usize;

    const MAGIC: Magic = 0xB10C;

    #[inline]
    fn init(&mut self, word_size: usize) -> Status {
        self.word_size = word_size;
        Status::Initialized
    }

    #[inline]
    fn attach(&self) -> Status {
        if self.word_size >= MIN_BLOCK_WORDS {
            Status::Initialized
        } else {
            Status::Corrupted
        }
    }

    #[inline]
    fn finalize(&mut self) -> bool {
        true
    }
}

pub type BlockHeader = Header<BlockMeta>;

/// Every block is large enough to hold the header written when it is freed.
pub const MIN_BLOCK_WORDS: usize = words_of::<BlockHeader>();
pub const SMALL_BLOCK_MIN_WORDS: usize = MIN_BLOCK_WORDS;
/// Blocks at or above this size go to the dictionary.
pub const SMALL_BLOCK_MAX_WORDS: usize = 12;
/// A dictionary block more than this many times the request is left alone.
pub const WASTE_MULTIPLIER: usize = 4;

const SMALL_BUCKETS: usize = SMALL_BLOCK_MAX_WORDS - SMALL_BLOCK_MIN_WORDS;

/// Rounds a request up to the size actually carved for it.
#[inline]
pub const fn raw_word_size(word_size: usize) -> usize {
    if word_size < MIN_BLOCK_WORDS {
        MIN_BLOCK_WORDS
    } else {
        word_size
    }
}

/// Freed blocks of one space manager: exact-size buckets for small blocks,
/// and a size-keyed dictionary for the rest.
pub struct BlockFreeList {
    small: [Vec<MetaBlock>; SMALL_BUCKETS],
    dictionary: BTreeMap<usize, Vec<MetaBlock>>,
    total_words: usize,
    count: usize,
    dark_words: usize,
}

impl core::fmt::Debug for BlockFreeList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockFreeList")
            .field("total_words", &self.total_words)
            .field("count", &self.count)
            .field("dark_words", &self.dark_words)
            .finish()
    }
}

impl Default for BlockFreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockFreeList {
    pub fn new() -> Self {
        Self {
            small: core::array::from_fn(|_| Vec::new()),
            dictionary: BTreeMap::new(),
            total_words: 0,
            count: 0,
            dark_words: 0,
        }
    }

    #[inline]
    pub fn total_words(&self) -> usize {
        self.total_words
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Words dropped because they were too small to track.
    #[inline]
    pub fn dark_words(&self) -> usize {
        self.dark_words
    }

    pub fn return_block(&mut self, block: MetaBlock, word_size: usize) {
        if word_size < SMALL_BLOCK_MIN_WORDS {
            self.dark_words += word_size;
            return;
        }

        let header = unsafe { BlockHeader::from_raw(block.as_ptr().cast()) };
        header.init(word_size);

        if word_size < SMALL_BLOCK_MAX_WORDS {
            self.small[word_size - SMALL_BLOCK_MIN_WORDS].push(block);
        } else {
            self.dictionary.entry(word_size).or_default().push(block);
        }
        self.total_words += word_size;
        self.count += 1;
    }

    /// Finds a free block of at least `word_size` words.
    pub fn get_block(&mut self, word_size: usize) -> Option<MetaBlock> {
        if word_size < SMALL_BLOCK_MAX_WORDS {
            let bucket = word_size.checked_sub(SMALL_BLOCK_MIN_WORDS)?;
            let block = self.small[bucket].pop()?;
            self.take(block, word_size);
            return Some(block);
        }

        let (&block_size, list) = self.dictionary.range_mut(word_size..).next()?;
        if block_size > word_size.saturating_mul(WASTE_MULTIPLIER) {
            // Splitting would leave a sliver; the block stays listed.
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "[Block]: skip {} word block for a {} word request",
                block_size,
                word_size
            );
            return None;
        }

        let block = list.pop()?;
        if list.is_empty() {
            self.dictionary.remove(&block_size);
        }
        self.take(block, block_size);

        let unused = block_size - word_size;
        if unused >= SMALL_BLOCK_MIN_WORDS {
            self.return_block(unsafe { block.add(word_size) }, unused);
        } else {
            // travels with the block and never comes back
            self.dark_words += unused;
        }
        Some(block)
    }

    fn take(&mut self, block: MetaBlock, word_size: usize) {
        let header = unsafe { &*block.as_ptr().cast::<BlockHeader>() };
        if header.attach() != Status::Initialized || header.word_size != word_size {
            panic!("corrupted block header at {:?}: {:?}", block, header);
        }
        checked_dec(&mut self.total_words, word_size, "free block words");
        checked_dec(&mut self.count, 1, "free block count");
    }

    pub fn verify(&self) {
        let mut words = 0;
        let mut count = 0;
        let small = self
            .small
            .iter()
            .enumerate()
            .flat_map(|(i, list)| list.iter().map(move |b| (i + SMALL_BLOCK_MIN_WORDS, b)));
        let large = self
            .dictionary
            .iter()
            .flat_map(|(&size, list)| list.iter().map(move |b| (size, b)));
        for (size, block) in small.chain(large) {
            let header = unsafe { &*block.as_ptr().cast::<BlockHeader>() };
            assert_eq!(header.attach(), Status::Initialized, "{block:?}");
            assert_eq!(header.word_size, size, "{block:?}");
            words += size;
            count += 1;
        }
        assert_eq!(words, self.total_words, "free block words out of sync");
        assert_eq!(count, self.count, "free block count out of sync");
    }
}
