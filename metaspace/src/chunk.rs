use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::block::MetaBlock;
use crate::error::Error;
use crate::header::{Header, Layout, Magic, Status};
use crate::numeric::{checked_dec, words_of};
use crate::region::RegionId;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeClass {
    Specialized = 0,
    Small = 1,
    Medium = 2,
    Humongous = 3,
}

impl SizeClass {
    /// Classes with a fixed size and a plain free list.
    pub const FIXED: [SizeClass; 3] = [SizeClass::Specialized, SizeClass::Small, SizeClass::Medium];
    pub const ALL: [SizeClass; 4] = [
        SizeClass::Specialized,
        SizeClass::Small,
        SizeClass::Medium,
        SizeClass::Humongous,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn is_humongous(self) -> bool {
        matches!(self, SizeClass::Humongous)
    }

    #[inline]
    const fn from_u8(v: u8) -> Option<SizeClass> {
        match v {
            0 => Some(SizeClass::Specialized),
            1 => Some(SizeClass::Small),
            2 => Some(SizeClass::Medium),
            3 => Some(SizeClass::Humongous),
            _ => None,
        }
    }
}

/// The three fixed chunk sizes of an allocation class, in words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkSizes {
    pub specialized: usize,
    pub small: usize,
    pub medium: usize,
}

impl ChunkSizes {
    pub const NON_CLASS: Self = Self::new(128, 512, 8 * 1024);
    pub const CLASS: Self = Self::new(128, 256, 4 * 1024);

    pub const fn new(specialized: usize, small: usize, medium: usize) -> Self {
        Self {
            specialized,
            small,
            medium,
        }
    }

    /// The fixed class of exactly `word_size`, if there is one.
    #[inline]
    pub const fn class_of(&self, word_size: usize) -> Option<SizeClass> {
        if word_size == self.specialized {
            Some(SizeClass::Specialized)
        } else if word_size == self.small {
            Some(SizeClass::Small)
        } else if word_size == self.medium {
            Some(SizeClass::Medium)
        } else {
            None
        }
    }

    /// Maps a chunk size to its list. Sizes are matched exactly; every size
    /// that is not one of the three fixed sizes is humongous.
    #[inline]
    pub const fn list_index(&self, word_size: usize) -> SizeClass {
        match self.class_of(word_size) {
            Some(class) => class,
            None => SizeClass::Humongous,
        }
    }

    #[inline]
    pub const fn words(&self, class: SizeClass) -> Option<usize> {
        match class {
            SizeClass::Specialized => Some(self.specialized),
            SizeClass::Small => Some(self.small),
            SizeClass::Medium => Some(self.medium),
            SizeClass::Humongous => None,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        fn invalid(reason: &'static str) -> Result<(), Error> {
            Err(Error::InvalidConfig { reason })
        }

        if self.specialized <= CHUNK_OVERHEAD {
            return invalid("specialized chunk must be larger than the chunk header");
        }
        if self.small <= self.specialized || self.small % self.specialized != 0 {
            return invalid("small chunk must be a larger multiple of the specialized chunk");
        }
        if self.medium <= self.small || self.medium % self.small != 0 {
            return invalid("medium chunk must be a larger multiple of the small chunk");
        }
        Ok(())
    }
}

#[derive(Debug)]
#[repr(C)]
pub struct ChunkMeta {
    word_size: usize,
    class: u8,
    free: u8,
}

impl Layout for ChunkMeta {
    type Config = (usize, SizeClass);

    const MAGIC: Magic = 0xC4C7;

    #[inline]
    fn init(&mut self, (word_size, class): Self::Config) -> Status {
        self.word_size = word_size;
        self.class = class as u8;
        self.free = 0;
        Status::Initialized
    }

    #[inline]
    fn attach(&self) -> Status {
        match SizeClass::from_u8(self.class) {
            Some(_) if self.word_size != 0 && self.free <= 1 => Status::Initialized,
            _ => Status::Corrupted,
        }
    }

    #[inline]
    fn finalize(&mut self) -> bool {
        if self.free != 0 {
            return false;
        }
        self.free = 1;
        true
    }
}

pub type ChunkHeader = Header<ChunkMeta>;

/// Words at the start of every chunk taken by its in-place header.
pub const CHUNK_OVERHEAD: usize = words_of::<ChunkHeader>();

/// A span of committed memory carved from a region. A `Chunk` is a unique,
/// non-copyable handle: whoever holds it (a free list, the humongous
/// dictionary, or a space manager) is its only owner.
pub struct Chunk {
    base: NonNull<usize>,
    word_size: usize,
    class: SizeClass,
    region: RegionId,
    top: usize,
}

unsafe impl Send for Chunk {}

impl core::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Chunk")
            .field("base", &self.base)
            .field("word_size", &self.word_size)
            .field("class", &self.class)
            .field("region", &self.region)
            .field("top", &self.top)
            .finish()
    }
}

impl Chunk {
    /// Writes a fresh header at `base` and returns the in-use chunk.
    ///
    /// ## Safety
    /// `base..base + word_size` must be committed, word aligned and not owned
    /// by anything else.
    pub(crate) unsafe fn carve(
        base: NonNull<usize>,
        word_size: usize,
        class: SizeClass,
        region: RegionId,
    ) -> Self {
        debug_assert!(word_size > CHUNK_OVERHEAD);
        let header = unsafe { ChunkHeader::from_raw(base.as_ptr().cast()) };
        let status = header.init((word_size, class));
        debug_assert_eq!(status, Status::Initialized);
        Self {
            base,
            word_size,
            class,
            region,
            top: CHUNK_OVERHEAD,
        }
    }

    #[inline]
    fn header(&self) -> &ChunkHeader {
        unsafe { &*self.base.as_ptr().cast::<ChunkHeader>() }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut ChunkHeader {
        unsafe { ChunkHeader::from_raw(self.base.as_ptr().cast()) }
    }

    #[inline]
    pub fn word_size(&self) -> usize {
        self.word_size
    }

    #[inline]
    pub fn class(&self) -> SizeClass {
        self.class
    }

    #[inline]
    pub fn region(&self) -> RegionId {
        self.region
    }

    #[inline]
    pub fn base(&self) -> NonNull<usize> {
        self.base
    }

    /// Words handed out so far, header included.
    #[inline]
    pub fn used_word_size(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn free_word_size(&self) -> usize {
        self.word_size - self.top
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top == CHUNK_OVERHEAD
    }

    #[inline]
    pub fn contains<T>(&self, ptr: *const T) -> bool {
        let start = self.base.as_ptr().addr();
        let end = start + self.word_size * size_of::<usize>();
        (start..end).contains(&ptr.addr())
    }

    /// Bumps `word_size` words off the chunk.
    #[inline]
    pub(crate) fn allocate(&mut self, word_size: usize) -> Option<MetaBlock> {
        if self.free_word_size() < word_size {
            return None;
        }
        let ptr = unsafe { self.base.add(self.top) };
        self.top += word_size;
        Some(unsafe { MetaBlock::from_raw(ptr) })
    }

    /// Takes a chunk off a free list. The header must describe a free chunk
    /// of this size; anything else means the free lists are corrupted.
    pub(crate) fn attach(&mut self) {
        let header = self.header();
        if header.attach() != Status::Initialized
            || header.word_size != self.word_size
            || header.free != 1
        {
            panic!("corrupted chunk header at {:p}: {:?}", self.base, header);
        }
        self.header_mut().free = 0;
        self.top = CHUNK_OVERHEAD;
    }

    /// Marks the chunk free before it is linked into a free list.
    pub(crate) fn release(&mut self) {
        if !self.header_mut().finalize() {
            panic!("chunk at {:p} returned twice", self.base);
        }
        self.top = CHUNK_OVERHEAD;
    }

    /// Checks the in-place header against this handle.
    pub(crate) fn verify(&self, free: bool) {
        let header = self.header();
        assert_eq!(header.attach(), Status::Initialized, "chunk at {:p}", self.base);
        assert_eq!(header.word_size, self.word_size, "chunk at {:p}", self.base);
        assert_eq!(header.class, self.class as u8, "chunk at {:p}", self.base);
        assert_eq!(header.free == 1, free, "chunk at {:p}", self.base);
        assert!(self.top >= CHUNK_OVERHEAD && self.top <= self.word_size);
    }
}

/// Reads the header of the chunk starting at `base`, returning its size.
///
/// ## Safety
/// `base` must point to committed memory of the region.
pub(crate) unsafe fn chunk_size_at(base: NonNull<usize>) -> Option<usize> {
    let header = unsafe { &*base.as_ptr().cast::<ChunkHeader>() };
    match header.attach() {
        Status::Initialized => Some(header.word_size),
        _ => None,
    }
}

/// Free chunks of one allocation class.
pub struct ChunkManager {
    sizes: ChunkSizes,
    free: [Vec<Chunk>; 3],
    humongous: BTreeMap<usize, Vec<Chunk>>,
    free_words: usize,
    free_count: usize,
}

impl core::fmt::Debug for ChunkManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChunkManager")
            .field("specialized", &self.free[0].len())
            .field("small", &self.free[1].len())
            .field("medium", &self.free[2].len())
            .field("humongous", &self.humongous_count())
            .field("free_words", &self.free_words)
            .finish()
    }
}

impl ChunkManager {
    pub fn new(sizes: ChunkSizes) -> Self {
        Self {
            sizes,
            free: [Vec::new(), Vec::new(), Vec::new()],
            humongous: BTreeMap::new(),
            free_words: 0,
            free_count: 0,
        }
    }

    #[inline]
    pub fn sizes(&self) -> &ChunkSizes {
        &self.sizes
    }

    #[inline]
    pub fn list_index(&self, word_size: usize) -> SizeClass {
        self.sizes.list_index(word_size)
    }

    #[inline]
    pub fn free_words(&self) -> usize {
        self.free_words
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn free_count_of(&self, class: SizeClass) -> usize {
        match class {
            SizeClass::Humongous => self.humongous_count(),
            fixed => self.free[fixed.index()].len(),
        }
    }

    fn humongous_count(&self) -> usize {
        self.humongous.values().map(Vec::len).sum()
    }

    /// Hands out a free chunk of `word_size`. Fixed sizes come off their list
    /// in LIFO order; humongous requests take the smallest free humongous
    /// chunk that is large enough, whole.
    pub fn chunk_freelist_allocate(&mut self, word_size: usize) -> Option<Chunk> {
        let mut chunk = self.free_chunks_get(word_size)?;
        checked_dec(&mut self.free_words, chunk.word_size(), "free chunk words");
        checked_dec(&mut self.free_count, 1, "free chunk count");
        chunk.attach();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "[Chunk]: reuse {:?} chunk of {} words for a {} word request",
            chunk.class(),
            chunk.word_size(),
            word_size
        );

        self.slow_verify();
        Some(chunk)
    }

    fn free_chunks_get(&mut self, word_size: usize) -> Option<Chunk> {
        match self.list_index(word_size) {
            SizeClass::Humongous => {
                let (&size, list) = self.humongous.range_mut(word_size..).next()?;
                let chunk = list.pop();
                if list.is_empty() {
                    self.humongous.remove(&size);
                }
                chunk
            }
            fixed => self.free[fixed.index()].pop(),
        }
    }

    /// Returns a single chunk, the only way humongous chunks come back.
    pub fn return_chunk(&mut self, mut chunk: Chunk) {
        chunk.release();
        self.free_words += chunk.word_size();
        self.free_count += 1;
        match chunk.class() {
            SizeClass::Humongous => self
                .humongous
                .entry(chunk.word_size())
                .or_default()
                .push(chunk),
            fixed => self.free[fixed.index()].push(chunk),
        }
        self.slow_verify();
    }

    /// Returns a run of chunks of one fixed class at once.
    pub fn return_chunks(&mut self, class: SizeClass, chunks: Vec<Chunk>) {
        if class.is_humongous() {
            chunks.into_iter().for_each(|c| self.return_chunk(c));
            return;
        }

        let list = &mut self.free[class.index()];
        list.reserve(chunks.len());
        for mut chunk in chunks {
            assert_eq!(chunk.class(), class, "chunk returned to the wrong list");
            chunk.release();
            self.free_words += chunk.word_size();
            self.free_count += 1;
            list.push(chunk);
        }
        self.slow_verify();
    }

    /// Drops every free chunk carved from `region`, returning the words and
    /// chunks removed.
    pub fn remove_region_chunks(&mut self, region: RegionId) -> (usize, usize) {
        let mut words = 0;
        let mut count = 0;
        let mut keep = |c: &Chunk| {
            let hit = c.region() == region;
            if hit {
                words += c.word_size();
                count += 1;
            }
            !hit
        };
        for list in self.free.iter_mut() {
            list.retain(&mut keep);
        }
        for list in self.humongous.values_mut() {
            list.retain(&mut keep);
        }
        self.humongous.retain(|_, list| !list.is_empty());

        checked_dec(&mut self.free_words, words, "free chunk words");
        checked_dec(&mut self.free_count, count, "free chunk count");
        self.verify();
        (words, count)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.free
            .iter()
            .flatten()
            .chain(self.humongous.values().flatten())
    }

    /// Recomputes the totals from the lists and checks every header.
    pub fn verify(&self) {
        let mut words = 0;
        let mut count = 0;
        for class in SizeClass::FIXED {
            for chunk in &self.free[class.index()] {
                assert_eq!(chunk.class(), class);
                assert_eq!(Some(chunk.word_size()), self.sizes.words(class));
                chunk.verify(true);
                words += chunk.word_size();
                count += 1;
            }
        }
        for (&size, list) in &self.humongous {
            assert!(!list.is_empty(), "empty humongous bucket {size}");
            for chunk in list {
                assert_eq!(chunk.word_size(), size);
                assert!(chunk.class().is_humongous());
                chunk.verify(true);
                words += size;
                count += 1;
            }
        }
        assert_eq!(words, self.free_words, "free chunk words out of sync");
        assert_eq!(count, self.free_count, "free chunk count out of sync");
    }

    /// Full walk after every list operation, opt-in through `slow-verify`.
    #[inline]
    fn slow_verify(&self) {
        #[cfg(feature = "slow-verify")]
        self.verify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const SIZES: ChunkSizes = ChunkSizes::new(128, 256, 4096);

    struct Backing(Vec<usize>, usize);

    impl Backing {
        fn new(words: usize) -> Self {
            Self(vec![0; words], 0)
        }

        fn carve(&mut self, word_size: usize) -> Chunk {
            let class = SIZES.list_index(word_size);
            let base = NonNull::new(unsafe { self.0.as_mut_ptr().add(self.1) }).unwrap();
            self.1 += word_size;
            assert!(self.1 <= self.0.len());
            unsafe { Chunk::carve(base, word_size, class, RegionId::new(0)) }
        }
    }

    #[test]
    fn list_index_is_exact() {
        assert_eq!(SIZES.list_index(128), SizeClass::Specialized);
        assert_eq!(SIZES.list_index(256), SizeClass::Small);
        assert_eq!(SIZES.list_index(4096), SizeClass::Medium);
        assert_eq!(SIZES.list_index(4096 + 128), SizeClass::Humongous);
        for _ in 0..1000 {
            let n = fastrand::usize(1..1 << 16);
            let class = SIZES.list_index(n);
            match SIZES.class_of(n) {
                Some(c) => assert_eq!(c, class),
                None => assert_eq!(class, SizeClass::Humongous),
            }
            if n > SIZES.medium {
                assert_eq!(class, SizeClass::Humongous);
            }
        }
    }

    #[test]
    fn fixed_lists_are_lifo() {
        let mut mem = Backing::new(1024);
        let mut cm = ChunkManager::new(SIZES);
        let a = mem.carve(256);
        let b = mem.carve(256);
        let (pa, pb) = (a.base(), b.base());
        cm.return_chunks(SizeClass::Small, vec![a, b]);
        assert_eq!(cm.free_words(), 512);
        assert_eq!(cm.free_count(), 2);

        let first = cm.chunk_freelist_allocate(256).unwrap();
        assert_eq!(first.base(), pb);
        let second = cm.chunk_freelist_allocate(256).unwrap();
        assert_eq!(second.base(), pa);
        assert!(cm.chunk_freelist_allocate(256).is_none());
        assert!(cm.chunk_freelist_allocate(128).is_none());
        assert_eq!(cm.free_words(), 0);
        first.verify(false);
    }

    #[test]
    fn long_free_lists_stay_consistent() {
        const N: usize = 20_000;
        let mut mem = Backing::new(N * 128);
        let mut cm = ChunkManager::new(SIZES);
        for _ in 0..N {
            cm.return_chunk(mem.carve(128));
        }
        assert_eq!(cm.free_count_of(SizeClass::Specialized), N);

        let mut taken = Vec::with_capacity(N / 2);
        for _ in 0..N / 2 {
            taken.push(cm.chunk_freelist_allocate(128).unwrap());
        }
        cm.return_chunks(SizeClass::Specialized, taken);
        assert_eq!(cm.free_words(), N * 128);
        cm.verify();
    }

    #[test]
    fn humongous_best_fit() {
        let mut mem = Backing::new(64 * 1024);
        let mut cm = ChunkManager::new(SIZES);
        for words in [8192, 5120, 16384, 5120] {
            cm.return_chunk(mem.carve(words));
        }
        assert_eq!(cm.free_count_of(SizeClass::Humongous), 4);

        let c = cm.chunk_freelist_allocate(4224).unwrap();
        assert_eq!(c.word_size(), 5120);
        let c = cm.chunk_freelist_allocate(6000).unwrap();
        assert_eq!(c.word_size(), 8192);
        assert!(cm.chunk_freelist_allocate(20000).is_none());
        assert_eq!(cm.free_words(), 5120 + 16384);
        cm.verify();
    }

    #[test]
    fn attach_resets_bump_pointer() {
        let mut mem = Backing::new(1024);
        let mut cm = ChunkManager::new(SIZES);
        let mut chunk = mem.carve(128);
        assert!(chunk.allocate(100).is_some());
        assert!(chunk.allocate(100).is_none());
        cm.return_chunk(chunk);

        let chunk = cm.chunk_freelist_allocate(128).unwrap();
        assert!(chunk.is_empty());
        assert_eq!(chunk.free_word_size(), 128 - CHUNK_OVERHEAD);
    }

    #[test]
    fn remove_region_chunks_updates_totals() {
        let mut mem = Backing::new(1024);
        let mut cm = ChunkManager::new(SIZES);
        cm.return_chunk(mem.carve(128));
        cm.return_chunk(mem.carve(256));
        assert_eq!(cm.remove_region_chunks(RegionId::new(1)), (0, 0));
        assert_eq!(cm.remove_region_chunks(RegionId::new(0)), (384, 2));
        assert_eq!(cm.free_words(), 0);
        assert_eq!(cm.iter().count(), 0);
    }

    #[test]
    #[should_panic(expected = "corrupted chunk header")]
    fn corrupted_header_is_fatal() {
        let mut mem = Backing::new(1024);
        let mut cm = ChunkManager::new(SIZES);
        let chunk = mem.carve(128);
        let base = chunk.base();
        cm.return_chunk(chunk);
        unsafe { base.as_ptr().write(0xdead) };
        let _ = cm.chunk_freelist_allocate(128);
    }
}
