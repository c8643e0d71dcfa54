use alloc::vec::Vec;

use crate::block::{BlockFreeList, MetaBlock, SMALL_BLOCK_MIN_WORDS, raw_word_size};
use crate::chunk::{CHUNK_OVERHEAD, Chunk, ChunkSizes, SizeClass};
use crate::config::{Config, MetadataType};
use crate::domain::DomainKind;
use crate::numeric::{MAX_WORDS, checked_round_up, round_up};
use crate::stats::{SpaceCounters, SpaceStats};

/// The chunks a space manager owns, indexed by [`SizeClass::index`].
pub type InUseChunks = [Vec<Chunk>; 4];

/// Where a space manager gets its chunks from and gives them back to.
pub trait ChunkSource {
    fn get_new_chunk(
        &self,
        mdtype: MetadataType,
        chunk_words: usize,
        suggested: usize,
    ) -> Option<Chunk>;

    fn return_chunks(&self, mdtype: MetadataType, chunks: InUseChunks);
}

/// Per-domain allocator for one metadata type. Blocks are bumped off the
/// current chunk or recycled from the block free list.
pub struct SpaceManager {
    mdtype: MetadataType,
    sizes: ChunkSizes,
    /// Class spaces have no limit.
    small_chunk_limit: Option<usize>,
    dictionary_threshold: usize,
    medium_chunk_bunch: usize,
    boot_chunk_words: usize,
    chunks_in_use: InUseChunks,
    current: Option<(SizeClass, usize)>,
    allocated_block_words: usize,
    allocated_chunk_words: usize,
    allocated_chunk_count: usize,
    free_list: BlockFreeList,
    counters: SpaceCounters,
}

impl core::fmt::Debug for SpaceManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpaceManager")
            .field("mdtype", &self.mdtype)
            .field("current", &self.current)
            .field("allocated_block_words", &self.allocated_block_words)
            .field("allocated_chunk_words", &self.allocated_chunk_words)
            .field("allocated_chunk_count", &self.allocated_chunk_count)
            .field("free_list", &self.free_list)
            .finish()
    }
}

impl SpaceManager {
    pub fn new(mdtype: MetadataType, conf: &Config) -> Self {
        let sizes = conf.chunk_sizes_of(mdtype);
        Self {
            mdtype,
            sizes,
            small_chunk_limit: (!mdtype.is_class()).then_some(conf.small_chunk_limit),
            dictionary_threshold: conf.dictionary_threshold,
            medium_chunk_bunch: conf.medium_chunk_bunch(mdtype),
            boot_chunk_words: match mdtype {
                MetadataType::NonClass => conf.boot_chunk_words,
                MetadataType::Class => sizes.medium,
            },
            chunks_in_use: Default::default(),
            current: None,
            allocated_block_words: 0,
            allocated_chunk_words: 0,
            allocated_chunk_count: 0,
            free_list: BlockFreeList::new(),
            counters: SpaceCounters::default(),
        }
    }

    #[inline]
    pub fn mdtype(&self) -> MetadataType {
        self.mdtype
    }

    /// Size of the first chunk a domain of `kind` takes, rounded up to the
    /// next fixed size or to a specialized multiple.
    pub fn initial_chunk_words(&self, kind: DomainKind) -> usize {
        let requested = match kind {
            DomainKind::Boot => self.boot_chunk_words,
            DomainKind::Reflection | DomainKind::Anonymous => self.sizes.specialized,
            DomainKind::Standard => self.sizes.small,
        };
        SizeClass::FIXED
            .into_iter()
            .filter_map(|class| self.sizes.words(class))
            .find(|&words| requested <= words)
            .unwrap_or_else(|| round_up(requested, self.sizes.specialized))
    }

    /// Takes the initial chunk. On failure the space starts without a
    /// current chunk and the first allocation grows it.
    pub fn initialize(&mut self, kind: DomainKind, src: &impl ChunkSource) -> bool {
        let words = self.initial_chunk_words(kind);
        match src.get_new_chunk(self.mdtype, words, self.medium_chunk_bunch) {
            Some(chunk) => {
                self.add_chunk(chunk, true);
                true
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "[Space]: no initial {} chunk of {} words for {:?} domain",
                    self.mdtype,
                    words,
                    kind
                );
                false
            }
        }
    }

    #[inline]
    fn current_chunk_mut(&mut self) -> Option<&mut Chunk> {
        let (class, idx) = self.current?;
        self.chunks_in_use[class.index()].get_mut(idx)
    }

    pub fn allocate(&mut self, word_size: usize, src: &impl ChunkSource) -> Option<MetaBlock> {
        let raw = raw_word_size(word_size);

        if self.free_list.total_words() > self.dictionary_threshold {
            if let Some(block) = self.free_list.get_block(raw) {
                self.counters.free_list_hits += 1;
                return Some(block);
            }
        }

        if let Some(block) = self.current_chunk_mut().and_then(|c| c.allocate(raw)) {
            self.allocated_block_words += raw;
            self.counters.bump_hits += 1;
            return Some(block);
        }

        self.grow_and_allocate(raw, src)
    }

    fn grow_and_allocate(&mut self, word_size: usize, src: &impl ChunkSource) -> Option<MetaBlock> {
        let Some(chunk_words) = self.calc_chunk_size(word_size) else {
            #[cfg(feature = "tracing")]
            tracing::debug!("[Space]: no chunk can hold a {} word block", word_size);
            return None;
        };
        let Some(chunk) = src.get_new_chunk(self.mdtype, chunk_words, self.medium_chunk_bunch)
        else {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "[Space]: no {} chunk of {} words for a {} word block",
                self.mdtype,
                chunk_words,
                word_size
            );
            return None;
        };

        let humongous = chunk.class().is_humongous();
        self.add_chunk(chunk, false);
        let chunk = if humongous {
            self.chunks_in_use[SizeClass::Humongous.index()].last_mut()?
        } else {
            self.current_chunk_mut()?
        };
        let block = chunk.allocate(word_size)?;
        self.allocated_block_words += word_size;
        Some(block)
    }

    /// Chunk size for a block of `word_size` words: Small until the domain
    /// has used `small_chunk_limit` of them or any Medium chunk, Medium
    /// after that, and humongous when the block fits neither. `None` when
    /// the chunk would not be addressable.
    pub fn calc_chunk_size(&self, word_size: usize) -> Option<usize> {
        let needed = word_size.checked_add(CHUNK_OVERHEAD)?;
        let small_in_use = self.chunks_in_use[SizeClass::Small.index()].len();
        let medium_in_use = !self.chunks_in_use[SizeClass::Medium.index()].is_empty();

        let chunk_words = if !medium_in_use
            && self.small_chunk_limit.is_none_or(|limit| small_in_use < limit)
        {
            if needed > self.sizes.small {
                self.sizes.medium
            } else {
                self.sizes.small
            }
        } else {
            self.sizes.medium
        };
        let chunk_words = chunk_words.max(checked_round_up(needed, self.sizes.specialized)?);
        (chunk_words <= MAX_WORDS).then_some(chunk_words)
    }

    /// Takes ownership of a fresh chunk. A fixed-size chunk always becomes
    /// current; a humongous one only when `make_current` is set.
    fn add_chunk(&mut self, chunk: Chunk, make_current: bool) {
        let class = chunk.class();
        let words = chunk.word_size();

        if class.is_humongous() && !make_current {
            self.chunks_in_use[class.index()].push(chunk);
        } else {
            self.retire_current_chunk();
            let list = &mut self.chunks_in_use[class.index()];
            list.push(chunk);
            self.current = Some((class, list.len() - 1));
        }

        self.allocated_chunk_words += words;
        self.allocated_chunk_count += 1;
        self.counters.chunk_requests += 1;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "[Space]: add {:?} chunk of {} words to {}, {} chunks in use",
            class,
            words,
            self.mdtype,
            self.allocated_chunk_count
        );
    }

    /// Moves what is left of the current chunk into the block free list.
    fn retire_current_chunk(&mut self) {
        let Some(chunk) = self.current_chunk_mut() else {
            return;
        };
        let remaining = chunk.free_word_size();
        if remaining < SMALL_BLOCK_MIN_WORDS {
            return;
        }
        let Some(block) = chunk.allocate(remaining) else {
            return;
        };
        self.allocated_block_words += remaining;
        self.free_list.return_block(block, remaining);
    }

    pub fn deallocate(&mut self, block: MetaBlock, word_size: usize) {
        debug_assert!(
            self.contains(block.as_ptr()),
            "{block:?} does not belong to this space"
        );
        self.free_list.return_block(block, raw_word_size(word_size));
    }

    /// Gives every chunk back to `src` and forgets all blocks.
    pub fn teardown(&mut self, src: &impl ChunkSource) {
        let chunks = core::mem::take(&mut self.chunks_in_use);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "[Space]: teardown {}, returning {} chunks of {} words",
            self.mdtype,
            self.allocated_chunk_count,
            self.allocated_chunk_words
        );

        self.current = None;
        self.free_list = BlockFreeList::new();
        self.allocated_block_words = 0;
        self.allocated_chunk_words = 0;
        self.allocated_chunk_count = 0;
        src.return_chunks(self.mdtype, chunks);
    }

    pub fn contains<T>(&self, ptr: *const T) -> bool {
        self.chunks_in_use.iter().flatten().any(|c| c.contains(ptr))
    }

    pub fn stats(&self) -> SpaceStats {
        let chunks = self.chunks_in_use.iter().flatten();
        SpaceStats {
            capacity_words: self.allocated_chunk_words,
            used_words: self.allocated_block_words,
            free_block_words: self.free_list.total_words(),
            dark_words: self.free_list.dark_words(),
            unused_words: chunks.map(Chunk::free_word_size).sum(),
            overhead_words: self.allocated_chunk_count * CHUNK_OVERHEAD,
            chunk_count: core::array::from_fn(|i| self.chunks_in_use[i].len()),
            counters: self.counters,
        }
    }

    pub fn verify(&self) {
        let mut words = 0;
        let mut count = 0;
        let mut used = 0;
        for class in SizeClass::ALL {
            for chunk in &self.chunks_in_use[class.index()] {
                assert_eq!(chunk.class(), class, "{chunk:?} in the wrong list");
                chunk.verify(false);
                words += chunk.word_size();
                count += 1;
                used += chunk.used_word_size() - CHUNK_OVERHEAD;
            }
        }
        assert_eq!(words, self.allocated_chunk_words, "{self:?}");
        assert_eq!(count, self.allocated_chunk_count, "{self:?}");
        assert_eq!(used, self.allocated_block_words, "{self:?}");
        if let Some((class, idx)) = self.current {
            assert!(idx < self.chunks_in_use[class.index()].len(), "{self:?}");
        }
        self.free_list.verify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionId;
    use core::cell::RefCell;
    use core::ptr::NonNull;

    /// Carves chunks off a plain buffer.
    struct Source {
        sizes: ChunkSizes,
        mem: RefCell<(Vec<usize>, usize)>,
        returned: RefCell<Vec<Chunk>>,
    }

    impl Source {
        fn new(sizes: ChunkSizes, words: usize) -> Self {
            Self {
                sizes,
                mem: RefCell::new((alloc::vec![0; words], 0)),
                returned: RefCell::new(Vec::new()),
            }
        }
    }

    impl ChunkSource for Source {
        fn get_new_chunk(&self, _: MetadataType, chunk_words: usize, _: usize) -> Option<Chunk> {
            let mut mem = self.mem.borrow_mut();
            let (buf, top) = &mut *mem;
            if *top + chunk_words > buf.len() {
                return None;
            }
            let base = NonNull::new(unsafe { buf.as_mut_ptr().add(*top) })?;
            *top += chunk_words;
            let class = self.sizes.list_index(chunk_words);
            Some(unsafe { Chunk::carve(base, chunk_words, class, RegionId::new(0)) })
        }

        fn return_chunks(&self, _: MetadataType, chunks: InUseChunks) {
            self.returned
                .borrow_mut()
                .extend(chunks.into_iter().flatten());
        }
    }

    fn conf() -> Config {
        Config::default().with_dictionary_threshold(0)
    }

    fn space(mdtype: MetadataType, src: &Source) -> SpaceManager {
        let mut sm = SpaceManager::new(mdtype, &conf());
        assert!(sm.initialize(DomainKind::Standard, src));
        sm
    }

    #[test]
    fn chunk_size_progression() {
        let src = Source::new(ChunkSizes::NON_CLASS, 64 * 1024);
        let mut sm = space(MetadataType::NonClass, &src);
        assert_eq!(sm.calc_chunk_size(10), Some(512));
        assert_eq!(sm.calc_chunk_size(600), Some(8192));
        assert_eq!(sm.calc_chunk_size(9000), Some(9088));

        for _ in 0..3 {
            let chunk = src.get_new_chunk(MetadataType::NonClass, 512, 0).unwrap();
            sm.add_chunk(chunk, false);
        }
        assert_eq!(sm.calc_chunk_size(10), Some(8192));
        sm.verify();
    }

    #[test]
    fn class_space_has_no_small_limit() {
        let src = Source::new(ChunkSizes::CLASS, 64 * 1024);
        let mut sm = space(MetadataType::Class, &src);
        for _ in 0..8 {
            let chunk = src.get_new_chunk(MetadataType::Class, 256, 0).unwrap();
            sm.add_chunk(chunk, false);
        }
        assert_eq!(sm.calc_chunk_size(10), Some(256));
        assert_eq!(sm.calc_chunk_size(300), Some(4096));
    }

    #[test]
    fn initial_chunk_by_kind() {
        let conf = conf();
        let sm = SpaceManager::new(MetadataType::NonClass, &conf);
        assert_eq!(sm.initial_chunk_words(DomainKind::Standard), 512);
        assert_eq!(sm.initial_chunk_words(DomainKind::Reflection), 128);
        assert_eq!(sm.initial_chunk_words(DomainKind::Anonymous), 128);
        assert_eq!(sm.initial_chunk_words(DomainKind::Boot), conf.boot_chunk_words);

        let sm = SpaceManager::new(MetadataType::Class, &conf);
        assert_eq!(sm.initial_chunk_words(DomainKind::Standard), 256);
        assert_eq!(sm.initial_chunk_words(DomainKind::Boot), 4096);
    }

    #[test]
    fn freed_block_is_reused() {
        let src = Source::new(ChunkSizes::NON_CLASS, 64 * 1024);
        let mut sm = space(MetadataType::NonClass, &src);

        let blocks: Vec<_> = (0..10).map(|_| sm.allocate(20, &src).unwrap()).collect();
        assert_eq!(sm.stats().counters.chunk_requests, 1);
        assert_eq!(sm.stats().counters.bump_hits, 10);

        sm.deallocate(blocks[4], 20);
        assert_eq!(sm.allocate(20, &src), Some(blocks[4]));
        assert_eq!(sm.stats().counters.free_list_hits, 1);
        assert_eq!(sm.stats().counters.chunk_requests, 1);
        sm.verify();
    }

    #[test]
    fn remainder_moves_to_free_list() {
        let src = Source::new(ChunkSizes::NON_CLASS, 64 * 1024);
        let mut sm = space(MetadataType::NonClass, &src);

        let first = sm.allocate(500, &src).unwrap();
        assert!(sm.allocate(20, &src).is_some());
        assert_eq!(sm.stats().chunks(SizeClass::Small), 2);
        assert_eq!(sm.stats().free_block_words, 512 - CHUNK_OVERHEAD - 500);

        let tail = sm.allocate(9, &src).unwrap();
        assert_eq!(tail.addr(), first.addr() + 500 * size_of::<usize>());
        assert_eq!(sm.stats().free_block_words, 0);
        sm.verify();
    }

    #[test]
    fn humongous_chunk_keeps_current() {
        let src = Source::new(ChunkSizes::NON_CLASS, 64 * 1024);
        let mut sm = space(MetadataType::NonClass, &src);

        let big = sm.allocate(9000, &src).unwrap();
        let small = sm.allocate(10, &src).unwrap();
        let stats = sm.stats();
        assert_eq!(stats.chunk_count, [0, 1, 0, 1]);
        assert!(sm.chunks_in_use[SizeClass::Small.index()][0].contains(small.as_ptr()));
        assert!(sm.chunks_in_use[SizeClass::Humongous.index()][0].contains(big.as_ptr()));
        assert_eq!(stats.capacity_words, 512 + 9088);
        assert_eq!(
            stats.capacity_words,
            stats.used_words + stats.unused_words + stats.overhead_words
        );
        sm.verify();
    }

    #[test]
    fn exhausted_source_fails_cleanly() {
        let src = Source::new(ChunkSizes::NON_CLASS, 512);
        let mut sm = space(MetadataType::NonClass, &src);
        assert!(sm.allocate(400, &src).is_some());
        assert!(sm.allocate(400, &src).is_none());
        assert_eq!(sm.stats().chunk_count, [0, 1, 0, 0]);
        sm.verify();

        let mut empty = SpaceManager::new(MetadataType::NonClass, &conf());
        assert!(!empty.initialize(DomainKind::Standard, &src));
        assert!(empty.allocate(1, &src).is_none());
    }

    #[test]
    fn free_list_waits_for_the_threshold() {
        let src = Source::new(ChunkSizes::NON_CLASS, 64 * 1024);
        let mut sm = SpaceManager::new(MetadataType::NonClass, &Config::default());
        assert!(sm.initialize(DomainKind::Standard, &src));
        let block = sm.allocate(20, &src).unwrap();
        sm.deallocate(block, 20);

        let next = sm.allocate(20, &src).unwrap();
        assert_ne!(next, block);
        let stats = sm.stats();
        assert_eq!(stats.counters.free_list_hits, 0);
        assert_eq!(stats.free_block_words, 20);
    }

    #[test]
    fn unaddressable_request_has_no_side_effects() {
        let src = Source::new(ChunkSizes::NON_CLASS, 64 * 1024);
        let mut sm = space(MetadataType::NonClass, &src);
        let block = sm.allocate(100, &src).unwrap();
        sm.deallocate(block, 100);
        let before = sm.stats();

        for words in [usize::MAX, usize::MAX - CHUNK_OVERHEAD, usize::MAX / 4, MAX_WORDS] {
            assert_eq!(sm.calc_chunk_size(words), None, "{words}");
            assert!(sm.allocate(words, &src).is_none());
        }
        assert_eq!(sm.stats(), before);
        assert!(src.returned.borrow().is_empty());
        sm.verify();
    }

    #[test]
    fn teardown_returns_every_chunk() {
        let src = Source::new(ChunkSizes::NON_CLASS, 64 * 1024);
        let mut sm = space(MetadataType::NonClass, &src);
        for _ in 0..40 {
            sm.allocate(fastrand::usize(1..200), &src).unwrap();
        }
        sm.allocate(9000, &src).unwrap();
        let count = sm.stats().chunk_count.iter().sum::<usize>();

        sm.teardown(&src);
        assert_eq!(src.returned.borrow().len(), count);
        assert_eq!(sm.stats(), SpaceStats {
            counters: sm.stats().counters,
            ..SpaceStats::default()
        });
        sm.verify();
    }
}
