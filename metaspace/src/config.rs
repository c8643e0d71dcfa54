use crate::chunk::ChunkSizes;
use crate::error::Error;
use crate::numeric::{Alignable, WORD_SIZE, bytes_to_words};

const K: usize = 1024;
const M: usize = K * K;

/// The two allocation classes. Class metadata lives in its own, separately
/// capped address range so it can be reached through compressed pointers.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetadataType {
    NonClass = 0,
    Class = 1,
}

impl MetadataType {
    pub const ALL: [MetadataType; 2] = [MetadataType::NonClass, MetadataType::Class];

    #[inline]
    pub const fn is_class(self) -> bool {
        matches!(self, MetadataType::Class)
    }
}

impl core::fmt::Display for MetadataType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NonClass => write!(f, "Metadata space"),
            Self::Class => write!(f, "Class space"),
        }
    }
}

/// Maximum number of Small chunks a non-class domain takes before it
/// switches to Medium chunks.
pub const SMALL_CHUNK_LIMIT: usize = 4;
/// Suggested commit granularity, in Medium chunks, when a region has to grow.
pub const MEDIUM_CHUNK_MULTIPLE: usize = 4;
/// Free-list size, in words, above which allocation consults the block free list.
pub const DICTIONARY_THRESHOLD_WORDS: usize = 64 * K;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Chunk sizes for non-class metadata, in words.
    pub chunk_sizes: ChunkSizes,
    /// Chunk sizes for class metadata, in words.
    pub class_chunk_sizes: ChunkSizes,
    /// Commit granularity in bytes.
    pub commit_granularity: usize,
    /// Reservation granularity in bytes.
    pub reserve_granularity: usize,
    /// Default size of a newly reserved non-class region, in words.
    pub region_words: usize,
    /// Initial high-water mark in bytes.
    pub initial_capacity: usize,
    /// The high-water mark never shrinks below this, in bytes.
    pub min_capacity: usize,
    /// Hard limit on committed memory across both classes, in bytes.
    pub max_capacity: usize,
    /// Size of the class space in bytes, or `None` to serve class metadata
    /// from the non-class space.
    pub class_space_size: Option<usize>,
    pub min_free_ratio: usize,
    pub max_free_ratio: usize,
    /// Smallest high-water mark step, in bytes.
    pub min_expansion: usize,
    /// Largest high-water mark step for ordinary requests, in bytes.
    pub max_expansion: usize,
    pub small_chunk_limit: usize,
    /// See [`DICTIONARY_THRESHOLD_WORDS`].
    pub dictionary_threshold: usize,
    /// Initial chunk of the boot domain, in words.
    pub boot_chunk_words: usize,
}

macro_rules! with {
    ($($field:ident: $ty:ty),* $(,)?) => {
        paste::paste! {
            $(
                #[inline]
                pub const fn [<with_ $field>](self, $field: $ty) -> Self {
                    Self { $field, ..self }
                }
            )*
        }
    };
}

impl Config {
    pub const fn default() -> Self {
        Self {
            chunk_sizes: ChunkSizes::NON_CLASS,
            class_chunk_sizes: ChunkSizes::CLASS,
            commit_granularity: 4 * K,
            reserve_granularity: 64 * K,
            region_words: 256 * K,
            initial_capacity: 16 * M,
            min_capacity: 16 * M,
            max_capacity: isize::MAX as usize & !(64 * K - 1),
            class_space_size: Some(64 * M),
            min_free_ratio: 40,
            max_free_ratio: 70,
            min_expansion: 256 * K,
            max_expansion: 4 * M,
            small_chunk_limit: SMALL_CHUNK_LIMIT,
            dictionary_threshold: DICTIONARY_THRESHOLD_WORDS,
            boot_chunk_words: bytes_to_words(4 * M),
        }
    }

    with! {
        chunk_sizes: ChunkSizes,
        class_chunk_sizes: ChunkSizes,
        commit_granularity: usize,
        reserve_granularity: usize,
        region_words: usize,
        initial_capacity: usize,
        min_capacity: usize,
        max_capacity: usize,
        class_space_size: Option<usize>,
        min_free_ratio: usize,
        max_free_ratio: usize,
        min_expansion: usize,
        max_expansion: usize,
        small_chunk_limit: usize,
        dictionary_threshold: usize,
        boot_chunk_words: usize,
    }

    #[inline]
    pub const fn commit_words(&self) -> usize {
        bytes_to_words(self.commit_granularity)
    }

    #[inline]
    pub const fn reserve_words(&self) -> usize {
        bytes_to_words(self.reserve_granularity)
    }

    #[inline]
    pub const fn chunk_sizes_of(&self, mdtype: MetadataType) -> ChunkSizes {
        match mdtype {
            MetadataType::NonClass => self.chunk_sizes,
            MetadataType::Class => self.class_chunk_sizes,
        }
    }

    /// Suggested commit granularity for a space that has to grow, in words.
    #[inline]
    pub const fn medium_chunk_bunch(&self, mdtype: MetadataType) -> usize {
        self.chunk_sizes_of(mdtype).medium * MEDIUM_CHUNK_MULTIPLE
    }

    pub fn validate(&self) -> Result<(), Error> {
        fn invalid(reason: &'static str) -> Result<(), Error> {
            Err(Error::InvalidConfig { reason })
        }

        if !self.commit_granularity.is_power_of_two() || self.commit_granularity < WORD_SIZE {
            return invalid("commit granularity must be a power of two of at least one word");
        }
        if !self.reserve_granularity.is_power_of_two()
            || !self.reserve_granularity.is_aligned(&self.commit_granularity)
        {
            return invalid("reserve granularity must be a power-of-two multiple of the commit granularity");
        }
        for sizes in [self.chunk_sizes, self.class_chunk_sizes] {
            sizes.validate()?;
            if self.commit_words() % sizes.specialized != 0 {
                return invalid("commit granularity must be a multiple of the specialized chunk size");
            }
        }
        if self.region_words == 0 || self.region_words % self.reserve_words() != 0 {
            return invalid("region size must be a multiple of the reserve granularity");
        }
        if self.region_words < self.chunk_sizes.medium {
            return invalid("region must hold at least one medium chunk");
        }
        if let Some(size) = self.class_space_size {
            if size == 0 || !size.is_aligned(&self.reserve_granularity) {
                return invalid("class space size must be a non-zero multiple of the reserve granularity");
            }
        }
        if self.min_capacity > self.max_capacity || self.initial_capacity > self.max_capacity {
            return invalid("initial and minimum capacity must not exceed maximum capacity");
        }
        if self.min_free_ratio > self.max_free_ratio || self.max_free_ratio > 100 {
            return invalid("free ratios must satisfy min <= max <= 100");
        }
        if self.min_free_ratio == 100 {
            return invalid("minimum free ratio must be below 100");
        }
        if self.min_expansion > self.max_expansion {
            return invalid("minimum expansion must not exceed maximum expansion");
        }
        let sizes = self.chunk_sizes;
        let boot = self.boot_chunk_words;
        if sizes.class_of(boot).is_none() && (boot <= sizes.medium || boot % sizes.specialized != 0) {
            return invalid("boot chunk must be a chunk size or a specialized multiple above medium");
        }
        Ok(())
    }
}
