use core::fmt;

use crate::chunk::SizeClass;
use crate::config::MetadataType;
use crate::domain::DomainKind;
use crate::numeric::words_to_bytes;

/// Where a space manager's allocations were served from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpaceCounters {
    /// Chunks acquired, the initial chunk included.
    pub chunk_requests: usize,
    pub free_list_hits: usize,
    pub bump_hits: usize,
}

/// Usage of one space manager, in words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpaceStats {
    /// Words in chunks owned by the space.
    pub capacity_words: usize,
    /// Words ever bumped out of those chunks, freed blocks included.
    pub used_words: usize,
    /// Words sitting in the block free list.
    pub free_block_words: usize,
    /// Words lost to fragments too small to track.
    pub dark_words: usize,
    /// Words left at the top of the owned chunks.
    pub unused_words: usize,
    /// Words taken by chunk headers.
    pub overhead_words: usize,
    /// Owned chunks, indexed by [`SizeClass::index`].
    pub chunk_count: [usize; 4],
    pub counters: SpaceCounters,
}

impl SpaceStats {
    /// Words currently live in the hands of the owner.
    #[inline]
    pub fn live_words(&self) -> usize {
        self.used_words - self.free_block_words - self.dark_words
    }

    #[inline]
    pub fn chunks(&self, class: SizeClass) -> usize {
        self.chunk_count[class.index()]
    }
}

impl fmt::Display for SpaceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "capacity {}B, used {}B ({}B free blocks, {}B dark), unused {}B, \
             chunks {}/{}/{}/{} (specialized/small/medium/humongous)",
            words_to_bytes(self.capacity_words),
            words_to_bytes(self.used_words),
            words_to_bytes(self.free_block_words),
            words_to_bytes(self.dark_words),
            words_to_bytes(self.unused_words),
            self.chunk_count[0],
            self.chunk_count[1],
            self.chunk_count[2],
            self.chunk_count[3],
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainStats {
    pub kind: DomainKind,
    pub non_class: SpaceStats,
    /// `None` when class metadata shares the non-class space.
    pub class: Option<SpaceStats>,
}

impl DomainStats {
    pub fn of(&self, mdtype: MetadataType) -> &SpaceStats {
        match (mdtype, &self.class) {
            (MetadataType::Class, Some(class)) => class,
            _ => &self.non_class,
        }
    }
}

impl fmt::Display for DomainStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:?} domain", self.kind)?;
        write!(f, "  {}: {}", MetadataType::NonClass, self.non_class)?;
        if let Some(class) = &self.class {
            write!(f, "\n  {}: {}", MetadataType::Class, class)?;
        }
        Ok(())
    }
}

/// Totals of one allocation class across all regions, in words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VirtualSpaceStats {
    pub region_count: usize,
    pub reserved_words: usize,
    pub committed_words: usize,
    pub in_use_chunk_words: usize,
    pub in_use_chunk_count: usize,
    pub free_chunk_words: usize,
    pub free_chunk_count: usize,
    /// Chunk requests served by the chunk free lists.
    pub free_list_hits: usize,
    /// Chunk requests served by carving fresh memory.
    pub carved: usize,
}

impl fmt::Display for VirtualSpaceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} regions, reserved {}B, committed {}B, in use {}B in {} chunks, \
             free {}B in {} chunks",
            self.region_count,
            words_to_bytes(self.reserved_words),
            words_to_bytes(self.committed_words),
            words_to_bytes(self.in_use_chunk_words),
            self.in_use_chunk_count,
            words_to_bytes(self.free_chunk_words),
            self.free_chunk_count,
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaspaceStats {
    pub non_class: VirtualSpaceStats,
    pub class: Option<VirtualSpaceStats>,
    /// High-water mark in bytes.
    pub capacity_until_gc: usize,
    pub shrink_factor: u32,
}

impl MetaspaceStats {
    pub fn committed_bytes(&self) -> usize {
        let class = self.class.map_or(0, |c| c.committed_words);
        words_to_bytes(self.non_class.committed_words + class)
    }

    pub fn reserved_bytes(&self) -> usize {
        let class = self.class.map_or(0, |c| c.reserved_words);
        words_to_bytes(self.non_class.reserved_words + class)
    }
}

impl fmt::Display for MetaspaceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "committed {}B, reserved {}B, capacity until GC {}B",
            self.committed_bytes(),
            self.reserved_bytes(),
            self.capacity_until_gc
        )?;
        write!(f, "  {}: {}", MetadataType::NonClass, self.non_class)?;
        if let Some(class) = &self.class {
            write!(f, "\n  {}: {}", MetadataType::Class, class)?;
        }
        Ok(())
    }
}
