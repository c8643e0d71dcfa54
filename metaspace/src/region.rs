use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::chunk::{CHUNK_OVERHEAD, Chunk, ChunkManager, SizeClass, chunk_size_at};
use crate::config::{Config, MetadataType};
use crate::error::Error;
use crate::mem::{MemOps, Mprotect, RawMap};
use crate::numeric::{Alignable, bytes_to_words, checked_dec, round_up, words_to_bytes};
use crate::policy::Expand;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(usize);

impl RegionId {
    #[inline]
    pub(crate) const fn new(id: usize) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// One reserved address range. Chunks are carved from its committed prefix
/// in address order; `top` is the end of the last carved chunk.
pub struct VirtualRegion<M: Mprotect> {
    id: RegionId,
    map: RawMap<M>,
    top: usize,
    owner_count: usize,
}

impl<M: Mprotect> core::fmt::Debug for VirtualRegion<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtualRegion")
            .field("id", &self.id)
            .field("start", &self.map.start_ptr())
            .field("reserved", &self.reserved_words())
            .field("committed", &self.committed_words())
            .field("top", &self.top)
            .field("owner_count", &self.owner_count)
            .finish()
    }
}

impl<M: Mprotect> Drop for VirtualRegion<M> {
    fn drop(&mut self) {
        if let Err(_e) = M::unmap(&mut self.map) {
            #[cfg(feature = "tracing")]
            tracing::error!("[Region]: failed to unmap region {:?}: {:?}", self.id, _e);
        }
    }
}

impl<M: Mprotect> VirtualRegion<M> {
    pub fn new(bk: &M, id: RegionId, word_size: usize) -> Result<Self, M::Error> {
        let map = bk.reserve(words_to_bytes(word_size))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "[Region]: reserve region {:?} of {} words at {:p}",
            id,
            word_size,
            map.start_ptr()
        );

        Ok(Self {
            id,
            map,
            top: 0,
            owner_count: 0,
        })
    }

    #[inline]
    pub fn id(&self) -> RegionId {
        self.id
    }

    #[inline]
    pub fn reserved_words(&self) -> usize {
        bytes_to_words(self.map.size())
    }

    #[inline]
    pub fn committed_words(&self) -> usize {
        bytes_to_words(self.map.committed())
    }

    #[inline]
    pub fn uncommitted_words(&self) -> usize {
        bytes_to_words(self.map.uncommitted())
    }

    /// Committed words not yet carved into chunks.
    #[inline]
    pub fn unchunked_words(&self) -> usize {
        self.committed_words() - self.top
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.top
    }

    #[inline]
    pub fn owner_count(&self) -> usize {
        self.owner_count
    }

    /// Commits `min(preferred, uncommitted)` words. Fails without side
    /// effects when fewer than `min_words` remain uncommitted.
    pub fn expand_by(&mut self, min_words: usize, preferred_words: usize) -> bool {
        let uncommitted = self.uncommitted_words();
        if uncommitted < min_words {
            return false;
        }
        let words = preferred_words.min(uncommitted);
        match self.map.commit(words_to_bytes(words)) {
            Ok(()) => true,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("[Region]: commit of {} words failed: {:?}", words, _e);
                false
            }
        }
    }

    fn carve(&mut self, word_size: usize, class: SizeClass) -> Option<Chunk> {
        if self.unchunked_words() < word_size {
            return None;
        }
        let ptr = self.map.get_mut_ptr(words_to_bytes(self.top)).cast::<usize>();
        let base = NonNull::new(ptr)?;
        let chunk = unsafe { Chunk::carve(base, word_size, class, self.id) };
        self.top += word_size;
        Some(chunk)
    }

    /// Carves an in-use chunk from the committed prefix.
    pub fn take_from_committed(&mut self, word_size: usize, class: SizeClass) -> Option<Chunk> {
        let chunk = self.carve(word_size, class)?;
        self.owner_count += 1;
        Some(chunk)
    }

    /// Hands everything committed but not yet carved to `chunks`, largest
    /// sizes first.
    pub fn retire(&mut self, chunks: &mut ChunkManager) {
        let sizes = *chunks.sizes();
        for class in SizeClass::FIXED.into_iter().rev() {
            let Some(words) = sizes.words(class) else {
                continue;
            };
            while let Some(chunk) = self.carve(words, class) {
                chunks.return_chunk(chunk);
            }
        }
        assert_eq!(
            self.unchunked_words(),
            0,
            "region {:?} retired with stranded words",
            self.id
        );

        #[cfg(feature = "tracing")]
        tracing::debug!("[Region]: retire region {:?}, top {}", self.id, self.top);
    }

    #[inline]
    pub(crate) fn own(&mut self) {
        self.owner_count += 1;
    }

    #[inline]
    pub(crate) fn disown(&mut self) {
        checked_dec(&mut self.owner_count, 1, "region owner count");
    }

    #[inline]
    pub fn contains<T>(&self, ptr: *const T) -> bool {
        self.map.contains_ptr(ptr)
    }

    /// Walks the chunk headers from the bottom of the region up to `top`.
    pub fn verify(&self) {
        assert!(self.top <= self.committed_words(), "{self:?}");
        assert!(self.committed_words() <= self.reserved_words(), "{self:?}");

        let base = self.map.start_ptr().cast::<usize>().cast_mut();
        let mut offset = 0;
        while offset < self.top {
            let at = unsafe { NonNull::new_unchecked(base.add(offset)) };
            let size = unsafe { chunk_size_at(at) };
            match size {
                Some(size) if size > CHUNK_OVERHEAD && offset + size <= self.top => offset += size,
                _ => panic!("bad chunk header at word {offset} of {self:?}"),
            }
        }
    }
}

/// The regions of one allocation class. New chunks come from the current
/// region; when it runs out the list commits more or grows a new region.
pub struct RegionList<M: Mprotect> {
    bk: M,
    mdtype: MetadataType,
    regions: Vec<Option<VirtualRegion<M>>>,
    current: RegionId,
    region_words: usize,
    commit_words: usize,
    reserve_words: usize,
    can_grow: bool,
}

impl<M: Mprotect> core::fmt::Debug for RegionList<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegionList")
            .field("mdtype", &self.mdtype)
            .field("regions", &self.iter().collect::<Vec<_>>())
            .field("current", &self.current)
            .field("can_grow", &self.can_grow)
            .finish()
    }
}

impl<M: Mprotect> RegionList<M> {
    /// Reserves the first region. The class list gets a single region of the
    /// class space size and never grows.
    pub fn new(bk: M, mdtype: MetadataType, conf: &Config) -> Result<Self, Error> {
        let (words, can_grow) = match (mdtype, conf.class_space_size) {
            (MetadataType::Class, Some(size)) => (bytes_to_words(size), false),
            _ => (conf.region_words, true),
        };
        let region = VirtualRegion::new(&bk, RegionId::new(0), words).map_err(|_e| {
            #[cfg(feature = "tracing")]
            tracing::error!("[Region]: initial reservation failed: {:?}", _e);
            Error::Reserve {
                mdtype,
                requested: words_to_bytes(words),
            }
        })?;

        Ok(Self {
            bk,
            mdtype,
            regions: alloc::vec![Some(region)],
            current: RegionId::new(0),
            region_words: conf.region_words,
            commit_words: conf.commit_words(),
            reserve_words: conf.reserve_words(),
            can_grow,
        })
    }

    #[inline]
    pub fn mdtype(&self) -> MetadataType {
        self.mdtype
    }

    #[inline]
    pub fn can_grow(&self) -> bool {
        self.can_grow
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualRegion<M>> {
        self.regions.iter().flatten()
    }

    fn region_mut(&mut self, id: RegionId) -> &mut VirtualRegion<M> {
        match self.regions.get_mut(id.get()) {
            Some(Some(region)) => region,
            _ => panic!("chunk refers to released region {id:?}"),
        }
    }

    #[inline]
    fn current_mut(&mut self) -> &mut VirtualRegion<M> {
        self.region_mut(self.current)
    }

    pub fn current(&self) -> RegionId {
        self.current
    }

    /// Carves a chunk of `chunk_words`, committing memory if needed. The
    /// commit is sized by `suggested` but never less than the chunk itself.
    pub fn get_new_chunk(
        &mut self,
        chunk_words: usize,
        class: SizeClass,
        suggested: usize,
        gate: &impl Expand,
        chunks: &mut ChunkManager,
    ) -> Option<Chunk> {
        if let Some(chunk) = self.current_mut().take_from_committed(chunk_words, class) {
            return Some(chunk);
        }

        let min_words = round_up(chunk_words, self.commit_words);
        let preferred_words = round_up(suggested, self.commit_words).max(min_words);
        if !self.expand_by(min_words, preferred_words, gate, chunks) {
            return None;
        }
        self.current_mut().take_from_committed(chunk_words, class)
    }

    fn expand_by(
        &mut self,
        min_words: usize,
        preferred_words: usize,
        gate: &impl Expand,
        chunks: &mut ChunkManager,
    ) -> bool {
        if !gate.can_expand(min_words, self.mdtype) {
            return false;
        }
        let allowed = gate.allowed_expansion();
        if allowed < min_words {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "[Region]: {} expansion of {} words over the high-water mark, {} allowed",
                self.mdtype,
                min_words,
                allowed
            );
            return false;
        }
        let max_words = preferred_words.min(allowed).align_down(self.commit_words);

        if self.current_mut().expand_by(min_words, max_words) {
            return true;
        }
        if !self.can_grow {
            return false;
        }

        let words = self.region_words.max(preferred_words).align_up(self.reserve_words);
        let id = RegionId::new(self.regions.len());
        let region = match VirtualRegion::new(&self.bk, id, words) {
            Ok(region) => region,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("[Region]: failed to reserve {} words: {:?}", words, _e);
                return false;
            }
        };

        self.current_mut().retire(chunks);
        self.regions.push(Some(region));
        self.current = id;
        self.current_mut().expand_by(min_words, max_words)
    }

    #[inline]
    pub(crate) fn own(&mut self, id: RegionId) {
        self.region_mut(id).own();
    }

    #[inline]
    pub(crate) fn disown(&mut self, id: RegionId) {
        self.region_mut(id).disown();
    }

    /// Releases every region other than the current one that no space
    /// manager owns a chunk of. Returns the number of regions released.
    pub fn purge(&mut self, chunks: &mut ChunkManager) -> usize {
        let mut purged = 0;
        for slot in self.regions.iter_mut() {
            let Some(region) = slot else {
                continue;
            };
            if region.id() == self.current || region.owner_count() != 0 {
                continue;
            }
            let (words, _count) = chunks.remove_region_chunks(region.id());
            assert_eq!(
                words,
                region.top(),
                "region {:?} purged with chunks outside the free lists",
                region.id()
            );

            #[cfg(feature = "tracing")]
            tracing::debug!(
                "[Region]: purge region {:?}, {} free chunks dropped",
                region.id(),
                _count
            );

            *slot = None;
            purged += 1;
        }
        purged
    }

    pub fn contains<T>(&self, ptr: *const T) -> bool {
        self.iter().any(|r| r.contains(ptr))
    }

    pub fn reserved_words(&self) -> usize {
        self.iter().map(VirtualRegion::reserved_words).sum()
    }

    pub fn committed_words(&self) -> usize {
        self.iter().map(VirtualRegion::committed_words).sum()
    }

    pub fn unchunked_words(&self) -> usize {
        self.iter().map(VirtualRegion::unchunked_words).sum()
    }

    pub fn owner_count(&self) -> usize {
        self.iter().map(VirtualRegion::owner_count).sum()
    }

    pub fn region_count(&self) -> usize {
        self.iter().count()
    }

    pub fn verify(&self) {
        assert!(
            matches!(self.regions.get(self.current.get()), Some(Some(_))),
            "current region {:?} is gone",
            self.current
        );
        for region in self.iter() {
            region.verify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkSizes;
    use crate::os::heap::HeapBackend;

    const SIZES: ChunkSizes = ChunkSizes::new(128, 256, 4096);

    /// Lets through any expansion up to a fixed number of words.
    struct Budget(usize);

    impl Expand for Budget {
        fn can_expand(&self, word_size: usize, _mdtype: MetadataType) -> bool {
            word_size <= self.0
        }

        fn allowed_expansion(&self) -> usize {
            self.0
        }
    }

    fn conf() -> Config {
        Config::default()
            .with_chunk_sizes(SIZES)
            .with_commit_granularity(32 * 1024)
            .with_region_words(16 * 1024)
            .with_class_space_size(None)
    }

    #[test]
    fn carve_commits_on_demand() {
        let conf = conf();
        let mut list = RegionList::new(HeapBackend, MetadataType::NonClass, &conf).unwrap();
        let mut cm = ChunkManager::new(SIZES);
        assert_eq!(list.committed_words(), 0);

        let chunk = list
            .get_new_chunk(256, SizeClass::Small, 256, &Budget(usize::MAX), &mut cm)
            .unwrap();
        assert_eq!(chunk.word_size(), 256);
        assert_eq!(list.committed_words(), conf.commit_words());
        assert_eq!(list.owner_count(), 1);
        list.verify();
    }

    #[test]
    fn policy_denial_has_no_side_effects() {
        let conf = conf();
        let mut list = RegionList::new(HeapBackend, MetadataType::NonClass, &conf).unwrap();
        let mut cm = ChunkManager::new(SIZES);
        assert!(
            list.get_new_chunk(256, SizeClass::Small, 256, &Budget(0), &mut cm)
                .is_none()
        );
        assert_eq!(list.committed_words(), 0);
        assert_eq!(list.owner_count(), 0);
    }

    #[test]
    fn growth_retires_previous_region() {
        let conf = conf();
        let mut list = RegionList::new(HeapBackend, MetadataType::NonClass, &conf).unwrap();
        let mut cm = ChunkManager::new(SIZES);
        let gate = Budget(usize::MAX);

        let small = list
            .get_new_chunk(256, SizeClass::Small, 256, &gate, &mut cm)
            .unwrap();
        assert_eq!(small.region(), RegionId::new(0));
        let big = list
            .get_new_chunk(16 * 1024, SizeClass::Humongous, 16 * 1024, &gate, &mut cm)
            .unwrap();
        assert_eq!(big.region(), RegionId::new(1));
        assert_eq!(list.region_count(), 2);

        // the rest of the first commit went to the free lists as small chunks
        let leftover = conf.commit_words() - 256;
        assert_eq!(cm.free_words(), leftover);
        assert_eq!(cm.free_count_of(SizeClass::Small), leftover / 256);
        assert_eq!(list.unchunked_words(), 0);
        list.verify();
        cm.verify();
    }

    #[test]
    fn purge_releases_unowned_regions() {
        let conf = conf();
        let mut list = RegionList::new(HeapBackend, MetadataType::NonClass, &conf).unwrap();
        let mut cm = ChunkManager::new(SIZES);
        let gate = Budget(usize::MAX);

        let mut held = alloc::vec::Vec::new();
        while list.region_count() < 2 {
            held.push(
                list.get_new_chunk(4096, SizeClass::Medium, 4096, &gate, &mut cm)
                    .unwrap(),
            );
        }
        assert_eq!(list.purge(&mut cm), 0);

        for chunk in held.drain(..) {
            list.disown(chunk.region());
            cm.return_chunk(chunk);
        }
        assert_eq!(list.purge(&mut cm), 1);
        assert_eq!(list.region_count(), 1);
        assert_eq!(cm.free_words(), 4096);
        assert_eq!(cm.iter().filter(|c| c.region() == RegionId::new(0)).count(), 0);
        list.verify();
    }

    #[test]
    fn class_list_never_grows() {
        let conf = conf().with_class_space_size(Some(64 * 1024));
        let mut list = RegionList::new(HeapBackend, MetadataType::Class, &conf).unwrap();
        let mut cm = ChunkManager::new(SIZES);
        assert!(!list.can_grow());
        let mut n = 0;
        while let Some(chunk) =
            list.get_new_chunk(4096, SizeClass::Medium, 4096, &Budget(usize::MAX), &mut cm)
        {
            core::mem::forget(chunk);
            n += 1;
        }
        assert_eq!(n, bytes_to_words(64 * 1024) / 4096);
        assert_eq!(list.region_count(), 1);
    }
}
