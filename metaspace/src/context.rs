use alloc::sync::Arc;

use lock_api::Mutex;

use crate::block::MetaBlock;
use crate::chunk::{Chunk, ChunkManager, SizeClass};
use crate::config::{Config, MetadataType};
use crate::domain::Domain;
use crate::error::Error;
use crate::lock::SpinMutex;
use crate::mem::Mprotect;
use crate::numeric::{checked_dec, checked_words_to_bytes, words_to_bytes};
use crate::os::DefaultBackend;
use crate::policy::{CapacityPolicy, Expand, Resize};
use crate::region::RegionList;
use crate::space::{ChunkSource, InUseChunks};
use crate::stats::{MetaspaceStats, VirtualSpaceStats};

/// Regions and free chunks of one allocation class.
struct VirtualSpace<M: Mprotect> {
    regions: RegionList<M>,
    chunks: ChunkManager,
    in_use_words: usize,
    in_use_count: usize,
    free_list_hits: usize,
    carved: usize,
}

impl<M: Mprotect> VirtualSpace<M> {
    fn new(bk: M, mdtype: MetadataType, conf: &Config) -> Result<Self, Error> {
        Ok(Self {
            regions: RegionList::new(bk, mdtype, conf)?,
            chunks: ChunkManager::new(conf.chunk_sizes_of(mdtype)),
            in_use_words: 0,
            in_use_count: 0,
            free_list_hits: 0,
            carved: 0,
        })
    }

    /// Free lists first, then fresh memory from the regions.
    fn acquire(&mut self, chunk_words: usize, suggested: usize, gate: &impl Expand) -> Option<Chunk> {
        let chunk = match self.chunks.chunk_freelist_allocate(chunk_words) {
            Some(chunk) => {
                self.regions.own(chunk.region());
                self.free_list_hits += 1;
                chunk
            }
            None => {
                let class = self.chunks.list_index(chunk_words);
                let chunk =
                    self.regions
                        .get_new_chunk(chunk_words, class, suggested, gate, &mut self.chunks)?;
                self.carved += 1;
                chunk
            }
        };
        self.in_use_words += chunk.word_size();
        self.in_use_count += 1;
        Some(chunk)
    }

    fn release(&mut self, chunks: InUseChunks) {
        for (class, list) in SizeClass::ALL.into_iter().zip(chunks) {
            for chunk in &list {
                self.regions.disown(chunk.region());
                checked_dec(&mut self.in_use_words, chunk.word_size(), "in-use chunk words");
                checked_dec(&mut self.in_use_count, 1, "in-use chunk count");
            }
            self.chunks.return_chunks(class, list);
        }
    }

    fn stats(&self) -> VirtualSpaceStats {
        VirtualSpaceStats {
            region_count: self.regions.region_count(),
            reserved_words: self.regions.reserved_words(),
            committed_words: self.regions.committed_words(),
            in_use_chunk_words: self.in_use_words,
            in_use_chunk_count: self.in_use_count,
            free_chunk_words: self.chunks.free_words(),
            free_chunk_count: self.chunks.free_count(),
            free_list_hits: self.free_list_hits,
            carved: self.carved,
        }
    }

    /// Every committed word is in an in-use chunk, a free chunk, or not yet
    /// carved.
    fn verify(&self) {
        self.chunks.verify();
        self.regions.verify();
        assert_eq!(
            self.in_use_words + self.chunks.free_words() + self.regions.unchunked_words(),
            self.regions.committed_words(),
            "{} committed words unaccounted for",
            self.regions.mdtype()
        );
        assert_eq!(
            self.regions.owner_count(),
            self.in_use_count,
            "{} region owner counts out of sync",
            self.regions.mdtype()
        );
    }
}

/// State behind the expansion lock.
struct Expansion<M: Mprotect> {
    non_class: VirtualSpace<M>,
    class: Option<VirtualSpace<M>>,
}

impl<M: Mprotect> Expansion<M> {
    fn space_mut(&mut self, mdtype: MetadataType) -> &mut VirtualSpace<M> {
        match (mdtype, &mut self.class) {
            (MetadataType::Class, Some(class)) => class,
            _ => &mut self.non_class,
        }
    }

    fn committed_words(&self) -> usize {
        self.non_class.regions.committed_words() + self.class_committed_words()
    }

    fn class_committed_words(&self) -> usize {
        self.class.as_ref().map_or(0, |c| c.regions.committed_words())
    }

    fn spaces(&self) -> impl Iterator<Item = &VirtualSpace<M>> {
        core::iter::once(&self.non_class).chain(self.class.as_ref())
    }
}

/// The shared allocator behind every [`Domain`]: the regions and chunk free
/// lists of both allocation classes, and the capacity policy.
pub struct Metaspace<M: Mprotect = DefaultBackend> {
    conf: Config,
    policy: CapacityPolicy,
    expand: Mutex<SpinMutex, Expansion<M>>,
}

impl<M: Mprotect> core::fmt::Debug for Metaspace<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Metaspace")
            .field("conf", &self.conf)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Metaspace<DefaultBackend> {
    pub fn with_config(conf: Config) -> Result<Arc<Self>, Error> {
        Self::new(conf, DefaultBackend::default())
    }
}

impl<M: Mprotect> Metaspace<M> {
    /// Validates `conf` and reserves the first region of each class.
    pub fn new(conf: Config, bk: M) -> Result<Arc<Self>, Error> {
        conf.validate()?;
        if conf.commit_granularity % bk.page_size() != 0 {
            return Err(Error::InvalidConfig {
                reason: "commit granularity must be a multiple of the page size",
            });
        }

        let non_class = VirtualSpace::new(bk.clone(), MetadataType::NonClass, &conf)?;
        let class = match conf.class_space_size {
            Some(_) => Some(VirtualSpace::new(bk, MetadataType::Class, &conf)?),
            None => None,
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            "[Metaspace]: reserved {} bytes, capacity until GC {} bytes",
            words_to_bytes(
                non_class.regions.reserved_words()
                    + class.as_ref().map_or(0, |c| c.regions.reserved_words())
            ),
            conf.initial_capacity
        );

        Ok(Arc::new(Self {
            policy: CapacityPolicy::new(&conf),
            conf,
            expand: Mutex::new(Expansion { non_class, class }),
        }))
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.conf
    }

    #[inline]
    pub fn has_class_space(&self) -> bool {
        self.conf.class_space_size.is_some()
    }

    #[inline]
    pub fn capacity_until_gc(&self) -> usize {
        self.policy.capacity_until_gc()
    }

    pub fn committed_bytes(&self) -> usize {
        words_to_bytes(self.expand.lock().committed_words())
    }

    /// Hook for the collector after each cycle, with the bytes committed at
    /// that point. Moves the high-water mark.
    pub fn notify_cycle_complete(&self, committed_bytes: usize) -> Resize {
        let _guard = self.expand.lock();
        let resize = self.policy.compute_new_size(committed_bytes);

        #[cfg(feature = "tracing")]
        tracing::debug!("[Metaspace]: cycle complete at {} bytes: {:?}", committed_bytes, resize);

        resize
    }

    /// Raises the high-water mark far enough for `word_size` words and
    /// retries the allocation. Meant for the path after a collection.
    pub fn expand_and_allocate(
        &self,
        domain: &Domain<M>,
        word_size: usize,
        mdtype: MetadataType,
    ) -> Result<MetaBlock, Error> {
        let Some(delta) = checked_words_to_bytes(word_size)
            .and_then(|bytes| self.policy.delta_capacity_until_gc(bytes))
        else {
            return Err(Error::OutOfMemory {
                mdtype,
                requested: word_size,
            });
        };
        if self.policy.inc_capacity_until_gc(delta).is_none() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "[Metaspace]: capacity until GC cannot grow by {} bytes",
                delta
            );
        }
        domain.allocate(word_size, mdtype)
    }

    /// Releases every region no domain holds a chunk of, except the current
    /// one of each class. Returns the number of regions released.
    pub fn purge(&self) -> usize {
        let mut expand = self.expand.lock();
        let Expansion { non_class, class } = &mut *expand;
        let mut purged = non_class.regions.purge(&mut non_class.chunks);
        if let Some(class) = class {
            purged += class.regions.purge(&mut class.chunks);
        }
        purged
    }

    pub fn contains<T>(&self, ptr: *const T) -> bool {
        self.expand.lock().spaces().any(|s| s.regions.contains(ptr))
    }

    pub fn stats(&self) -> MetaspaceStats {
        let expand = self.expand.lock();
        MetaspaceStats {
            non_class: expand.non_class.stats(),
            class: expand.class.as_ref().map(VirtualSpace::stats),
            capacity_until_gc: self.policy.capacity_until_gc(),
            shrink_factor: self.policy.shrink_factor(),
        }
    }

    /// Checks the free chunk totals, the region layout and that committed
    /// memory is fully accounted for. Panics on any mismatch.
    pub fn verify(&self) {
        let expand = self.expand.lock();
        expand.spaces().for_each(VirtualSpace::verify);
    }
}

impl<M: Mprotect> ChunkSource for Metaspace<M> {
    fn get_new_chunk(
        &self,
        mdtype: MetadataType,
        chunk_words: usize,
        suggested: usize,
    ) -> Option<Chunk> {
        let mut expand = self.expand.lock();
        let gate = self
            .policy
            .gate(expand.committed_words(), expand.class_committed_words());
        expand.space_mut(mdtype).acquire(chunk_words, suggested, &gate)
    }

    fn return_chunks(&self, mdtype: MetadataType, chunks: InUseChunks) {
        self.expand.lock().space_mut(mdtype).release(chunks);
    }
}
