use alloc::sync::Arc;

use lock_api::Mutex;

use crate::block::MetaBlock;
use crate::config::MetadataType;
use crate::context::Metaspace;
use crate::error::Error;
use crate::lock::SpinMutex;
use crate::mem::Mprotect;
use crate::os::DefaultBackend;
use crate::space::SpaceManager;
use crate::stats::DomainStats;

/// What a domain holds, which decides the size of its first chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DomainKind {
    #[default]
    Standard,
    /// The long-lived domain of the runtime itself.
    Boot,
    Reflection,
    /// A domain for a single anonymous unit, usually tiny.
    Anonymous,
}

/// The runtime's full collection, run when an allocation fails.
pub trait Collector<M: Mprotect> {
    fn collect(&mut self, ctx: &Metaspace<M>, mdtype: MetadataType);
}

impl<M: Mprotect, F> Collector<M> for F
where
    F: FnMut(&Metaspace<M>, MetadataType),
{
    #[inline]
    fn collect(&mut self, ctx: &Metaspace<M>, mdtype: MetadataType) {
        self(ctx, mdtype)
    }
}

struct Spaces {
    non_class: SpaceManager,
    /// `None` when class metadata goes to the non-class space.
    class: Option<SpaceManager>,
}

impl Spaces {
    fn get_mut(&mut self, mdtype: MetadataType) -> &mut SpaceManager {
        match (mdtype, &mut self.class) {
            (MetadataType::Class, Some(class)) => class,
            _ => &mut self.non_class,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &SpaceManager> {
        core::iter::once(&self.non_class).chain(self.class.as_ref())
    }
}

/// An allocation domain. Everything allocated through it is released at
/// once when it is destroyed or dropped.
pub struct Domain<M: Mprotect = DefaultBackend> {
    ctx: Arc<Metaspace<M>>,
    kind: DomainKind,
    spaces: Mutex<SpinMutex, Spaces>,
}

impl<M: Mprotect> core::fmt::Debug for Domain<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain").field("kind", &self.kind).finish()
    }
}

impl<M: Mprotect> Domain<M> {
    /// Creates a domain and takes its initial chunks. A domain whose initial
    /// chunks could not be had is still usable; it grows on first use.
    pub fn new(ctx: &Arc<Metaspace<M>>, kind: DomainKind) -> Self {
        let conf = ctx.config();
        let mut non_class = SpaceManager::new(MetadataType::NonClass, conf);
        non_class.initialize(kind, &**ctx);
        let class = ctx.has_class_space().then(|| {
            let mut class = SpaceManager::new(MetadataType::Class, conf);
            class.initialize(kind, &**ctx);
            class
        });

        #[cfg(feature = "tracing")]
        tracing::debug!("[Domain]: new {:?} domain", kind);

        Self {
            ctx: ctx.clone(),
            kind,
            spaces: Mutex::new(Spaces { non_class, class }),
        }
    }

    #[inline]
    pub fn kind(&self) -> DomainKind {
        self.kind
    }

    #[inline]
    pub fn metaspace(&self) -> &Arc<Metaspace<M>> {
        &self.ctx
    }

    /// Allocates `word_size` zeroed words of `mdtype` metadata.
    pub fn allocate(&self, word_size: usize, mdtype: MetadataType) -> Result<MetaBlock, Error> {
        debug_assert!(word_size > 0, "zero-sized metadata allocation");
        let block = self
            .spaces
            .lock()
            .get_mut(mdtype)
            .allocate(word_size, &*self.ctx)
            .ok_or(Error::OutOfMemory {
                mdtype,
                requested: word_size,
            })?;
        unsafe { block.as_ptr().write_bytes(0, word_size) };
        Ok(block)
    }

    /// Returns a block early, before the domain goes away. `word_size` must
    /// be the size it was allocated with.
    pub fn deallocate(&self, block: MetaBlock, word_size: usize, mdtype: MetadataType) {
        self.spaces.lock().get_mut(mdtype).deallocate(block, word_size);
    }

    /// Allocates, and on failure runs `collector` and tries again, raising
    /// the high-water mark if that is still not enough.
    pub fn allocate_or_collect(
        &self,
        word_size: usize,
        mdtype: MetadataType,
        collector: &mut impl Collector<M>,
    ) -> Result<MetaBlock, Error> {
        if let Ok(block) = self.allocate(word_size, mdtype) {
            return Ok(block);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "[Domain]: {} allocation of {} words failed, collecting",
            mdtype,
            word_size
        );

        collector.collect(&self.ctx, mdtype);
        self.allocate(word_size, mdtype)
            .or_else(|_| self.ctx.expand_and_allocate(self, word_size, mdtype))
    }

    pub fn stats(&self) -> DomainStats {
        let spaces = self.spaces.lock();
        DomainStats {
            kind: self.kind,
            non_class: spaces.non_class.stats(),
            class: spaces.class.as_ref().map(SpaceManager::stats),
        }
    }

    pub fn contains<T>(&self, ptr: *const T) -> bool {
        self.spaces.lock().iter().any(|s| s.contains(ptr))
    }

    pub fn verify(&self) {
        self.spaces.lock().iter().for_each(SpaceManager::verify);
    }

    /// Returns every chunk of the domain to the metaspace.
    pub fn destroy(self) {
        drop(self)
    }
}

impl<M: Mprotect> Drop for Domain<M> {
    fn drop(&mut self) {
        let spaces = self.spaces.get_mut();
        spaces.non_class.teardown(&*self.ctx);
        if let Some(class) = spaces.class.as_mut() {
            class.teardown(&*self.ctx);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("[Domain]: destroyed {:?} domain", self.kind);
    }
}
