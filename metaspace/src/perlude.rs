pub use crate::block::{MIN_BLOCK_WORDS, MetaBlock};
pub use crate::chunk::{CHUNK_OVERHEAD, ChunkSizes, SizeClass};
pub use crate::config::{Config, MetadataType};
pub use crate::context::Metaspace;
pub use crate::domain::{Collector, Domain, DomainKind};
pub use crate::error::Error;
pub use crate::mem::{Access, Mmap, Mprotect};
pub use crate::os::DefaultBackend;
pub use crate::policy::Resize;
pub use crate::stats::{DomainStats, MetaspaceStats, SpaceCounters, SpaceStats, VirtualSpaceStats};

pub type MetaResult<T> = Result<T, Error>;
