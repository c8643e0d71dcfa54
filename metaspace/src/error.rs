use crate::config::MetadataType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No tier could satisfy the request, or the capacity policy refused to
    /// commit more memory for it.
    OutOfMemory {
        mdtype: MetadataType,
        /// The requested size in words.
        requested: usize,
    },
    InvalidConfig {
        reason: &'static str,
    },
    /// The initial address space reservation failed.
    Reserve {
        mdtype: MetadataType,
        /// The requested reservation in bytes.
        requested: usize,
    },
}

impl core::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory { mdtype, requested } => write!(
                f,
                "{} exhausted: failed to allocate {} words",
                mdtype, requested
            ),
            Self::InvalidConfig { reason } => write!(f, "Invalid configuration: {}", reason),
            Self::Reserve { mdtype, requested } => write!(
                f,
                "{}: failed to reserve {} bytes of address space",
                mdtype, requested
            ),
        }
    }
}
