//! Error surface of the collector.

use thiserror::Error;

/// Result alias for collector operations.
pub type GcResult<T> = Result<T, GcError>;

/// Errors surfaced by allocation entry points. There is no internal
/// recovery beyond the single collect-and-retry; whatever remains is
/// reported here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GcError {
    /// The system allocator failed even after a collection, or the
    /// allocation metadata could not be recorded.
    #[error("out of memory: {size} byte region could not be allocated")]
    OutOfMemory {
        /// Requested region size in bytes.
        size: usize,
    },

    /// Reallocation of an address this collector does not manage.
    #[error("invalid argument: {addr:#x} is not a managed address")]
    InvalidArgument {
        /// The offending address.
        addr: usize,
    },
}
