//! Arena Pool Error Types
//!
//! Specific error types for production-grade error handling

use thiserror::Error;

/// Arena pool errors
///
/// `BlockTooLarge` and `PoolExhausted` are recoverable: the failing
/// operation leaves the pool untouched, so the caller may free objects and
/// retry or fall back to another resource. `PoolCorrupted` always indicates
/// a consumer bug; pool behaviour afterwards is unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// A single request exceeds the arena size
    #[error("allocation of {needed} bytes exceeds arena size {available}")]
    BlockTooLarge {
        /// How large an arena would have to be to satisfy the request
        needed: usize,
        /// Bytes actually available in a single arena
        available: usize,
    },

    /// No free arena left for a request that would otherwise fit
    #[error("all {num_arenas} arenas are in use")]
    PoolExhausted {
        /// Total number of arenas in the pool, none of which are free
        num_arenas: usize,
    },

    /// Double-free or foreign pointer handed to deallocate
    #[error("double-free or foreign pointer in arena pool: addr={addr:#x}, bytes={bytes}, align={align}")]
    PoolCorrupted {
        /// Address passed to deallocate
        addr: usize,
        /// Byte count passed to deallocate
        bytes: usize,
        /// Alignment passed to deallocate
        align: usize,
    },

    /// Pool geometry rejected at construction
    #[error("invalid pool geometry: {num_arenas} arenas of {arena_size} bytes")]
    InvalidGeometry {
        /// Requested number of arenas
        num_arenas: usize,
        /// Requested arena size in bytes
        arena_size: usize,
    },
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;
