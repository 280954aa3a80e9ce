//! Pool geometry
//!
//! COMPLIANCE:
//! - Geometry fixed for the lifetime of a pool
//! - Arena size always a multiple of the maximum scalar alignment
//! - Arena identity computed by integer division, no headers

use std::cell::UnsafeCell;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Maximum scalar alignment of the platform (`max_align_t` on common
/// 64-bit targets). Arena sizes must be a multiple of this so that every
/// arena boundary is itself maximally aligned.
pub const MAX_SCALAR_ALIGN: usize = 16;

/// Cache line size for false-sharing avoidance between pool bookkeeping
/// and arena data.
pub const CACHE_LINE_SIZE: usize = 64;

/// Whether internal invariant assertions are compiled in.
pub const DEBUG_CHECKS: bool = cfg!(feature = "debug-checks");

/// Assert an internal invariant when the `debug-checks` feature is enabled.
macro_rules! debug_invariant {
    ($($arg:tt)*) => {
        if cfg!(feature = "debug-checks") {
            assert!($($arg)*);
        }
    };
}
pub(crate) use debug_invariant;

/// Inline arena bytes for compile-time-sized pools, cache-line aligned so
/// pool bookkeeping cannot share a line with arena data.
#[repr(align(64))]
pub(crate) struct InlineBytes<const N: usize, const S: usize>(
    pub(crate) UnsafeCell<[[u8; S]; N]>,
);

impl<const N: usize, const S: usize> InlineBytes<N, S> {
    pub(crate) fn zeroed() -> Self {
        Self(UnsafeCell::new([[0u8; S]; N]))
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.0.get().cast::<u8>()
    }
}

/// Validated pool geometry: number of arenas and bytes per arena
///
/// Arena ids and intra-arena byte counts fit `u32`; a single arena (and
/// hence a single allocation) is capped at 4GB while the pool as a whole
/// may be much larger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaGeometry {
    num_arenas: u32,
    arena_size: u32,
}

impl ArenaGeometry {
    /// Validate and build a pool geometry
    ///
    /// Requires at least one arena and an arena size that is a nonzero
    /// multiple of [`MAX_SCALAR_ALIGN`].
    pub fn new(num_arenas: usize, arena_size: usize) -> PoolResult<Self> {
        let valid = num_arenas >= 1
            && arena_size >= MAX_SCALAR_ALIGN
            && arena_size % MAX_SCALAR_ALIGN == 0
            && u32::try_from(num_arenas).is_ok()
            && u32::try_from(arena_size).is_ok()
            && arena_size.checked_mul(num_arenas).is_some();
        if !valid {
            return Err(PoolError::InvalidGeometry {
                num_arenas,
                arena_size,
            });
        }
        Ok(Self {
            // Both conversions verified above
            num_arenas: num_arenas as u32,
            arena_size: arena_size as u32,
        })
    }

    /// Build a geometry whose validity the caller has already established
    /// (compile-time-checked fixed storage).
    pub(crate) const fn new_unchecked(num_arenas: u32, arena_size: u32) -> Self {
        Self {
            num_arenas,
            arena_size,
        }
    }

    /// Number of arenas in the pool
    #[inline]
    pub const fn num_arenas(&self) -> usize {
        self.num_arenas as usize
    }

    /// Bytes per arena
    #[inline]
    pub const fn arena_size(&self) -> usize {
        self.arena_size as usize
    }

    /// Total bytes of arena storage
    #[inline]
    pub const fn total_bytes(&self) -> usize {
        self.num_arenas as usize * self.arena_size as usize
    }

    /// Arena id owning the given byte offset into storage
    ///
    /// Offsets past the end of storage yield ids `>= num_arenas`; callers
    /// treat those as corruption.
    #[inline]
    pub const fn arena_id(&self, byte_offset: usize) -> usize {
        byte_offset / self.arena_size as usize
    }

    /// Byte offset of the first byte of the given arena
    #[inline]
    pub const fn arena_base(&self, arena_id: usize) -> usize {
        arena_id * self.arena_size as usize
    }

    /// Byte offset one past the last byte of the given arena
    #[inline]
    pub const fn arena_end(&self, arena_id: usize) -> usize {
        (arena_id + 1) * self.arena_size as usize
    }
}
