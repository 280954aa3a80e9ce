//! Bounded arena pool allocators
//!
//! Constant-time memory resources for latency-sensitive services:
//! - Serve allocations from a fixed set of equally sized arenas
//! - O(1) allocate and deallocate, no search, no coalescing, no
//!   fragmentation inside an arena
//! - Recycle an arena only once every allocation made from it is returned
//! - Distinguish "object too big" from "pool exhausted" without mutating
//!   pool state, so callers can recover
//!
//! Four engine variants sit along two axes: synchronized vs
//! unsynchronized, and storage compiled in ([`FixedArenaPool`],
//! [`FixedSyncArenaPool`]) vs drawn from an upstream resource
//! ([`HeapArenaPool`], [`HeapSyncArenaPool`]). A fifth,
//! [`StatsArenaPool`], tracks live allocations for capacity planning.
//! Everything speaks [`MemoryResource`], so pools stack: a pool's storage
//! can come from another pool.
//!
//! ```
//! use arena_pool::FixedArenaPool;
//!
//! let pool = FixedArenaPool::<16, 1024>::new();
//! let block = pool.allocate(128, 16)?;
//! pool.deallocate(block, 128, 16)?;
//! assert_eq!(pool.live_allocations(), 0);
//! # Ok::<(), arena_pool::PoolError>(())
//! ```
//!
//! Returned pointers are non-owning borrows of pool storage: hand every
//! allocation back before the pool drops.

pub mod error;
pub mod layout;
pub mod resource;
pub mod stats;
pub mod sync;
pub mod unsync;

pub use error::{PoolError, PoolResult};
pub use layout::{ArenaGeometry, CACHE_LINE_SIZE, DEBUG_CHECKS, MAX_SCALAR_ALIGN};
pub use resource::{system_resource, MemoryResource, SystemResource};
pub use stats::{StatsArenaPool, StatsSummary};
pub use sync::{FixedSyncArenaPool, HeapSyncArenaPool, SyncArenaPool};
pub use unsync::{ArenaPool, FixedArenaPool, HeapArenaPool};
