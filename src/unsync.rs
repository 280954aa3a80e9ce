//! Unsynchronized arena pool
//!
//! COMPLIANCE:
//! - O(1) allocate and deallocate, no search, no coalescing
//! - No heap traffic after construction
//! - Single-threaded: the type is `!Sync` by construction
//!
//! The engine bump-allocates *downward* inside one active arena; when the
//! active arena cannot hold a request, the next arena is popped off a LIFO
//! free list. An arena is recycled only once every allocation made from it
//! has been returned. Descending bumps make per-allocation alignment a
//! single mask.

use std::cell::Cell;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::slice;

use tracing::{debug, error};

use crate::error::{PoolError, PoolResult};
use crate::layout::{
    debug_invariant, ArenaGeometry, InlineBytes, CACHE_LINE_SIZE, MAX_SCALAR_ALIGN,
};
use crate::resource::{dangling_for, system_resource, MemoryResource, RawRegion};

/// Storage backing for the unsynchronized engine
///
/// # Safety
///
/// Implementors must guarantee:
/// - `base` points to `geometry().total_bytes()` writable bytes, aligned to
///   at least [`MAX_SCALAR_ALIGN`], stable for the lifetime of `self`;
/// - `live_counts` and `free_list` are slices of exactly
///   `geometry().num_arenas()` entries, stable for the lifetime of `self`.
pub unsafe trait UnsyncStorage {
    /// Pool geometry this storage was built for
    fn geometry(&self) -> ArenaGeometry;
    /// First byte of the arena region
    fn base(&self) -> *mut u8;
    /// Live-allocation count per arena
    fn live_counts(&self) -> &[Cell<u32>];
    /// Free-list slots (ids below the head are free arenas)
    fn free_list(&self) -> &[Cell<u32>];
}

/// Compile-time-sized storage embedded directly in the pool value
///
/// Geometry violations are compile errors.
pub struct FixedStorage<const N: usize, const S: usize> {
    live: [Cell<u32>; N],
    free: [Cell<u32>; N],
    bytes: InlineBytes<N, S>,
}

impl<const N: usize, const S: usize> FixedStorage<N, S> {
    fn new() -> Self {
        const {
            assert!(N > 0, "there must be at least one arena");
            assert!(
                S > 0 && S % MAX_SCALAR_ALIGN == 0,
                "arena size must be a nonzero multiple of the maximum scalar alignment"
            );
            assert!(N <= u32::MAX as usize && S <= u32::MAX as usize);
        }
        Self {
            live: std::array::from_fn(|_| Cell::new(0)),
            free: std::array::from_fn(|_| Cell::new(0)),
            bytes: InlineBytes::zeroed(),
        }
    }
}

// Safety: the byte array is exactly N*S bytes, aligned via InlineBytes, and
// lives inside the storage value; both slices are inline arrays of length N.
unsafe impl<const N: usize, const S: usize> UnsyncStorage for FixedStorage<N, S> {
    fn geometry(&self) -> ArenaGeometry {
        ArenaGeometry::new_unchecked(N as u32, S as u32)
    }

    fn base(&self) -> *mut u8 {
        self.bytes.base()
    }

    fn live_counts(&self) -> &[Cell<u32>] {
        &self.live
    }

    fn free_list(&self) -> &[Cell<u32>] {
        &self.free
    }
}

/// Runtime-sized storage drawn from an upstream resource
///
/// The upstream is touched exactly twice: once here at construction and
/// once when the storage drops. Counters and free list are drawn from the
/// same upstream as the arena bytes, so a caller-supplied arena upstream
/// yields a fully heap-free pool.
pub struct HeapStorage<'up> {
    geometry: ArenaGeometry,
    live: RawRegion<'up>,
    free: RawRegion<'up>,
    bytes: RawRegion<'up>,
}

impl<'up> HeapStorage<'up> {
    fn new(geometry: ArenaGeometry, upstream: &'up dyn MemoryResource) -> PoolResult<Self> {
        let counter_bytes = geometry.num_arenas() * size_of::<u32>();
        let live = RawRegion::zeroed(upstream, counter_bytes, align_of::<u32>())?;
        let free = RawRegion::zeroed(upstream, counter_bytes, align_of::<u32>())?;
        let bytes = RawRegion::zeroed(upstream, geometry.total_bytes(), CACHE_LINE_SIZE)?;
        Ok(Self {
            geometry,
            live,
            free,
            bytes,
        })
    }

    /// View a zero-initialized u32 region as a slice of cells
    ///
    /// Safety: the region holds `num_arenas` u32s, initialized at
    /// construction; `Cell<u32>` is layout-compatible with u32.
    fn counter_slice(&self, region: &RawRegion<'up>) -> &[Cell<u32>] {
        unsafe {
            slice::from_raw_parts(
                region.as_ptr().cast::<Cell<u32>>(),
                self.geometry.num_arenas(),
            )
        }
    }
}

// Safety: the byte region was allocated with geometry.total_bytes() bytes at
// cache-line alignment; the counter regions hold num_arenas u32s each. All
// regions are owned by the storage and freed only on drop.
unsafe impl UnsyncStorage for HeapStorage<'_> {
    fn geometry(&self) -> ArenaGeometry {
        self.geometry
    }

    fn base(&self) -> *mut u8 {
        self.bytes.as_ptr()
    }

    fn live_counts(&self) -> &[Cell<u32>] {
        self.counter_slice(&self.live)
    }

    fn free_list(&self) -> &[Cell<u32>] {
        self.counter_slice(&self.free)
    }
}

/// Unsynchronized bounded arena pool
///
/// Serves allocations from a fixed set of equally sized arenas with a
/// descending bump pointer. Returned pointers borrow the pool's storage:
/// every allocation must be handed back through [`deallocate`] before the
/// pool drops (and, for inline-storage pools, before the pool value moves).
///
/// Performance characteristics:
/// - Allocate: O(1), one mask for alignment, no search
/// - Deallocate: O(1), arena identity by integer division
/// - No locks, no atomics; the type is `!Sync`
///
/// [`deallocate`]: ArenaPool::deallocate
pub struct ArenaPool<St: UnsyncStorage> {
    storage: St,
    /// Offset from storage base of the lowest allocated byte in the active
    /// arena; allocation moves it downward.
    data_off: Cell<usize>,
    /// Free bytes remaining in the active arena, alignment included
    bytes_left: Cell<u32>,
    active_arena: Cell<u32>,
    /// Free-list slots below this index hold free arena ids
    free_list_head: Cell<u32>,
}

/// Unsynchronized pool with compile-time geometry and inline storage
pub type FixedArenaPool<const N: usize, const S: usize> = ArenaPool<FixedStorage<N, S>>;

/// Unsynchronized pool with construction-time geometry, storage drawn from
/// an upstream resource
pub type HeapArenaPool<'up> = ArenaPool<HeapStorage<'up>>;

impl<const N: usize, const S: usize> ArenaPool<FixedStorage<N, S>> {
    /// Create a pool with all storage embedded in the returned value
    pub fn new() -> Self {
        Self::from_storage(FixedStorage::new())
    }
}

impl<const N: usize, const S: usize> Default for ArenaPool<FixedStorage<N, S>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'up> ArenaPool<HeapStorage<'up>> {
    /// Create a pool whose storage comes from the host heap
    pub fn new(num_arenas: usize, arena_size: usize) -> PoolResult<Self> {
        Self::with_upstream(num_arenas, arena_size, system_resource())
    }

    /// Create a pool whose storage comes from the given upstream resource
    ///
    /// The upstream is used only here and when the pool drops, never on the
    /// allocation path.
    pub fn with_upstream(
        num_arenas: usize,
        arena_size: usize,
        upstream: &'up dyn MemoryResource,
    ) -> PoolResult<Self> {
        let geometry = ArenaGeometry::new(num_arenas, arena_size)?;
        let storage = HeapStorage::new(geometry, upstream)?;
        debug!(num_arenas, arena_size, "created heap-backed arena pool");
        Ok(Self::from_storage(storage))
    }
}

impl<St: UnsyncStorage> ArenaPool<St> {
    fn from_storage(storage: St) -> Self {
        let pool = Self {
            storage,
            data_off: Cell::new(0),
            bytes_left: Cell::new(0),
            active_arena: Cell::new(0),
            free_list_head: Cell::new(0),
        };
        pool.init_arenas();
        pool
    }

    fn init_arenas(&self) {
        let n = self.storage.geometry().num_arenas();
        let free = self.storage.free_list();
        let live = self.storage.live_counts();
        for i in 0..n {
            free[i].set((n - 1 - i) as u32);
            live[i].set(0);
        }
        self.free_list_head.set(n as u32);
        // At least one arena is active at all times
        let reserved = self.reserve_next_arena();
        debug_invariant!(reserved);
    }

    /// Pop the next free arena and make it active
    ///
    /// Returns false (and changes nothing) when the free list is empty.
    fn reserve_next_arena(&self) -> bool {
        let head = self.free_list_head.get();
        if head == 0 {
            return false;
        }
        let head = head - 1;
        self.free_list_head.set(head);
        let geometry = self.storage.geometry();
        let id = self.storage.free_list()[head as usize].get();
        self.active_arena.set(id);
        self.bytes_left.set(geometry.arena_size() as u32);
        // The bump descends: start one past the arena's last byte
        self.data_off.set(geometry.arena_end(id as usize));
        true
    }

    /// Re-arm the active arena in place, skipping a release/reserve cycle
    fn reset_active_arena(&self) {
        let geometry = self.storage.geometry();
        let id = self.active_arena.get() as usize;
        debug_invariant!(self.storage.live_counts()[id].get() == 0);
        self.bytes_left.set(geometry.arena_size() as u32);
        self.data_off.set(geometry.arena_end(id));
        self.storage.live_counts()[id].set(0);
    }

    /// Recycle a vacated arena onto the free list
    fn release_arena(&self, arena_id: u32) {
        let head = self.free_list_head.get();
        debug_invariant!((head as usize) < self.storage.geometry().num_arenas());
        debug_invariant!(arena_id != self.active_arena.get());
        self.storage.free_list()[head as usize].set(arena_id);
        self.free_list_head.set(head + 1);
        self.storage.live_counts()[arena_id as usize].set(0);
    }

    /// Bump-allocate, falling back to the next free arena at most once
    fn try_allocate(&self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        let geometry = self.storage.geometry();
        let base_addr = self.storage.base() as usize;
        let mut retried = false;
        loop {
            let data = base_addr + self.data_off.get();
            // Tentative placement, then pay whatever alignment costs on top
            let tentative = data.checked_sub(bytes)?;
            let align_offset = tentative & (align - 1);
            let needed = bytes.checked_add(align_offset)?;
            if needed <= self.bytes_left.get() as usize {
                let new_off = self.data_off.get() - needed;
                self.data_off.set(new_off);
                self.bytes_left.set(self.bytes_left.get() - needed as u32);
                let live = &self.storage.live_counts()[self.active_arena.get() as usize];
                live.set(live.get().wrapping_add(1));
                let ptr = unsafe { self.storage.base().add(new_off) };
                return NonNull::new(ptr);
            }
            // The next arena can only help if the request fits an arena at all
            if retried || bytes > geometry.arena_size() || !self.reserve_next_arena() {
                return None;
            }
            retried = true;
        }
    }

    /// Allocate `bytes` bytes aligned to `align`
    ///
    /// Zero bytes yields an aligned dangling sentinel. Failure leaves the
    /// pool untouched: [`PoolError::BlockTooLarge`] when a request can never
    /// fit a single arena, [`PoolError::PoolExhausted`] when no free arena
    /// is left.
    pub fn allocate(&self, bytes: usize, align: usize) -> PoolResult<NonNull<u8>> {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        if bytes == 0 {
            return Ok(dangling_for(align));
        }
        match self.try_allocate(bytes, align) {
            Some(ptr) => Ok(ptr),
            None => {
                let geometry = self.storage.geometry();
                if bytes > geometry.arena_size() {
                    Err(PoolError::BlockTooLarge {
                        needed: bytes,
                        available: geometry.arena_size(),
                    })
                } else {
                    Err(PoolError::PoolExhausted {
                        num_arenas: geometry.num_arenas(),
                    })
                }
            }
        }
    }

    /// Return an allocation to its arena
    ///
    /// The owning arena is derived from the pointer. An address outside the
    /// pool's storage raises [`PoolError::PoolCorrupted`]; that check is the
    /// pool's sole defense against double-free and foreign pointers.
    pub fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize) -> PoolResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        let geometry = self.storage.geometry();
        let addr = ptr.as_ptr() as usize;
        let offset = addr.wrapping_sub(self.storage.base() as usize);
        let arena_id = geometry.arena_id(offset);
        if arena_id >= geometry.num_arenas() {
            error!(addr, bytes, align, "deallocate outside pool storage");
            return Err(PoolError::PoolCorrupted { addr, bytes, align });
        }
        let live = &self.storage.live_counts()[arena_id];
        debug_invariant!(live.get() > 0);
        let remaining = live.get().wrapping_sub(1);
        live.set(remaining);
        if remaining == 0 {
            if arena_id == self.active_arena.get() as usize {
                // The active arena just emptied; reuse it in place
                self.reset_active_arena();
            } else {
                self.release_arena(arena_id as u32);
            }
        }
        Ok(())
    }

    /// Total live allocations across all arenas
    pub fn live_allocations(&self) -> usize {
        self.storage
            .live_counts()
            .iter()
            .map(|count| count.get() as usize)
            .sum()
    }

    /// Number of non-empty arenas
    pub fn busy_arenas(&self) -> usize {
        let geometry = self.storage.geometry();
        let mut busy = geometry.num_arenas() - self.free_list_head.get() as usize;
        // The active arena counts as busy even before its first allocation;
        // when it is the only non-free arena, check whether it is truly empty
        if busy == 1 && self.storage.live_counts()[self.active_arena.get() as usize].get() == 0 {
            busy = 0;
        }
        busy
    }

    /// Number of arenas in the pool
    pub fn num_arenas(&self) -> usize {
        self.storage.geometry().num_arenas()
    }

    /// Bytes per arena (the maximum size of a single allocation)
    pub fn arena_size(&self) -> usize {
        self.storage.geometry().arena_size()
    }
}

impl<St: UnsyncStorage> MemoryResource for ArenaPool<St> {
    fn allocate(&self, bytes: usize, align: usize) -> PoolResult<NonNull<u8>> {
        ArenaPool::allocate(self, bytes, align)
    }

    fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize) -> PoolResult<()> {
        ArenaPool::deallocate(self, ptr, bytes, align)
    }

    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        std::ptr::addr_eq(self as *const Self, other as *const dyn MemoryResource)
    }
}

#[cfg(feature = "debug-checks")]
impl<St: UnsyncStorage> Drop for ArenaPool<St> {
    fn drop(&mut self) {
        assert_eq!(
            self.live_allocations(),
            0,
            "arena pool dropped with live allocations"
        );
    }
}
