//! Synchronized arena pool
//!
//! COMPLIANCE:
//! - Free-threaded: any number of threads may allocate and deallocate
//! - Critical sections are O(1): an integer compare, a pointer bump and one
//!   relaxed atomic increment
//! - Deallocations that do not empty an arena never take the lock
//!
//! The engine bump-allocates *upward* inside the active arena, handing out
//! space in [`MAX_SCALAR_ALIGN`]-sized bins. Per-arena allocation and
//! deallocation counters are relaxed atomics; their equality is only a hint
//! that an arena may have emptied, and the authoritative re-check happens
//! under the pool mutex, which is also the total-order point for arena
//! recycling.

use std::cell::UnsafeCell;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{PoolError, PoolResult};
use crate::layout::{
    debug_invariant, ArenaGeometry, InlineBytes, CACHE_LINE_SIZE, MAX_SCALAR_ALIGN,
};
use crate::resource::{dangling_for, system_resource, MemoryResource, RawRegion};

/// Storage backing for the synchronized engine
///
/// # Safety
///
/// Implementors must guarantee:
/// - `base` points to `geometry().total_bytes()` writable bytes, aligned to
///   at least [`MAX_SCALAR_ALIGN`], stable for the lifetime of `self`;
/// - all three slices hold exactly `geometry().num_arenas()` entries and
///   are stable for the lifetime of `self`.
pub unsafe trait SyncStorage {
    /// Pool geometry this storage was built for
    fn geometry(&self) -> ArenaGeometry;
    /// First byte of the arena region
    fn base(&self) -> *mut u8;
    /// Allocations made in each arena since it was activated
    fn alloc_counts(&self) -> &[AtomicU32];
    /// Deallocations made in each arena since it was activated
    fn dealloc_counts(&self) -> &[AtomicU32];
    /// Free-list slots; only touched while the pool cursor is locked
    fn free_list(&self) -> &[UnsafeCell<u32>];
}

/// Compile-time-sized storage embedded directly in the pool value
pub struct FixedSyncStorage<const N: usize, const S: usize> {
    allocs: [AtomicU32; N],
    deallocs: [AtomicU32; N],
    free: [UnsafeCell<u32>; N],
    bytes: InlineBytes<N, S>,
}

impl<const N: usize, const S: usize> FixedSyncStorage<N, S> {
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
            allocs: std::array::from_fn(|_| AtomicU32::new(0)),
            deallocs: std::array::from_fn(|_| AtomicU32::new(0)),
            free: std::array::from_fn(|_| UnsafeCell::new(0)),
            bytes: InlineBytes::zeroed(),
        }
    }
}

// Safety: the byte array is exactly N*S bytes, aligned via InlineBytes, and
// lives inside the storage value; all three slices are inline arrays of
// length N.
unsafe impl<const N: usize, const S: usize> SyncStorage for FixedSyncStorage<N, S> {
    fn geometry(&self) -> ArenaGeometry {
        ArenaGeometry::new_unchecked(N as u32, S as u32)
    }

    fn base(&self) -> *mut u8 {
        self.bytes.base()
    }

    fn alloc_counts(&self) -> &[AtomicU32] {
        &self.allocs
    }

    fn dealloc_counts(&self) -> &[AtomicU32] {
        &self.deallocs
    }

    fn free_list(&self) -> &[UnsafeCell<u32>] {
        &self.free
    }
}

/// Runtime-sized storage drawn from an upstream resource
///
/// The upstream must be `Sync` because the pool built over this storage is
/// shared across threads and may drop on any of them.
pub struct HeapSyncStorage<'up> {
    geometry: ArenaGeometry,
    allocs: RawRegion<'up>,
    deallocs: RawRegion<'up>,
    free: RawRegion<'up>,
    bytes: RawRegion<'up>,
}

impl<'up> HeapSyncStorage<'up> {
    fn new(
        geometry: ArenaGeometry,
        upstream: &'up (dyn MemoryResource + Sync),
    ) -> PoolResult<Self> {
        let counter_bytes = geometry.num_arenas() * size_of::<u32>();
        let allocs = RawRegion::zeroed(upstream, counter_bytes, align_of::<u32>())?;
        let deallocs = RawRegion::zeroed(upstream, counter_bytes, align_of::<u32>())?;
        let free = RawRegion::zeroed(upstream, counter_bytes, align_of::<u32>())?;
        let bytes = RawRegion::zeroed(upstream, geometry.total_bytes(), CACHE_LINE_SIZE)?;
        Ok(Self {
            geometry,
            allocs,
            deallocs,
            free,
            bytes,
        })
    }

    /// View a zero-initialized u32 region as atomics
    ///
    /// Safety: the region holds `num_arenas` u32s, initialized at
    /// construction; `AtomicU32` is layout-compatible with u32.
    fn atomic_slice(&self, region: &RawRegion<'up>) -> &[AtomicU32] {
        unsafe {
            slice::from_raw_parts(
                region.as_ptr().cast::<AtomicU32>(),
                self.geometry.num_arenas(),
            )
        }
    }
}

// Safety: the constructor requires a Sync upstream, so the regions (and the
// upstream reference inside them) may move to and drop on another thread.
unsafe impl Send for HeapSyncStorage<'_> {}

// Safety: the byte region was allocated with geometry.total_bytes() bytes at
// cache-line alignment; the counter regions hold num_arenas u32s each.
unsafe impl SyncStorage for HeapSyncStorage<'_> {
    fn geometry(&self) -> ArenaGeometry {
        self.geometry
    }

    fn base(&self) -> *mut u8 {
        self.bytes.as_ptr()
    }

    fn alloc_counts(&self) -> &[AtomicU32] {
        self.atomic_slice(&self.allocs)
    }

    fn dealloc_counts(&self) -> &[AtomicU32] {
        self.atomic_slice(&self.deallocs)
    }

    fn free_list(&self) -> &[UnsafeCell<u32>] {
        // Safety: same layout argument as atomic_slice; the slots are only
        // dereferenced while the pool cursor is locked
        unsafe {
            slice::from_raw_parts(
                self.free.as_ptr().cast::<UnsafeCell<u32>>(),
                self.geometry.num_arenas(),
            )
        }
    }
}

/// Bump cursor over the active arena; every field is guarded by the pool
/// mutex.
struct Cursor {
    /// Offset from storage base of the next free byte in the active arena
    data_off: usize,
    /// Bytes reserved so far in the active arena
    bytes_reserved: u32,
    active_arena: u32,
    /// Free-list slots below this index hold free arena ids
    free_list_head: u32,
}

/// Synchronized bounded arena pool
///
/// Thread-safe counterpart of [`ArenaPool`](crate::ArenaPool). Allocations
/// are always aligned to [`MAX_SCALAR_ALIGN`] and the caller's requested
/// alignment is ignored; this keeps the critical section branch-free.
/// Returned pointers borrow the pool's storage and must all be handed back
/// through [`deallocate`](Self::deallocate) before the pool drops.
///
/// Performance characteristics:
/// - Allocate: O(1) under a short mutex hold
/// - Deallocate: lock-free unless the arena may have emptied
/// - Per-arena counters are relaxed atomics
pub struct SyncArenaPool<St: SyncStorage> {
    storage: St,
    cursor: Mutex<Cursor>,
}

/// Synchronized pool with compile-time geometry and inline storage
pub type FixedSyncArenaPool<const N: usize, const S: usize> =
    SyncArenaPool<FixedSyncStorage<N, S>>;

/// Synchronized pool with construction-time geometry, storage drawn from an
/// upstream resource
pub type HeapSyncArenaPool<'up> = SyncArenaPool<HeapSyncStorage<'up>>;

// Safety: the bump cursor and the free list are only mutated while `cursor`
// is locked; per-arena counters are atomics; the storage flavors guarantee
// their regions may cross threads (FixedSyncStorage by value, HeapSyncStorage
// through its Sync upstream).
unsafe impl<St: SyncStorage + Send> Send for SyncArenaPool<St> {}
unsafe impl<St: SyncStorage + Send> Sync for SyncArenaPool<St> {}

impl<const N: usize, const S: usize> SyncArenaPool<FixedSyncStorage<N, S>> {
    /// Create a pool with all storage embedded in the returned value
    pub fn new() -> Self {
        Self::from_storage(FixedSyncStorage::new())
    }
}

impl<const N: usize, const S: usize> Default for SyncArenaPool<FixedSyncStorage<N, S>> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'up> SyncArenaPool<HeapSyncStorage<'up>> {
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
        upstream: &'up (dyn MemoryResource + Sync),
    ) -> PoolResult<Self> {
        let geometry = ArenaGeometry::new(num_arenas, arena_size)?;
        let storage = HeapSyncStorage::new(geometry, upstream)?;
        debug!(num_arenas, arena_size, "created heap-backed sync arena pool");
        Ok(Self::from_storage(storage))
    }
}

impl<St: SyncStorage> SyncArenaPool<St> {
    fn from_storage(storage: St) -> Self {
        let pool = Self {
            storage,
            cursor: Mutex::new(Cursor {
                data_off: 0,
                bytes_reserved: 0,
                active_arena: 0,
                free_list_head: 0,
            }),
        };
        pool.init_arenas();
        pool
    }

    fn init_arenas(&self) {
        let mut cursor = self.cursor.lock();
        let n = self.storage.geometry().num_arenas();
        for i in 0..n {
            // Safety: the cursor mutex is held
            unsafe { *self.storage.free_list()[i].get() = (n - 1 - i) as u32 };
            self.storage.alloc_counts()[i].store(0, Ordering::Relaxed);
            self.storage.dealloc_counts()[i].store(0, Ordering::Relaxed);
        }
        cursor.free_list_head = n as u32;
        // At least one arena is active at all times
        let reserved = Self::reserve_next_arena(&self.storage, &mut cursor);
        debug_invariant!(reserved);
    }

    /// Pop the next free arena and make it active
    ///
    /// Returns false (and changes nothing) when the free list is empty.
    /// The cursor borrow proves the pool mutex is held.
    fn reserve_next_arena(storage: &St, cursor: &mut Cursor) -> bool {
        if cursor.free_list_head == 0 {
            return false;
        }
        cursor.free_list_head -= 1;
        // Safety: the cursor mutex is held
        let id = unsafe { *storage.free_list()[cursor.free_list_head as usize].get() };
        cursor.active_arena = id;
        // The bump ascends from the arena's first byte
        cursor.data_off = storage.geometry().arena_base(id as usize);
        cursor.bytes_reserved = 0;
        true
    }

    /// Re-arm the active arena in place, skipping a release/reserve cycle
    fn reset_active_arena(storage: &St, cursor: &mut Cursor) {
        let id = cursor.active_arena as usize;
        cursor.data_off = storage.geometry().arena_base(id);
        cursor.bytes_reserved = 0;
        storage.alloc_counts()[id].store(0, Ordering::Relaxed);
        storage.dealloc_counts()[id].store(0, Ordering::Relaxed);
    }

    /// Recycle a vacated arena onto the free list
    fn release_arena(storage: &St, cursor: &mut Cursor, arena_id: u32) {
        debug_invariant!((cursor.free_list_head as usize) < storage.geometry().num_arenas());
        debug_invariant!(arena_id != cursor.active_arena);
        // Safety: the cursor mutex is held
        unsafe { *storage.free_list()[cursor.free_list_head as usize].get() = arena_id };
        cursor.free_list_head += 1;
        storage.alloc_counts()[arena_id as usize].store(0, Ordering::Relaxed);
        storage.dealloc_counts()[arena_id as usize].store(0, Ordering::Relaxed);
    }

    /// Allocate `bytes` bytes aligned to [`MAX_SCALAR_ALIGN`]
    ///
    /// The requested alignment is deliberately ignored (see type docs).
    /// Zero bytes yields an aligned dangling sentinel. Failure leaves the
    /// pool untouched.
    pub fn allocate(&self, bytes: usize, _align: usize) -> PoolResult<NonNull<u8>> {
        if bytes == 0 {
            return Ok(dangling_for(MAX_SCALAR_ALIGN));
        }
        let geometry = self.storage.geometry();
        // Arena space is handed out in MAX_SCALAR_ALIGN-sized bins
        let rounded = match bytes.checked_add(MAX_SCALAR_ALIGN - 1) {
            Some(up) => up & !(MAX_SCALAR_ALIGN - 1),
            None => {
                return Err(PoolError::BlockTooLarge {
                    needed: bytes,
                    available: geometry.arena_size(),
                })
            }
        };
        if rounded > geometry.arena_size() {
            return Err(PoolError::BlockTooLarge {
                needed: bytes,
                available: geometry.arena_size(),
            });
        }

        let mut cursor = self.cursor.lock();
        loop {
            if cursor.bytes_reserved as usize + rounded <= geometry.arena_size() {
                let offset = cursor.data_off;
                cursor.data_off += rounded;
                cursor.bytes_reserved += rounded as u32;
                self.storage.alloc_counts()[cursor.active_arena as usize]
                    .fetch_add(1, Ordering::Relaxed);
                // Base is non-null and the offset stays inside storage
                let ptr = unsafe { self.storage.base().add(offset) };
                return Ok(unsafe { NonNull::new_unchecked(ptr) });
            }
            // A fresh arena always fits the rounded request
            if !Self::reserve_next_arena(&self.storage, &mut cursor) {
                return Err(PoolError::PoolExhausted {
                    num_arenas: geometry.num_arenas(),
                });
            }
        }
    }

    /// Return an allocation to its arena
    ///
    /// Lock-free unless the owning arena may have emptied: the relaxed
    /// counter equality is only a hint, and the decision to recycle is
    /// re-validated under the pool mutex.
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

        let deallocs = self.storage.dealloc_counts()[arena_id].fetch_add(1, Ordering::Relaxed) + 1;
        let allocs = self.storage.alloc_counts()[arena_id].load(Ordering::Relaxed);
        if allocs == deallocs {
            let mut cursor = self.cursor.lock();
            // Re-read both counters: only the view under the lock decides
            let allocs_now = self.storage.alloc_counts()[arena_id].load(Ordering::Relaxed);
            let deallocs_now = self.storage.dealloc_counts()[arena_id].load(Ordering::Relaxed);
            debug_invariant!(allocs_now >= deallocs_now);
            if allocs == allocs_now && allocs == deallocs_now {
                if arena_id == cursor.active_arena as usize {
                    Self::reset_active_arena(&self.storage, &mut cursor);
                } else {
                    Self::release_arena(&self.storage, &mut cursor, arena_id as u32);
                }
            }
        }
        Ok(())
    }

    /// Total live allocations across all arenas
    pub fn live_allocations(&self) -> usize {
        let _cursor = self.cursor.lock();
        self.storage
            .alloc_counts()
            .iter()
            .zip(self.storage.dealloc_counts())
            .map(|(a, d)| {
                a.load(Ordering::Relaxed)
                    .wrapping_sub(d.load(Ordering::Relaxed)) as usize
            })
            .sum()
    }

    /// Number of non-empty arenas
    pub fn busy_arenas(&self) -> usize {
        let cursor = self.cursor.lock();
        let geometry = self.storage.geometry();
        let mut busy = geometry.num_arenas() - cursor.free_list_head as usize;
        // The active arena counts as busy even before its first allocation;
        // when it is the only non-free arena, check whether it is truly empty
        let active = cursor.active_arena as usize;
        if busy == 1
            && self.storage.alloc_counts()[active].load(Ordering::Relaxed)
                == self.storage.dealloc_counts()[active].load(Ordering::Relaxed)
        {
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

impl<St: SyncStorage> MemoryResource for SyncArenaPool<St> {
    fn allocate(&self, bytes: usize, align: usize) -> PoolResult<NonNull<u8>> {
        SyncArenaPool::allocate(self, bytes, align)
    }

    fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize) -> PoolResult<()> {
        SyncArenaPool::deallocate(self, ptr, bytes, align)
    }

    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        std::ptr::addr_eq(self as *const Self, other as *const dyn MemoryResource)
    }
}

#[cfg(feature = "debug-checks")]
impl<St: SyncStorage> Drop for SyncArenaPool<St> {
    fn drop(&mut self) {
        assert_eq!(
            self.live_allocations(),
            0,
            "sync arena pool dropped with live allocations"
        );
    }
}
