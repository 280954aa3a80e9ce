//! Statistics arena pool
//!
//! Capacity-planning overlay for the unsynchronized engine: every live
//! allocation is mirrored in an address-keyed map, and histogram /
//! percentile / mean / standard-deviation queries over the *currently live*
//! block sizes answer "how big should my arenas be, and how many do I
//! need". High-water marks record the worst case seen since construction.
//!
//! The tracking map draws its storage from a second upstream resource,
//! distinct from the one backing the arenas, so both may themselves be
//! arena pools and the whole configuration stays off the heap.

use std::collections::BTreeMap;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::slice;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;

use crate::error::{PoolError, PoolResult};
use crate::resource::{system_resource, MemoryResource, RawRegion};
use crate::unsync::HeapArenaPool;

/// One live allocation
#[derive(Debug, Clone, Copy)]
struct Entry {
    addr: usize,
    bytes: usize,
}

/// Address-sorted map from live allocation to its byte count
///
/// A flat sorted array with binary search: std's maps cannot draw their
/// nodes from a caller-supplied resource, and the map growing through its
/// own upstream is the point of this type. Grows by doubling
/// (allocate-copy-release through the upstream).
struct AddressMap<'up> {
    slots: Option<RawRegion<'up>>,
    len: usize,
    cap: usize,
    upstream: &'up dyn MemoryResource,
}

impl<'up> AddressMap<'up> {
    const INITIAL_CAP: usize = 64;

    fn new(upstream: &'up dyn MemoryResource) -> Self {
        Self {
            slots: None,
            len: 0,
            cap: 0,
            upstream,
        }
    }

    fn base(&self) -> *mut Entry {
        match &self.slots {
            Some(region) => region.as_ptr().cast::<Entry>(),
            // Valid for zero-length reads and copies only
            None => NonNull::dangling().as_ptr(),
        }
    }

    fn entries(&self) -> &[Entry] {
        // Safety: the first `len` slots are always initialized
        unsafe { slice::from_raw_parts(self.base(), self.len) }
    }

    fn len(&self) -> usize {
        self.len
    }

    /// Index of `addr`, or the insertion point keeping the array sorted
    fn search(&self, addr: usize) -> Result<usize, usize> {
        self.entries().binary_search_by(|entry| entry.addr.cmp(&addr))
    }

    fn grow(&mut self) -> PoolResult<()> {
        let new_cap = if self.cap == 0 {
            Self::INITIAL_CAP
        } else {
            self.cap * 2
        };
        let region =
            RawRegion::zeroed(self.upstream, new_cap * size_of::<Entry>(), align_of::<Entry>())?;
        // Safety: both regions hold at least `len` entries
        unsafe {
            ptr::copy_nonoverlapping(self.base(), region.as_ptr().cast::<Entry>(), self.len);
        }
        // The old region (if any) drops here and returns to the upstream
        self.slots = Some(region);
        self.cap = new_cap;
        Ok(())
    }

    fn insert(&mut self, addr: usize, bytes: usize) -> PoolResult<()> {
        let pos = match self.search(addr) {
            Ok(found) => {
                // Safety: `found` is in-bounds
                unsafe { (*self.base().add(found)).bytes = bytes };
                return Ok(());
            }
            Err(insertion) => insertion,
        };
        if self.len == self.cap {
            self.grow()?;
        }
        // Safety: capacity leaves room for one more entry past `len`
        unsafe {
            let base = self.base();
            ptr::copy(base.add(pos), base.add(pos + 1), self.len - pos);
            ptr::write(base.add(pos), Entry { addr, bytes });
        }
        self.len += 1;
        Ok(())
    }

    /// Remove `addr`, returning its byte count if it was live
    fn remove(&mut self, addr: usize) -> Option<usize> {
        let pos = self.search(addr).ok()?;
        let bytes = self.entries()[pos].bytes;
        // Safety: `pos` is in-bounds, the tail shifts down by one
        unsafe {
            let base = self.base();
            ptr::copy(base.add(pos + 1), base.add(pos), self.len - pos - 1);
        }
        self.len -= 1;
        Some(bytes)
    }
}

fn histogram_of(entries: &[Entry]) -> BTreeMap<usize, usize> {
    let mut histogram = BTreeMap::new();
    for entry in entries {
        *histogram.entry(entry.bytes).or_insert(0usize) += 1;
    }
    histogram
}

/// Weighted mean and standard deviation of a block-size histogram
fn spread_of(histogram: &BTreeMap<usize, usize>) -> (f64, f64) {
    let total: usize = histogram.values().sum();
    if total == 0 {
        return (0.0, 0.0);
    }
    let inv_total = 1.0 / total as f64;
    let mean: f64 = histogram
        .iter()
        .map(|(&size, &count)| size as f64 * (count as f64 * inv_total))
        .sum();
    let variance: f64 = histogram
        .iter()
        .map(|(&size, &count)| {
            let diff = size as f64 - mean;
            diff * diff * (count as f64 * inv_total)
        })
        .sum();
    (mean, variance.sqrt())
}

struct StatsInner<'up> {
    pool: HeapArenaPool<'up>,
    map: AddressMap<'up>,
    max_busy_arenas: usize,
    max_live_allocations: usize,
}

/// One-shot capacity-planning snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSummary {
    /// Live allocations at snapshot time
    pub live_allocations: usize,
    /// Non-empty arenas at snapshot time
    pub busy_arenas: usize,
    /// Sum of all live block sizes in bytes
    pub bytes_allocated: usize,
    /// Weighted mean live block size in bytes
    pub mean_block_size: f64,
    /// Standard deviation of live block sizes in bytes
    pub std_dev_block_size: f64,
    /// All-time peak of concurrently busy arenas
    pub max_busy_arenas: usize,
    /// All-time peak of concurrently live allocations
    pub max_live_allocations: usize,
}

/// Arena pool with per-allocation tracking and statistical queries
///
/// Wraps a heap-backed unsynchronized pool and mirrors every live
/// allocation in an internal map keyed by address, which also turns
/// double-frees and foreign pointers into hard [`PoolError::PoolCorrupted`]
/// errors instead of silent corruption. The pool is thread-safe: one
/// internal mutex self-serializes every operation (the wrapped engine would
/// not require that on its own), so the map is never read mid-update.
///
/// Use this variant to size a production pool: run a representative
/// workload, then read [`max_busy_arenas`](Self::max_busy_arenas),
/// [`percentile`](Self::percentile) and friends.
pub struct StatsArenaPool<'up> {
    inner: Mutex<StatsInner<'up>>,
}

// Safety: the wrapped pool, the map and the high-water marks are only
// reachable through `inner`; both upstream constructors require Sync
// resources, so the references held by the pool storage and the map may
// cross threads.
unsafe impl Send for StatsArenaPool<'_> {}
unsafe impl Sync for StatsArenaPool<'_> {}

impl<'up> StatsArenaPool<'up> {
    /// Create a pool with both arena storage and map storage on the host
    /// heap
    pub fn new(num_arenas: usize, arena_size: usize) -> PoolResult<Self> {
        Self::with_upstreams(
            num_arenas,
            arena_size,
            system_resource(),
            system_resource(),
        )
    }

    /// Create a pool with explicit upstreams: one for arena storage, one
    /// for the tracking map
    ///
    /// The two may be distinct arena pools, leaving the host heap untouched
    /// after construction. Both must be `Sync` because the pool is shared
    /// across threads and may drop on any of them.
    pub fn with_upstreams(
        num_arenas: usize,
        arena_size: usize,
        arena_upstream: &'up (dyn MemoryResource + Sync),
        map_upstream: &'up (dyn MemoryResource + Sync),
    ) -> PoolResult<Self> {
        let pool = HeapArenaPool::with_upstream(num_arenas, arena_size, arena_upstream)?;
        Ok(Self {
            inner: Mutex::new(StatsInner {
                pool,
                map: AddressMap::new(map_upstream),
                max_busy_arenas: 0,
                max_live_allocations: 0,
            }),
        })
    }

    /// Allocate `bytes` bytes aligned to `align`, recording the block
    ///
    /// If mirroring the block in the map fails (map upstream exhausted),
    /// the allocation is rolled back and the map error returned, so the
    /// map and the engine never disagree.
    pub fn allocate(&self, bytes: usize, align: usize) -> PoolResult<NonNull<u8>> {
        let mut inner = self.inner.lock();
        let ptr = inner.pool.allocate(bytes, align)?;
        if bytes > 0 {
            if let Err(err) = inner.map.insert(ptr.as_ptr() as usize, bytes) {
                let _ = inner.pool.deallocate(ptr, bytes, align);
                return Err(err);
            }
            let busy = inner.pool.busy_arenas();
            let live = inner.map.len();
            inner.max_busy_arenas = inner.max_busy_arenas.max(busy);
            inner.max_live_allocations = inner.max_live_allocations.max(live);
        }
        Ok(ptr)
    }

    /// Return an allocation, erasing it from the map
    ///
    /// An address with no live allocation raises
    /// [`PoolError::PoolCorrupted`] before the engine is touched.
    pub fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize) -> PoolResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let addr = ptr.as_ptr() as usize;
        if inner.map.remove(addr).is_none() {
            error!(addr, bytes, align, "deallocate of an address with no live allocation");
            return Err(PoolError::PoolCorrupted { addr, bytes, align });
        }
        inner.pool.deallocate(ptr, bytes, align)
    }

    /// Total live allocations
    pub fn live_allocations(&self) -> usize {
        self.inner.lock().pool.live_allocations()
    }

    /// Number of non-empty arenas
    pub fn busy_arenas(&self) -> usize {
        self.inner.lock().pool.busy_arenas()
    }

    /// Number of arenas in the pool
    pub fn num_arenas(&self) -> usize {
        self.inner.lock().pool.num_arenas()
    }

    /// Bytes per arena
    pub fn arena_size(&self) -> usize {
        self.inner.lock().pool.arena_size()
    }

    /// Snapshot of the live (address, bytes) pairs, ascending by address
    pub fn address_to_size_map(&self) -> Vec<(usize, usize)> {
        self.inner
            .lock()
            .map
            .entries()
            .iter()
            .map(|entry| (entry.addr, entry.bytes))
            .collect()
    }

    /// Sum of all live block sizes in bytes
    pub fn bytes_allocated(&self) -> usize {
        self.inner
            .lock()
            .map
            .entries()
            .iter()
            .map(|entry| entry.bytes)
            .sum()
    }

    /// Histogram of live block sizes: size in bytes → number of live blocks
    pub fn histogram(&self) -> BTreeMap<usize, usize> {
        histogram_of(self.inner.lock().map.entries())
    }

    /// Largest block size within the given fraction of live allocations
    ///
    /// Walks the histogram in ascending size order accumulating counts
    /// until the running total reaches `p` of all live allocations, and
    /// returns the size of the last entry included. `percentile(0.5)` is
    /// the median live block size; `percentile(1.0)` the largest. Returns 0
    /// when nothing is live or `p` rounds the cutoff down to zero blocks.
    pub fn percentile(&self, p: f64) -> usize {
        let histogram = self.histogram();
        let total: usize = histogram.values().sum();
        let upper = (p.clamp(0.0, 1.0) * total as f64) as usize;
        if upper == 0 {
            return 0;
        }
        let mut accumulated = 0;
        let mut last_included = 0;
        for (&size, &count) in &histogram {
            accumulated += count;
            last_included = size;
            if accumulated >= upper {
                break;
            }
        }
        last_included
    }

    /// Weighted mean of live block sizes in bytes (0 if nothing is live)
    pub fn mean(&self) -> f64 {
        spread_of(&self.histogram()).0
    }

    /// Standard deviation of live block sizes in bytes (0 if nothing is
    /// live)
    pub fn std_dev(&self) -> f64 {
        spread_of(&self.histogram()).1
    }

    /// All-time peak of concurrently busy arenas
    pub fn max_busy_arenas(&self) -> usize {
        self.inner.lock().max_busy_arenas
    }

    /// All-time peak of concurrently live allocations
    pub fn max_live_allocations(&self) -> usize {
        self.inner.lock().max_live_allocations
    }

    /// Capacity-planning snapshot taken under a single lock hold
    pub fn summary(&self) -> StatsSummary {
        let inner = self.inner.lock();
        let histogram = histogram_of(inner.map.entries());
        let (mean, std_dev) = spread_of(&histogram);
        StatsSummary {
            live_allocations: inner.pool.live_allocations(),
            busy_arenas: inner.pool.busy_arenas(),
            bytes_allocated: inner.map.entries().iter().map(|e| e.bytes).sum(),
            mean_block_size: mean,
            std_dev_block_size: std_dev,
            max_busy_arenas: inner.max_busy_arenas,
            max_live_allocations: inner.max_live_allocations,
        }
    }
}

impl MemoryResource for StatsArenaPool<'_> {
    fn allocate(&self, bytes: usize, align: usize) -> PoolResult<NonNull<u8>> {
        StatsArenaPool::allocate(self, bytes, align)
    }

    fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize) -> PoolResult<()> {
        StatsArenaPool::deallocate(self, ptr, bytes, align)
    }

    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        std::ptr::addr_eq(self as *const Self, other as *const dyn MemoryResource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::FixedSyncArenaPool;

    #[test]
    fn test_stats_tracks_live_allocations() {
        let pool = StatsArenaPool::new(8, 256).unwrap();
        let a = pool.allocate(32, 8).unwrap();
        let b = pool.allocate(64, 8).unwrap();

        assert_eq!(pool.live_allocations(), 2);
        assert_eq!(pool.bytes_allocated(), 96);

        let map = pool.address_to_size_map();
        assert_eq!(map.len(), 2);
        assert!(map.windows(2).all(|w| w[0].0 < w[1].0), "sorted by address");

        pool.deallocate(a, 32, 8).unwrap();
        pool.deallocate(b, 64, 8).unwrap();
        assert_eq!(pool.live_allocations(), 0);
        assert_eq!(pool.bytes_allocated(), 0);
    }

    #[test]
    fn test_stats_detects_double_free() {
        let pool = StatsArenaPool::new(8, 256).unwrap();
        let p = pool.allocate(32, 8).unwrap();
        pool.deallocate(p, 32, 8).unwrap();

        let err = pool.deallocate(p, 32, 8).unwrap_err();
        assert!(matches!(err, PoolError::PoolCorrupted { .. }));
    }

    #[test]
    fn test_stats_histogram_and_percentiles() {
        let pool = StatsArenaPool::new(16, 256).unwrap();
        let mut held = Vec::new();
        for bytes in [16usize, 16, 32, 64, 64, 64, 128] {
            held.push((pool.allocate(bytes, 8).unwrap(), bytes));
        }

        let histogram = pool.histogram();
        assert_eq!(histogram.len(), 4);
        assert_eq!(histogram[&16], 2);
        assert_eq!(histogram[&64], 3);

        assert_eq!(pool.percentile(0.0), 0);
        assert_eq!(pool.percentile(1.0), 128);
        // 7 live blocks, cutoff truncates to 3: two 16s then the 32
        assert_eq!(pool.percentile(0.5), 32);
        assert!(pool.percentile(0.5) <= pool.percentile(1.0));

        for (ptr, bytes) in held {
            pool.deallocate(ptr, bytes, 8).unwrap();
        }
        assert_eq!(pool.percentile(1.0), 0);
    }

    #[test]
    fn test_stats_mean_and_std_dev() {
        let pool = StatsArenaPool::new(8, 256).unwrap();
        assert_eq!(pool.mean(), 0.0);
        assert_eq!(pool.std_dev(), 0.0);

        let a = pool.allocate(16, 8).unwrap();
        let b = pool.allocate(48, 8).unwrap();
        assert!((pool.mean() - 32.0).abs() < 1e-9);
        assert!((pool.std_dev() - 16.0).abs() < 1e-9);

        pool.deallocate(a, 16, 8).unwrap();
        pool.deallocate(b, 48, 8).unwrap();
    }

    #[test]
    fn test_stats_high_water_marks() {
        let pool = StatsArenaPool::new(8, 256).unwrap();
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.allocate(256, 16).unwrap());
        }
        for p in held.drain(..) {
            pool.deallocate(p, 256, 16).unwrap();
        }
        assert_eq!(pool.live_allocations(), 0);
        // Peaks survive the drain
        assert_eq!(pool.max_busy_arenas(), 4);
        assert_eq!(pool.max_live_allocations(), 4);

        let summary = pool.summary();
        assert_eq!(summary.live_allocations, 0);
        assert_eq!(summary.max_busy_arenas, 4);
        assert_eq!(summary.bytes_allocated, 0);
    }

    #[test]
    fn test_stats_heap_free_configuration() {
        // Both upstreams are arena pools: nothing touches the host heap
        // after the backing pools exist
        let arena_backing = FixedSyncArenaPool::<8, 4096>::new();
        let map_backing = FixedSyncArenaPool::<8, 4096>::new();
        {
            let pool =
                StatsArenaPool::with_upstreams(4, 256, &arena_backing, &map_backing).unwrap();
            let p = pool.allocate(64, 8).unwrap();
            assert_eq!(pool.bytes_allocated(), 64);
            assert!(map_backing.live_allocations() > 0, "map grew from its own upstream");
            pool.deallocate(p, 64, 8).unwrap();
        }
        assert_eq!(arena_backing.live_allocations(), 0);
        assert_eq!(map_backing.live_allocations(), 0);
    }

    #[test]
    fn test_stats_rolls_back_when_map_upstream_fails() {
        let arena_backing = FixedSyncArenaPool::<8, 4096>::new();
        // Too small to ever hold the tracking map's first block
        let map_backing = FixedSyncArenaPool::<1, 16>::new();
        let pool = StatsArenaPool::with_upstreams(4, 256, &arena_backing, &map_backing).unwrap();

        let err = pool.allocate(64, 8).unwrap_err();
        assert!(matches!(err, PoolError::BlockTooLarge { .. }));
        // The base allocation was rolled back
        assert_eq!(pool.live_allocations(), 0);
        assert_eq!(pool.busy_arenas(), 0);
    }

    #[test]
    fn test_stats_map_growth_beyond_initial_capacity() {
        let pool = StatsArenaPool::new(8, 4096).unwrap();
        let mut held = Vec::new();
        // Push the map well past its first capacity doubling
        for i in 0..200usize {
            let bytes = 16 + (i % 4) * 16;
            held.push((pool.allocate(bytes, 8).unwrap(), bytes));
        }
        assert_eq!(pool.live_allocations(), 200);
        assert_eq!(pool.max_live_allocations(), 200);

        for (ptr, bytes) in held {
            pool.deallocate(ptr, bytes, 8).unwrap();
        }
        assert_eq!(pool.live_allocations(), 0);
    }
}
