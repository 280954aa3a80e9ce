//! Polymorphic memory resource abstraction
//!
//! Containers and pools talk to each other through [`MemoryResource`]:
//! request raw bytes, hand them back, compare resource identity. Every pool
//! in this crate implements it, so pools can be stacked (a pool's arena
//! storage drawn from another pool) and the statistics wrapper can stand in
//! for the engine it wraps.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use crate::error::{PoolError, PoolResult};

/// Uniform allocate/deallocate surface
///
/// Contract:
/// - `align` is a power of two.
/// - A successful `allocate(bytes, align)` with `bytes > 0` returns a
///   pointer aligned to `align` (unless the implementation documents
///   otherwise) valid for `bytes` bytes until the matching `deallocate`.
/// - `allocate(0, align)` returns an aligned dangling sentinel; passing it
///   back to `deallocate` with `bytes == 0` is a no-op.
/// - `deallocate` must receive exactly the pointer, byte count and
///   alignment of a prior allocation from the *same* resource.
/// - `is_equal` is identity: memory allocated from one resource can be
///   deallocated through another only if `is_equal` returns true.
pub trait MemoryResource {
    /// Allocate `bytes` bytes aligned to `align`
    fn allocate(&self, bytes: usize, align: usize) -> PoolResult<NonNull<u8>>;

    /// Return an allocation made by this resource
    fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize) -> PoolResult<()>;

    /// True iff `other` is this very resource
    fn is_equal(&self, other: &dyn MemoryResource) -> bool;
}

/// Aligned dangling sentinel for zero-byte allocations
#[inline]
pub(crate) fn dangling_for(align: usize) -> NonNull<u8> {
    // A power-of-two alignment is never zero
    unsafe { NonNull::new_unchecked(align.max(1) as *mut u8) }
}

/// Host-heap memory resource
///
/// The default upstream for heap-backed pools. Allocation failure aborts
/// through `handle_alloc_error`, matching global-allocator behaviour.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResource;

static SYSTEM: SystemResource = SystemResource;

/// Shared host-heap resource instance
///
/// Use this (rather than fresh `SystemResource` values) when resource
/// identity matters: `is_equal` compares addresses.
pub fn system_resource() -> &'static SystemResource {
    &SYSTEM
}

impl MemoryResource for SystemResource {
    fn allocate(&self, bytes: usize, align: usize) -> PoolResult<NonNull<u8>> {
        if bytes == 0 {
            return Ok(dangling_for(align));
        }
        let Ok(layout) = Layout::from_size_align(bytes, align) else {
            // Request no host heap could ever satisfy
            return Err(PoolError::BlockTooLarge {
                needed: bytes,
                available: isize::MAX as usize,
            });
        };
        let ptr = unsafe { alloc(layout) };
        match NonNull::new(ptr) {
            Some(p) => Ok(p),
            None => handle_alloc_error(layout),
        }
    }

    fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize) -> PoolResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        let Ok(layout) = Layout::from_size_align(bytes, align) else {
            return Err(PoolError::PoolCorrupted {
                addr: ptr.as_ptr() as usize,
                bytes,
                align,
            });
        };
        unsafe { dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        std::ptr::addr_eq(self as *const Self, other as *const dyn MemoryResource)
    }
}

/// RAII guard for a block drawn from an upstream resource
///
/// Returns the block to the upstream on drop. Heap-backed pools hold their
/// arena bytes, free list and counters in these.
pub(crate) struct RawRegion<'up> {
    ptr: NonNull<u8>,
    bytes: usize,
    align: usize,
    upstream: &'up dyn MemoryResource,
}

impl<'up> RawRegion<'up> {
    /// Draw a zero-initialized block from the upstream
    pub(crate) fn zeroed(
        upstream: &'up dyn MemoryResource,
        bytes: usize,
        align: usize,
    ) -> PoolResult<Self> {
        let ptr = upstream.allocate(bytes, align)?;
        if bytes > 0 {
            unsafe { ptr.as_ptr().write_bytes(0, bytes) };
        }
        Ok(Self {
            ptr,
            bytes,
            align,
            upstream,
        })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for RawRegion<'_> {
    fn drop(&mut self) {
        // Errors cannot propagate out of drop; the upstream outlives us
        let _ = self.upstream.deallocate(self.ptr, self.bytes, self.align);
    }
}
