//! Shared test support: a growable container backed by a memory resource
//! and a deterministic PRNG for reproducible workloads.
#![allow(dead_code)]

use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use arena_pool::{MemoryResource, PoolResult};

/// Growable sequence container drawing its buffer from a memory resource
///
/// Grows by doubling (allocate new, copy, release old), the pattern any
/// vector-like consumer of the pool produces.
pub struct PoolVec<'r, T: Copy> {
    resource: &'r dyn MemoryResource,
    ptr: NonNull<T>,
    len: usize,
    cap: usize,
}

impl<'r, T: Copy> PoolVec<'r, T> {
    pub fn new(resource: &'r dyn MemoryResource) -> Self {
        Self {
            resource,
            ptr: NonNull::dangling(),
            len: 0,
            cap: 0,
        }
    }

    pub fn with_capacity(resource: &'r dyn MemoryResource, cap: usize) -> PoolResult<Self> {
        let mut vec = Self::new(resource);
        if cap > 0 {
            vec.grow_to(cap)?;
        }
        Ok(vec)
    }

    fn grow_to(&mut self, new_cap: usize) -> PoolResult<()> {
        let new_ptr = self
            .resource
            .allocate(new_cap * size_of::<T>(), align_of::<T>())?
            .cast::<T>();
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.len);
        }
        if self.cap > 0 {
            self.resource
                .deallocate(self.ptr.cast(), self.cap * size_of::<T>(), align_of::<T>())
                .expect("releasing the old buffer");
        }
        self.ptr = new_ptr;
        self.cap = new_cap;
        Ok(())
    }

    pub fn push(&mut self, value: T) -> PoolResult<()> {
        if self.len == self.cap {
            let new_cap = if self.cap == 0 { 4 } else { self.cap * 2 };
            self.grow_to(new_cap)?;
        }
        unsafe {
            self.ptr.as_ptr().add(self.len).write(value);
        }
        self.len += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy> Drop for PoolVec<'_, T> {
    fn drop(&mut self) {
        if self.cap > 0 {
            let _ = self.resource.deallocate(
                self.ptr.cast(),
                self.cap * size_of::<T>(),
                align_of::<T>(),
            );
        }
    }
}

/// SplitMix64: small deterministic PRNG for reproducible stress workloads
pub struct SplitMix64(u64);

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Uniform value in `0..bound`
    pub fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}
