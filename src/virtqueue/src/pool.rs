/*
Copyright 2026  The Virtqueue Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Bitmap allocator for the data region behind the descriptors.
//!
//! The ring itself only moves `(addr, len)` pairs; someone has to hand out the
//! buffers those pairs point at. [`Slab`] splits a region into `N`-byte slots
//! tracked by a flat bitmap and serves a request with the first run of free
//! slots large enough for it (`FixedBitSet::zeroes` skips whole words of used
//! slots, so the scan is cheap for moderate regions). The most recently freed
//! run is cached and handed out first, which keeps hot buffers in cache.
//!
//! [`BufferPool`] wraps a slab for shared use and exposes the region a device
//! should register with [`DeviceQueue::restrict_buffers`](crate::DeviceQueue::restrict_buffers).

use atomic_refcell::AtomicRefCell;
use fixedbitset::FixedBitSet;
use thiserror::Error;

use super::access::BufferRegion;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Region base {0:#x} is not slot aligned")]
    InvalidAlign(u64),
    #[error("Invalid free of {0:#x}+{1}")]
    InvalidFree(u64, usize),
    #[error("Invalid argument")]
    InvalidArg,
    #[error("Empty region")]
    EmptyRegion,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Overflow")]
    Overflow,
}

/// A block handed out by a [`BufferProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Starting address of the block.
    pub addr: u64,
    /// Length in bytes, rounded up to whole slots.
    pub len: usize,
}

/// Source of data buffers for a queue.
pub trait BufferProvider {
    /// Allocate at least `len` bytes.
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError>;

    /// Free a previously allocated block.
    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError>;
}

/// Runs a cleanup function when dropped, unless dismissed.
///
/// Lets a multi-step operation hand back what it already allocated when a later
/// step fails.
pub struct AllocGuard<F: FnOnce(Allocation)>(Option<(Allocation, F)>);

impl<F: FnOnce(Allocation)> AllocGuard<F> {
    pub fn new(alloc: Allocation, cleanup: F) -> Self {
        Self(Some((alloc, cleanup)))
    }

    /// Keep the allocation and disarm the cleanup.
    pub fn dismiss(mut self) -> Option<Allocation> {
        self.0.take().map(|(alloc, _)| alloc)
    }

    pub fn allocation(&self) -> Option<Allocation> {
        self.0.as_ref().map(|(alloc, _)| *alloc)
    }
}

impl<F: FnOnce(Allocation)> Drop for AllocGuard<F> {
    fn drop(&mut self) {
        if let Some((alloc, cleanup)) = self.0.take() {
            cleanup(alloc)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Slab<const N: usize> {
    base_addr: u64,
    used_slots: FixedBitSet,
    last_free_run: Option<Allocation>,
}

impl<const N: usize> Slab<N> {
    /// Create a slab over `[base_addr, base_addr + region_len)`.
    ///
    /// The region is rounded down to a whole number of slots.
    pub fn new(base_addr: u64, region_len: usize) -> Result<Self, AllocError> {
        if N == 0 {
            return Err(AllocError::InvalidArg);
        }

        if !base_addr.is_multiple_of(N as u64) {
            return Err(AllocError::InvalidAlign(base_addr));
        }

        let num_slots = region_len / N;
        if num_slots == 0 {
            return Err(AllocError::EmptyRegion);
        }

        base_addr
            .checked_add((num_slots * N) as u64)
            .ok_or(AllocError::Overflow)?;

        Ok(Self {
            base_addr,
            used_slots: FixedBitSet::with_capacity(num_slots),
            last_free_run: None,
        })
    }

    #[inline]
    fn addr_of(&self, slot_idx: usize) -> Option<u64> {
        self.base_addr
            .checked_add((slot_idx as u64).checked_mul(N as u64)?)
    }

    /// Slot range covered by `alloc`, if it is slot aligned and inside the slab.
    fn slots_of(&self, alloc: Allocation) -> Option<core::ops::Range<usize>> {
        let Allocation { addr, len } = alloc;
        if len == 0 || !len.is_multiple_of(N) {
            return None;
        }

        let off = usize::try_from(addr.checked_sub(self.base_addr)?).ok()?;
        if !off.is_multiple_of(N) {
            return None;
        }

        let start = off / N;
        let end = start.checked_add(len / N)?;
        (end <= self.used_slots.len()).then_some(start..end)
    }

    fn maybe_invalidate_last_run(&mut self, alloc: Allocation) {
        if let Some(run) = &self.last_free_run {
            let new_end = alloc.addr + alloc.len as u64;
            let run_end = run.addr + run.len as u64;

            if alloc.addr < run_end && run.addr < new_end {
                self.last_free_run = None;
            }
        }
    }

    /// First run of `slots_num` free slots, preferring the last freed run.
    fn find_slots(&mut self, slots_num: usize) -> Option<usize> {
        debug_assert!(slots_num > 0);

        if let Some(run) = self.last_free_run
            && run.len >= slots_num * N
            && let Some(range) = self.slots_of(run)
        {
            self.last_free_run = None;
            return Some(range.start);
        }

        let total = self.used_slots.len();
        self.used_slots.zeroes().find(|&start| {
            start + slots_num <= total
                && self.used_slots.count_ones(start..start + slots_num) == 0
        })
    }

    /// Allocate at least `len` bytes of consecutive slots.
    pub fn alloc(&mut self, len: usize) -> Result<Allocation, AllocError> {
        if len == 0 {
            return Err(AllocError::InvalidArg);
        }

        let need_slots = len.div_ceil(N);
        if need_slots > self.used_slots.len() {
            return Err(AllocError::OutOfMemory);
        }

        let idx = self.find_slots(need_slots).ok_or(AllocError::OutOfMemory)?;
        let addr = self.addr_of(idx).ok_or(AllocError::Overflow)?;
        self.used_slots.insert_range(idx..idx + need_slots);

        let alloc = Allocation {
            addr,
            len: need_slots * N,
        };

        self.maybe_invalidate_last_run(alloc);
        Ok(alloc)
    }

    /// Free a block returned by [`Slab::alloc`].
    ///
    /// Double frees and blocks that were never handed out are rejected.
    pub fn dealloc(&mut self, alloc: Allocation) -> Result<(), AllocError> {
        let invalid = AllocError::InvalidFree(alloc.addr, alloc.len);
        let range = self.slots_of(alloc).ok_or(invalid)?;

        if self.used_slots.count_ones(range.clone()) != range.len() {
            return Err(invalid);
        }

        self.used_slots.remove_range(range);
        self.last_free_run = Some(alloc);
        Ok(())
    }

    /// Number of free bytes.
    pub fn free_bytes(&self) -> usize {
        (self.used_slots.len() - self.used_slots.count_ones(..)) * N
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.used_slots.len() * N
    }

    /// The address range covered by the slab.
    pub fn range(&self) -> core::ops::Range<u64> {
        self.base_addr..self.base_addr + self.capacity() as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.range().contains(&addr)
    }

    pub const fn slot_size() -> usize {
        N
    }
}

/// A slab shared between the producer and its callers.
#[derive(Debug)]
pub struct BufferPool<const N: usize = 256> {
    inner: AtomicRefCell<Slab<N>>,
}

impl<const N: usize> BufferPool<N> {
    /// Create a pool over a fixed region.
    pub fn new(base_addr: u64, region_len: usize) -> Result<Self, AllocError> {
        let slab = Slab::<N>::new(base_addr, region_len)?;
        Ok(Self {
            inner: slab.into(),
        })
    }

    /// The region every allocation lies in.
    pub fn region(&self) -> BufferRegion {
        let range = self.inner.borrow().range();
        BufferRegion::from_range(range)
    }

    pub fn free_bytes(&self) -> usize {
        self.inner.borrow().free_bytes()
    }

    pub fn capacity(&self) -> usize {
        self.inner.borrow().capacity()
    }
}

impl<const N: usize> BufferProvider for BufferPool<N> {
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError> {
        self.inner.borrow_mut().alloc(len)
    }

    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError> {
        self.inner.borrow_mut().dealloc(alloc)
    }
}

impl<P: BufferProvider + ?Sized> BufferProvider for &P {
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError> {
        (**self).alloc(len)
    }

    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError> {
        (**self).dealloc(alloc)
    }
}

impl<P: BufferProvider + ?Sized> BufferProvider for alloc::rc::Rc<P> {
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError> {
        (**self).alloc(len)
    }

    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError> {
        (**self).dealloc(alloc)
    }
}

impl<P: BufferProvider + ?Sized> BufferProvider for alloc::sync::Arc<P> {
    fn alloc(&self, len: usize) -> Result<Allocation, AllocError> {
        (**self).alloc(len)
    }

    fn dealloc(&self, alloc: Allocation) -> Result<(), AllocError> {
        (**self).dealloc(alloc)
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use super::*;

    fn make_slab<const N: usize>(size: usize) -> Slab<N> {
        let base = 0x10000u64.next_multiple_of(N as u64);
        Slab::<N>::new(base, size).unwrap()
    }

    #[test]
    fn slab_new() {
        let slab = Slab::<256>::new(0x10000, 1024 + 100).unwrap();
        assert_eq!(slab.capacity(), 1024);
        assert_eq!(slab.free_bytes(), 1024);
        assert_eq!(
            Slab::<256>::new(0x10001, 1024).unwrap_err(),
            AllocError::InvalidAlign(0x10001)
        );
        assert_eq!(
            Slab::<256>::new(0x10000, 100).unwrap_err(),
            AllocError::EmptyRegion
        );
        assert_eq!(
            Slab::<256>::new(u64::MAX - 255, 1024).unwrap_err(),
            AllocError::Overflow
        );
    }

    #[test]
    fn alloc_rounds_up_to_slots() {
        let mut slab = make_slab::<256>(1024);
        let a = slab.alloc(600).unwrap();
        assert_eq!(a.len, 768);
        assert_eq!(slab.free_bytes(), 256);
        assert_eq!(slab.alloc(0).unwrap_err(), AllocError::InvalidArg);
        assert_eq!(slab.alloc(2048).unwrap_err(), AllocError::OutOfMemory);
    }

    #[test]
    fn alloc_until_full_then_reuse() {
        let mut slab = make_slab::<256>(1024);
        let _a1 = slab.alloc(256).unwrap();
        let a2 = slab.alloc(256).unwrap();
        let _a3 = slab.alloc(256).unwrap();
        let _a4 = slab.alloc(256).unwrap();
        assert_eq!(slab.alloc(256).unwrap_err(), AllocError::OutOfMemory);

        slab.dealloc(a2).unwrap();
        assert_eq!(slab.alloc(256).unwrap().addr, a2.addr);
    }

    #[test]
    fn last_freed_run_is_reused_first() {
        let mut slab = make_slab::<256>(2048);
        let _a1 = slab.alloc(256).unwrap();
        let a2 = slab.alloc(256).unwrap();
        let _a3 = slab.alloc(256).unwrap();
        let a4 = slab.alloc(512).unwrap();

        slab.dealloc(a2).unwrap();
        slab.dealloc(a4).unwrap();
        // first fit would pick a2, the cache hands out a4
        assert_eq!(slab.alloc(256).unwrap().addr, a4.addr);
        assert_eq!(slab.alloc(256).unwrap().addr, a2.addr);
    }

    #[test]
    fn rejects_bad_frees() {
        let mut slab = make_slab::<256>(1024);
        let a = slab.alloc(256).unwrap();

        let mut short = a;
        short.len = 100;
        assert_eq!(
            slab.dealloc(short).unwrap_err(),
            AllocError::InvalidFree(a.addr, 100)
        );

        let outside = Allocation {
            addr: 0x99999,
            len: 256,
        };
        assert!(slab.dealloc(outside).is_err());
        let below = Allocation { addr: 0, len: 256 };
        assert!(slab.dealloc(below).is_err());

        slab.dealloc(a).unwrap();
        assert!(matches!(
            slab.dealloc(a),
            Err(AllocError::InvalidFree(_, 256))
        ));
    }

    #[test]
    fn fragmented_slab_finds_run() {
        let mut slab = make_slab::<256>(1024);
        let a1 = slab.alloc(256).unwrap();
        let a2 = slab.alloc(256).unwrap();
        let _a3 = slab.alloc(256).unwrap();
        let _a4 = slab.alloc(256).unwrap();

        slab.dealloc(a2).unwrap();
        slab.dealloc(a1).unwrap();

        let big = slab.alloc(512).unwrap();
        assert_eq!((big.addr, big.len), (a1.addr, 512));
    }

    #[test]
    fn pool_exposes_region() {
        let pool = BufferPool::<256>::new(0x4000, 4096).unwrap();
        let region = pool.region();
        assert_eq!((region.base(), region.len()), (0x4000, 4096));

        let a = pool.alloc(10).unwrap();
        assert!(region.contains(a.addr, a.len as u32));
        assert_eq!(pool.free_bytes(), 4096 - 256);
        pool.dealloc(a).unwrap();
        assert_eq!(pool.free_bytes(), pool.capacity());
    }

    #[test]
    fn guard_runs_cleanup_unless_dismissed() {
        let pool = BufferPool::<256>::new(0x4000, 1024).unwrap();
        let freed = RefCell::new(Vec::new());

        {
            let a = pool.alloc(10).unwrap();
            let _guard = AllocGuard::new(a, |a| {
                pool.dealloc(a).unwrap();
                freed.borrow_mut().push(a);
            });
        }
        assert_eq!(freed.borrow().len(), 1);
        assert_eq!(pool.free_bytes(), 1024);

        let a = pool.alloc(10).unwrap();
        let guard = AllocGuard::new(a, |a| pool.dealloc(a).unwrap());
        assert_eq!(guard.allocation(), Some(a));
        assert_eq!(guard.dismiss(), Some(a));
        assert_eq!(pool.free_bytes(), 768);
    }

    mod fuzz {
        use quickcheck::{Arbitrary, Gen, QuickCheck};

        use super::*;

        const MAX_OPS: usize = 32;
        const MAX_ALLOC_SIZE: usize = 4096;

        #[derive(Clone, Debug)]
        enum Op {
            Alloc(usize),
            Dealloc(usize),
        }

        impl Arbitrary for Op {
            fn arbitrary(g: &mut Gen) -> Self {
                if bool::arbitrary(g) {
                    Op::Alloc(usize::arbitrary(g) % MAX_ALLOC_SIZE + 1)
                } else {
                    Op::Dealloc(usize::arbitrary(g))
                }
            }
        }

        #[derive(Clone, Debug)]
        struct Scenario {
            pool_size: usize,
            ops: Vec<Op>,
        }

        impl Arbitrary for Scenario {
            fn arbitrary(g: &mut Gen) -> Self {
                let pool_size = usize::arbitrary(g) % (64 * 1024) + 256;
                let num_ops = usize::arbitrary(g) % MAX_OPS + 1;
                let ops = (0..num_ops).map(|_| Op::arbitrary(g)).collect();
                Scenario { pool_size, ops }
            }
        }

        fn check_invariants(pool: &BufferPool<256>, live: &[Allocation]) -> Result<(), &'static str> {
            let slab = pool.inner.borrow();
            let live_bytes: usize = live.iter().map(|a| a.len).sum();
            if slab.free_bytes() + live_bytes != slab.capacity() {
                return Err("free + live != capacity");
            }

            for (i, a) in live.iter().enumerate() {
                if !slab.contains(a.addr) || a.len % 256 != 0 {
                    return Err("allocation outside slab or unaligned");
                }
                for b in &live[i + 1..] {
                    if a.addr < b.addr + b.len as u64 && b.addr < a.addr + a.len as u64 {
                        return Err("overlapping allocations");
                    }
                }
            }

            Ok(())
        }

        fn run_scenario(s: Scenario) -> bool {
            let Ok(pool) = BufferPool::<256>::new(0x10000, s.pool_size) else {
                return true;
            };
            let mut live: Vec<Allocation> = Vec::new();

            for op in &s.ops {
                match *op {
                    Op::Alloc(size) => match pool.alloc(size) {
                        Ok(a) if a.len >= size => live.push(a),
                        Ok(_) => return false,
                        Err(AllocError::OutOfMemory) => {}
                        Err(_) => return false,
                    },
                    Op::Dealloc(idx) => {
                        if live.is_empty() {
                            continue;
                        }
                        let a = live.swap_remove(idx % live.len());
                        if pool.dealloc(a).is_err() || pool.dealloc(a).is_ok() {
                            return false;
                        }
                    }
                }

                if check_invariants(&pool, &live).is_err() {
                    return false;
                }
            }

            live.drain(..).all(|a| pool.dealloc(a).is_ok()) && pool.free_bytes() == pool.capacity()
        }

        #[test]
        fn prop_allocator_invariants() {
            #[cfg(miri)]
            let tests = 10;
            #[cfg(not(miri))]
            let tests = 500;

            QuickCheck::new()
                .tests(tests)
                .quickcheck(run_scenario as fn(Scenario) -> bool);
        }
    }
}
