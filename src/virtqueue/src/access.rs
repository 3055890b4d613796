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

//! Shared Memory Access
//!
//! This module defines the [`MemOps`] trait through which both queue roles touch
//! the shared region. Addresses are plain `u64` values in an address space agreed
//! on by both roles (an offset into a mapping, a guest physical address, ...),
//! never raw pointers, so a misbehaving peer cannot make either side dereference
//! an arbitrary location.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU16, Ordering};

use bytemuck::Pod;
use thiserror::Error;

use crate::RingError;

/// Backend-provided access to the shared region.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Addresses are validated (or known valid) before being dereferenced
/// - `load_acquire`/`store_release` provide acquire/release ordering with respect
///   to the plain `read`/`write` accesses performed by the same context
/// - Reads and writes don't cause undefined behavior (alignment, validity)
pub trait MemOps {
    type Error;

    /// Read bytes from shared memory.
    ///
    /// Used for descriptor table entries, ring slots and buffer contents.
    ///
    /// # Returns
    ///
    /// Number of bytes actually read (should equal `dst.len()` on success).
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error>;

    /// Write bytes to shared memory.
    ///
    /// # Returns
    ///
    /// Number of bytes actually written (should equal `src.len()` on success).
    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error>;

    /// Load a u16 with acquire semantics.
    ///
    /// `addr` must be 2-byte aligned. This is the read side of every ring index
    /// and flags word.
    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error>;

    /// Store a u16 with release semantics.
    ///
    /// `addr` must be 2-byte aligned. All plain writes issued before this call
    /// must be visible to a peer that observes the stored value.
    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error>;

    /// Full barrier between a store to one shared word and a load of another.
    ///
    /// Used when re-enabling notifications and before deciding whether to kick,
    /// where acquire/release alone cannot order a store before a later load.
    fn fence(&self) {
        core::sync::atomic::fence(Ordering::SeqCst);
    }

    /// Read a Pod type at the given address.
    fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
        let mut val = T::zeroed();
        let bytes = bytemuck::bytes_of_mut(&mut val);

        self.read(addr, bytes)?;
        Ok(val)
    }

    /// Write a Pod type at the given address.
    fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
        let bytes = bytemuck::bytes_of(&val);
        self.write(addr, bytes)?;
        Ok(())
    }
}

macro_rules! forward_mem_ops {
    ($($ty:ty),*) => {$(
        impl<M: MemOps + ?Sized> MemOps for $ty {
            type Error = M::Error;

            #[inline]
            fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
                (**self).read(addr, dst)
            }

            #[inline]
            fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
                (**self).write(addr, src)
            }

            #[inline]
            fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
                (**self).load_acquire(addr)
            }

            #[inline]
            fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
                (**self).store_release(addr, val)
            }

            #[inline]
            fn fence(&self) {
                (**self).fence()
            }

            #[inline]
            fn read_val<T: Pod>(&self, addr: u64) -> Result<T, Self::Error> {
                (**self).read_val(addr)
            }

            #[inline]
            fn write_val<T: Pod>(&self, addr: u64, val: T) -> Result<(), Self::Error> {
                (**self).write_val(addr, val)
            }
        }
    )*};
}

forward_mem_ops!(&M, Rc<M>, Arc<M>);

/// A registered data region: the only addresses buffer descriptors may point into.
///
/// A device that registers a region with
/// [`DeviceQueue::restrict_buffers`](crate::DeviceQueue::restrict_buffers) rejects
/// every descriptor whose `[addr, addr + len)` is not fully contained in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    base: u64,
    len: u64,
}

impl BufferRegion {
    /// Create a region, failing if `base + len` overflows.
    pub fn new(base: u64, len: u64) -> Result<Self, RingError> {
        base.checked_add(len).ok_or(RingError::InvalidLayout)?;
        Ok(Self { base, len })
    }

    pub(crate) fn from_range(range: core::ops::Range<u64>) -> Self {
        Self {
            base: range.start,
            len: range.end.saturating_sub(range.start),
        }
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Does `[addr, addr + len)` lie inside this region?
    #[inline]
    pub fn contains(&self, addr: u64, len: u32) -> bool {
        let Some(off) = addr.checked_sub(self.base) else {
            return false;
        };

        off <= self.len && self.len - off >= len as u64
    }

    /// Check a buffer against the region.
    pub fn check(&self, addr: u64, len: u32) -> Result<(), RingError> {
        if self.contains(addr, len) {
            Ok(())
        } else {
            Err(RingError::BufferOutOfBounds { addr, len })
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    #[error("Access {addr:#x}+{len} is out of bounds")]
    OutOfBounds { addr: u64, len: usize },
    #[error("Atomic access at {0:#x} is misaligned")]
    Misaligned(u64),
}

/// A heap-allocated shared region addressed from zero.
///
/// Both roles can hold it (through `&`, [`Rc`] or [`Arc`]) when they live in the
/// same address space, for example two threads or a test. Every access is bounds
/// checked. The backing storage is 8-byte aligned.
pub struct HeapMem {
    words: Box<[UnsafeCell<u64>]>,
    len: usize,
}

// SAFETY: all access goes through raw pointers into `UnsafeCell` storage; ordering
// between contexts is established by the acquire/release index protocol.
unsafe impl Sync for HeapMem {}

impl HeapMem {
    /// Allocate `len` zeroed bytes.
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(8)).map(|_| UnsafeCell::new(0)).collect();
        Self { words, len }
    }

    /// Size of the region in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }

    fn ptr(&self, addr: u64, len: usize) -> Result<*mut u8, MemError> {
        let oob = MemError::OutOfBounds { addr, len };
        let start = usize::try_from(addr).map_err(|_| oob)?;
        let end = start.checked_add(len).ok_or(oob)?;
        if end > self.len {
            return Err(oob);
        }

        let base = UnsafeCell::raw_get(self.words.as_ptr()).cast::<u8>();
        Ok(base.wrapping_add(start))
    }

    fn atomic(&self, addr: u64) -> Result<&AtomicU16, MemError> {
        if !addr.is_multiple_of(2) {
            return Err(MemError::Misaligned(addr));
        }
        let ptr = self.ptr(addr, 2)?;
        // SAFETY: in bounds, 2-byte aligned (storage is 8-byte aligned) and the
        // storage lives in `UnsafeCell`s for as long as `self`.
        Ok(unsafe { AtomicU16::from_ptr(ptr.cast()) })
    }
}

impl core::fmt::Debug for HeapMem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapMem").field("len", &self.len).finish()
    }
}

impl MemOps for HeapMem {
    type Error = MemError;

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
        let src = self.ptr(addr, dst.len())?;
        // SAFETY: `src` is valid for `dst.len()` bytes and does not overlap `dst`.
        unsafe { core::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(dst.len())
    }

    fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
        let dst = self.ptr(addr, src.len())?;
        // SAFETY: `dst` is valid for `src.len()` bytes and does not overlap `src`.
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(src.len())
    }

    fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
        Ok(self.atomic(addr)?.load(Ordering::Acquire))
    }

    fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
        self.atomic(addr)?.store(val, Ordering::Release);
        Ok(())
    }
}
