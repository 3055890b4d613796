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

//! Descriptor Table and Allocator
//!
//! Each descriptor is one scatter-gather segment. Descriptors are threaded into
//! chains through their `next` index; the value `DESC_CAPACITY` (the table length)
//! is the SENTINEL that ends a chain.
//!
//! The table in shared memory is written only by the driver. The driver never
//! reads it back: [`DescAllocator`] keeps a private shadow of every entry and
//! threads its free list through the shadow `next` fields, so whatever the device
//! scribbles on the table cannot corrupt the allocator.

use alloc::vec::Vec;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use fixedbitset::FixedBitSet;

use super::MemOps;
use crate::RingError;

bitflags! {
    /// Descriptor flags, bit-compatible with split virtqueues.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DescFlags: u16 {
        /// The `next` field links to another descriptor. Maintained by the driver.
        const NEXT  = 1 << 0;
        /// The buffer is device write-only (otherwise device read-only).
        const WRITE = 1 << 1;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct Descriptor {
    /// Address of the buffer in the shared address space.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// Flags (NEXT, WRITE).
    pub flags: u16,
    /// Next descriptor in the chain or SENTINEL.
    pub next: u16,
}

const _: () = assert!(core::mem::size_of::<Descriptor>() == 16);
const _: () = assert!(Descriptor::ADDR_OFFSET == 0);
const _: () = assert!(Descriptor::LEN_OFFSET == 8);
const _: () = assert!(Descriptor::FLAGS_OFFSET == 12);
const _: () = assert!(Descriptor::NEXT_OFFSET == 14);

impl Descriptor {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const ALIGN: usize = core::mem::align_of::<Self>();

    pub const ADDR_OFFSET: usize = core::mem::offset_of!(Self, addr);
    pub const LEN_OFFSET: usize = core::mem::offset_of!(Self, len);
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);
    pub const NEXT_OFFSET: usize = core::mem::offset_of!(Self, next);

    pub fn new(addr: u64, len: u32, flags: DescFlags, next: u16) -> Self {
        Self {
            addr,
            len,
            flags: flags.bits(),
            next,
        }
    }

    /// Get flags as a [`DescFlags`] bitfield.
    #[inline]
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }

    /// Is this descriptor writeable by the device?
    #[inline]
    pub fn is_writeable(&self) -> bool {
        self.flags().contains(DescFlags::WRITE)
    }

    /// Does this descriptor point to a next descriptor in the chain?
    #[inline]
    pub fn is_next(&self) -> bool {
        self.flags().contains(DescFlags::NEXT)
    }
}

/// One buffer as seen by the user of a queue: address, length and the
/// caller-visible flags (never [`DescFlags::NEXT`]).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufferElement {
    pub addr: u64,
    pub len: u32,
    pub flags: DescFlags,
}

impl BufferElement {
    pub fn new(addr: u64, len: u32, flags: DescFlags) -> Self {
        Self {
            addr,
            len,
            flags: flags - DescFlags::NEXT,
        }
    }

    /// A buffer the device reads from.
    pub fn readable(addr: u64, len: u32) -> Self {
        Self::new(addr, len, DescFlags::empty())
    }

    /// A buffer the device writes to.
    pub fn writable(addr: u64, len: u32) -> Self {
        Self::new(addr, len, DescFlags::WRITE)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.flags.contains(DescFlags::WRITE)
    }
}

#[cfg(feature = "fuzzing")]
impl<'a> arbitrary::Arbitrary<'a> for DescFlags {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(DescFlags::from_bits_truncate(u.arbitrary()?))
    }
}

#[cfg(feature = "fuzzing")]
impl<'a> arbitrary::Arbitrary<'a> for BufferElement {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(BufferElement::new(u.arbitrary()?, u.arbitrary()?, u.arbitrary()?))
    }
}

impl From<&Descriptor> for BufferElement {
    fn from(desc: &Descriptor) -> Self {
        BufferElement::new(desc.addr, desc.len, desc.flags())
    }
}

/// A read-only view of the descriptor table in shared memory.
#[derive(Debug, Clone, Copy)]
pub struct DescTable {
    base_addr: u64,
    size: u16,
}

impl DescTable {
    /// Create a view over `size` descriptors starting at `base_addr`.
    ///
    /// [`Layout`](crate::Layout) validates both values before a queue builds its table.
    pub(crate) fn new(base_addr: u64, size: u16) -> Self {
        debug_assert!(base_addr.is_multiple_of(Descriptor::ALIGN as u64));
        Self { base_addr, size }
    }

    /// Address of the descriptor at `idx` or None if `idx` is out of bounds.
    pub fn desc_addr(&self, idx: u16) -> Option<u64> {
        if idx >= self.size {
            return None;
        }

        Some(self.base_addr + (idx as u64 * Descriptor::SIZE as u64))
    }

    /// Number of descriptors in the table (DESC_CAPACITY).
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.size as usize
    }

    /// The index value that terminates a chain.
    #[inline]
    pub fn sentinel(&self) -> u16 {
        self.size
    }

    /// Decode a `next` link: `Ok(None)` for SENTINEL, an error for anything out of range.
    #[inline]
    pub fn link(&self, next: u16) -> Result<Option<u16>, RingError> {
        match next {
            n if n == self.size => Ok(None),
            n if n < self.size => Ok(Some(n)),
            _ => Err(RingError::BadChain),
        }
    }

    /// Read the descriptor at `idx`, which may come from an untrusted peer.
    pub fn read<M: MemOps>(&self, mem: &M, idx: u16) -> Result<Descriptor, RingError> {
        let addr = self.desc_addr(idx).ok_or(RingError::BadChain)?;
        mem.read_val(addr).map_err(|_| RingError::MemError)
    }
}

/// Driver-only descriptor allocator.
///
/// Owns the private shadow of the table and the free list. Invariant:
/// `num_free` equals the length of the free list, and a descriptor is either on
/// the free list or marked in `allocated`, never both.
#[derive(Debug)]
pub struct DescAllocator {
    table: DescTable,
    shadow: Vec<Descriptor>,
    allocated: FixedBitSet,
    free_head: u16,
    num_free: u16,
}

impl DescAllocator {
    /// Create an allocator with every descriptor on the free list, in index order.
    pub(crate) fn new(table: DescTable) -> Self {
        let size = table.size;
        let shadow = (0..size)
            .map(|i| Descriptor::new(0, 0, DescFlags::empty(), i + 1))
            .collect();

        Self {
            table,
            shadow,
            allocated: FixedBitSet::with_capacity(size as usize),
            free_head: if size == 0 { table.sentinel() } else { 0 },
            num_free: size,
        }
    }

    /// Pop a descriptor off the free list, fill it in and, if `prev` is given,
    /// append it to the chain ending at `prev`.
    ///
    /// Fails with [`RingError::WouldBlock`] when the free list is empty, leaving
    /// every structure untouched.
    pub fn allocate<M: MemOps>(
        &mut self,
        mem: &M,
        elem: BufferElement,
        prev: Option<u16>,
    ) -> Result<u16, RingError> {
        let idx = self.table.link(self.free_head)?.ok_or(RingError::WouldBlock)?;

        if let Some(p) = prev {
            let tail = self.shadow.get(p as usize).ok_or(RingError::InvalidState)?;
            if !self.allocated.contains(p as usize) || tail.next != self.table.sentinel() {
                return Err(RingError::InvalidState);
            }
        }

        let desc = Descriptor::new(elem.addr, elem.len, elem.flags, self.table.sentinel());
        let addr = self.table.desc_addr(idx).ok_or(RingError::InvalidState)?;
        mem.write_val(addr, desc).map_err(|_| RingError::MemError)?;

        if let Some(p) = prev {
            let mut tail = self.shadow[p as usize];
            tail.next = idx;
            tail.flags |= DescFlags::NEXT.bits();

            let tail_addr = self.table.desc_addr(p).ok_or(RingError::InvalidState)?;
            mem.write_val(tail_addr, tail)
                .map_err(|_| RingError::MemError)?;
            self.shadow[p as usize] = tail;
        }

        self.free_head = self.shadow[idx as usize].next;
        self.shadow[idx as usize] = desc;
        self.allocated.insert(idx as usize);
        self.num_free -= 1;

        Ok(idx)
    }

    /// The buffer `idx` describes and the next descriptor of its chain, without
    /// freeing anything.
    pub fn peek(&self, idx: u16) -> Result<(BufferElement, Option<u16>), RingError> {
        if idx >= self.table.size || !self.allocated.contains(idx as usize) {
            return Err(RingError::InvalidState);
        }

        let desc = self.shadow[idx as usize];
        Ok((BufferElement::from(&desc), self.table.link(desc.next)?))
    }

    /// Push `idx` back onto the free list.
    ///
    /// Returns the buffer it described and the next descriptor of its chain, so a
    /// whole chain can be freed one step per call.
    pub fn release(&mut self, idx: u16) -> Result<(BufferElement, Option<u16>), RingError> {
        if idx >= self.table.size || !self.allocated.contains(idx as usize) {
            return Err(RingError::InvalidState);
        }

        let desc = self.shadow[idx as usize];
        let next = self.table.link(desc.next)?;

        self.shadow[idx as usize] = Descriptor::new(0, 0, DescFlags::empty(), self.free_head);
        self.free_head = idx;
        self.allocated.set(idx as usize, false);
        self.num_free += 1;

        Ok((BufferElement::from(&desc), next))
    }

    /// Number of descriptors on the free list.
    #[inline]
    pub fn num_free(&self) -> usize {
        self.num_free as usize
    }

    /// Is `idx` currently allocated?
    #[inline]
    pub fn is_allocated(&self, idx: u16) -> bool {
        self.allocated.contains(idx as usize)
    }

    pub fn table(&self) -> &DescTable {
        &self.table
    }
}
