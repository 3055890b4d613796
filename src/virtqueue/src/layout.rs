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

//! Shared Memory Layout
//!
//! ```text
//!  base ─> ┌──────────────────────────────┐
//!          │ descriptor table             │  DESC_CAPACITY * 16 bytes, 16-aligned
//!          ├──────────────────────────────┤
//!          │ avail: flags u16 | idx u16   │  written by the driver only
//!          │        ring[RING_CAPACITY]   │  u16 chain heads
//!          ├──────────────────────────────┤
//!          │ used:  flags u16 | idx u16   │  written by the device only
//!          │        ring[RING_CAPACITY]   │  { id u32, len u32 }
//!          └──────────────────────────────┘
//! ```
//!
//! `idx` fields are free-running counters; the slot for counter value `i` is
//! `i & (RING_CAPACITY - 1)`.

use core::num::NonZeroU16;

use bytemuck::{Pod, Zeroable};

use super::desc::{DescTable, Descriptor};
use crate::RingError;

/// Largest supported descriptor table. Keeps every index and the SENTINEL
/// representable in the 16-bit `next` field.
pub const MAX_DESC_CAPACITY: u16 = 1 << 15;

/// One entry of the used ring.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct UsedElem {
    /// Head index of the completed chain.
    pub id: u32,
    /// Total bytes the device reports for the chain.
    pub len: u32,
}

const _: () = assert!(core::mem::size_of::<UsedElem>() == 8);

impl UsedElem {
    pub const SIZE: usize = core::mem::size_of::<Self>();
}

const RING_HEADER_SIZE: usize = 4;
const AVAIL_ALIGN: usize = 2;
const USED_ALIGN: usize = 4;

#[inline]
const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Addresses and capacities of the three shared areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Descriptor table base in shared memory.
    pub desc_table_addr: u64,
    /// Number of descriptors (DESC_CAPACITY).
    pub desc_table_len: u16,
    /// Available ring base.
    pub avail_addr: u64,
    /// Used ring base.
    pub used_addr: u64,
    /// Number of entries in each ring (RING_CAPACITY).
    pub ring_len: u16,
}

impl Layout {
    /// Create a layout over three independently placed areas.
    pub fn new(
        desc_table_addr: u64,
        desc_table_len: u16,
        avail_addr: u64,
        used_addr: u64,
        ring_len: u16,
    ) -> Result<Self, RingError> {
        let layout = Self {
            desc_table_addr,
            desc_table_len,
            avail_addr,
            used_addr,
            ring_len,
        };

        layout.validate()?;
        Ok(layout)
    }

    /// Pack the table and both rings contiguously starting at `base`.
    ///
    /// The region starting at `base` must be at least
    /// [`Layout::query_size`] bytes long.
    pub fn from_base(
        base: u64,
        num_descs: NonZeroU16,
        ring_len: NonZeroU16,
    ) -> Result<Self, RingError> {
        let desc_size = num_descs.get() as u64 * Descriptor::SIZE as u64;
        let avail_addr = base.checked_add(desc_size).ok_or(RingError::InvalidLayout)?;
        let avail_size = Self::avail_size(ring_len.get() as usize) as u64;
        let used_addr = avail_addr
            .checked_add(avail_size)
            .map(|end| end.next_multiple_of(USED_ALIGN as u64))
            .ok_or(RingError::InvalidLayout)?;

        Self::new(
            base,
            num_descs.get(),
            avail_addr,
            used_addr,
            ring_len.get(),
        )
    }

    /// Memory needed by [`Layout::from_base`] for the given capacities.
    pub const fn query_size(num_descs: usize, ring_len: usize) -> usize {
        let desc_size = num_descs * Descriptor::SIZE;
        let used_off = align_up(desc_size + Self::avail_size(ring_len), USED_ALIGN);
        used_off + Self::used_size(ring_len)
    }

    const fn avail_size(ring_len: usize) -> usize {
        RING_HEADER_SIZE + ring_len * size_of::<u16>()
    }

    const fn used_size(ring_len: usize) -> usize {
        RING_HEADER_SIZE + ring_len * UsedElem::SIZE
    }

    /// Check capacities, alignment and that the three areas neither overflow
    /// the address space nor overlap.
    pub fn validate(&self) -> Result<(), RingError> {
        let descs = self.desc_table_len;
        let ring = self.ring_len;

        if !descs.is_power_of_two() || descs > MAX_DESC_CAPACITY {
            return Err(RingError::InvalidLayout);
        }

        if !ring.is_power_of_two() || ring < descs {
            return Err(RingError::InvalidLayout);
        }

        if !self.desc_table_addr.is_multiple_of(Descriptor::ALIGN as u64)
            || !self.avail_addr.is_multiple_of(AVAIL_ALIGN as u64)
            || !self.used_addr.is_multiple_of(USED_ALIGN as u64)
        {
            return Err(RingError::InvalidLayout);
        }

        let areas = [
            (
                self.desc_table_addr,
                descs as u64 * Descriptor::SIZE as u64,
            ),
            (self.avail_addr, Self::avail_size(ring as usize) as u64),
            (self.used_addr, Self::used_size(ring as usize) as u64),
        ];

        for (addr, size) in areas {
            addr.checked_add(size).ok_or(RingError::InvalidLayout)?;
        }

        for (i, &(a, a_len)) in areas.iter().enumerate() {
            for &(b, b_len) in &areas[i + 1..] {
                if a < b + b_len && b < a + a_len {
                    return Err(RingError::InvalidLayout);
                }
            }
        }

        Ok(())
    }

    pub(crate) fn desc_table(&self) -> DescTable {
        DescTable::new(self.desc_table_addr, self.desc_table_len)
    }
}

/// Addresses within the available ring.
#[derive(Debug, Clone, Copy)]
pub struct AvailRing {
    addr: u64,
    mask: u16,
}

impl AvailRing {
    pub fn new(layout: &Layout) -> Self {
        Self {
            addr: layout.avail_addr,
            mask: layout.ring_len.wrapping_sub(1),
        }
    }

    #[inline]
    pub fn flags_addr(&self) -> u64 {
        self.addr
    }

    #[inline]
    pub fn idx_addr(&self) -> u64 {
        self.addr + 2
    }

    /// Address of the slot that counter value `pos` maps to.
    #[inline]
    pub fn slot_addr(&self, pos: u16) -> u64 {
        self.addr + RING_HEADER_SIZE as u64 + (pos & self.mask) as u64 * 2
    }
}

/// Addresses within the used ring.
#[derive(Debug, Clone, Copy)]
pub struct UsedRing {
    addr: u64,
    mask: u16,
}

impl UsedRing {
    pub fn new(layout: &Layout) -> Self {
        Self {
            addr: layout.used_addr,
            mask: layout.ring_len.wrapping_sub(1),
        }
    }

    #[inline]
    pub fn flags_addr(&self) -> u64 {
        self.addr
    }

    #[inline]
    pub fn idx_addr(&self) -> u64 {
        self.addr + 2
    }

    #[inline]
    pub fn slot_addr(&self, pos: u16) -> u64 {
        self.addr + RING_HEADER_SIZE as u64 + (pos & self.mask) as u64 * UsedElem::SIZE as u64
    }
}

/// Number of entries a peer has published past `expected`.
///
/// Fails with [`RingError::BadIndex`] if the shared counter claims more entries
/// than the ring can hold.
#[inline]
pub(crate) fn pending_entries(shared: u16, expected: u16, ring_len: u16) -> Result<u16, RingError> {
    let pending = shared.wrapping_sub(expected);
    if pending > ring_len {
        return Err(RingError::BadIndex {
            idx: shared,
            expected,
        });
    }
    Ok(pending)
}
