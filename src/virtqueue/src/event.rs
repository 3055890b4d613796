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

//! Event Suppression
//!
//! Each ring's `flags` word is written by the ring's producer and tells the
//! *other* side whether it wants to be notified. The driver publishes its wish
//! in `avail.flags`, the device in `used.flags`. Suppression is a hint: a role
//! that suppresses notifications must poll.

use bitflags::bitflags;

use super::MemOps;
use crate::RingError;

bitflags! {
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EventFlags: u16 {
        /// Don't notify me, I poll.
        const NO_NOTIFY = 1 << 0;
    }
}

impl EventFlags {
    /// Read the flags word at `addr` with acquire semantics.
    ///
    /// Unknown bits written by the peer are ignored.
    pub fn read_acquire<M: MemOps>(mem: &M, addr: u64) -> Result<Self, RingError> {
        let raw = mem.load_acquire(addr).map_err(|_| RingError::MemError)?;
        Ok(Self::from_bits_truncate(raw))
    }

    /// Publish the flags word at `addr` with release semantics.
    pub fn write_release<M: MemOps>(self, mem: &M, addr: u64) -> Result<(), RingError> {
        mem.store_release(addr, self.bits())
            .map_err(|_| RingError::MemError)
    }

    /// Does a peer that published these flags want a notification?
    #[inline]
    pub fn wants_notification(self) -> bool {
        !self.contains(EventFlags::NO_NOTIFY)
    }
}
