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

//! Device role: consumes the available ring, walks chains read-only and
//! produces the used ring.
//!
//! Everything the device reads comes from a less trusted driver. Each ring
//! entry and `next` link is range checked before use, a walk never takes more
//! than DESC_CAPACITY steps, and the first malformed structure disables the
//! queue: every later call fails with [`RingError::Broken`].

use core::cell::Cell;

use fixedbitset::FixedBitSet;

use super::access::{BufferRegion, MemOps};
use super::cursor::ChainCursor;
use super::desc::{BufferElement, DescTable};
use super::event::EventFlags;
use super::layout::{AvailRing, Layout, UsedElem, UsedRing, pending_entries};
use crate::{Notifier, QueueStats, RingError};

/// The device half of a split virtqueue.
///
/// Holds only a read view of the descriptor table; there is no way to allocate
/// or free descriptors through it.
#[derive(Debug)]
pub struct DeviceQueue<M, N> {
    mem: M,
    notifier: N,
    table: DescTable,
    avail: AvailRing,
    used: UsedRing,
    ring_len: u16,
    /// Next available counter value we expect the driver to publish.
    next_avail: u16,
    /// Our own `used.idx`.
    used_idx: u16,
    /// Heads consumed and not yet published as used.
    consumed: FixedBitSet,
    inflight: usize,
    region: Option<BufferRegion>,
    event_flags_shadow: EventFlags,
    broken: Cell<bool>,
}

impl<M: MemOps, N: Notifier> DeviceQueue<M, N> {
    /// Create the device half and reset the used ring header.
    pub fn new(layout: Layout, mem: M, notifier: N) -> Result<Self, RingError> {
        layout.validate()?;

        let used = UsedRing::new(&layout);
        EventFlags::empty().write_release(&mem, used.flags_addr())?;
        mem.store_release(used.idx_addr(), 0)
            .map_err(|_| RingError::MemError)?;

        Ok(Self {
            table: layout.desc_table(),
            avail: AvailRing::new(&layout),
            used,
            ring_len: layout.ring_len,
            next_avail: 0,
            used_idx: 0,
            consumed: FixedBitSet::with_capacity(layout.desc_table_len as usize),
            inflight: 0,
            region: None,
            event_flags_shadow: EventFlags::empty(),
            broken: Cell::new(false),
            mem,
            notifier,
        })
    }

    /// Only accept descriptors whose buffers lie entirely inside `region`.
    pub fn restrict_buffers(&mut self, region: BufferRegion) {
        self.region = Some(region);
    }

    pub fn region(&self) -> Option<BufferRegion> {
        self.region
    }

    /// Dequeue the next chain head published by the driver.
    pub fn consume_available(&mut self) -> Result<Option<ChainCursor>, RingError> {
        self.check()?;

        let shared = self.load_avail_idx()?;
        let pending =
            pending_entries(shared, self.next_avail, self.ring_len).map_err(|e| self.poison(e))?;

        if pending == 0 {
            return Ok(None);
        }

        let head: u16 = self
            .mem
            .read_val(self.avail.slot_addr(self.next_avail))
            .map_err(|_| RingError::MemError)?;

        // a head we still own cannot be published again
        if head as usize >= self.table.len() || self.consumed.contains(head as usize) {
            return Err(self.poison(RingError::BadChain));
        }

        self.next_avail = self.next_avail.wrapping_add(1);
        self.consumed.insert(head as usize);
        self.inflight += 1;

        Ok(Some(ChainCursor::at(head)))
    }

    /// Sum of the lengths of every descriptor in the chain.
    ///
    /// Walks from the head without moving `cursor`, so a destination can be
    /// sized before the chain is gathered.
    pub fn chain_total_length(&self, cursor: &ChainCursor) -> Result<u64, RingError> {
        self.check()?;

        let Some(head) = cursor.first() else {
            return Ok(0);
        };

        let mut walk = ChainCursor::at(head);
        let mut total = 0u64;
        while let Some(elem) = self.step(&mut walk).map_err(|e| self.poison(e))? {
            total += elem.len as u64;
        }

        Ok(total)
    }

    /// Return the descriptor under `cursor` and step to the next one.
    ///
    /// Returns `None` once the chain is exhausted. Never frees anything.
    pub fn gather_available(
        &self,
        cursor: &mut ChainCursor,
    ) -> Result<Option<BufferElement>, RingError> {
        self.check()?;
        self.step(cursor).map_err(|e| self.poison(e))
    }

    /// Iterate over the rest of the chain under `cursor`.
    pub fn gather<'a>(&'a self, cursor: &'a mut ChainCursor) -> Gather<'a, M, N> {
        Gather {
            queue: self,
            cursor,
            done: false,
        }
    }

    /// Hand the chain under `cursor` back to the driver with `len` bytes.
    ///
    /// Takes the cursor by value: once published, the chain belongs to the
    /// driver again. Fails with [`RingError::InvalidState`] for a head that is
    /// not in flight.
    pub fn publish_used(&mut self, cursor: ChainCursor, len: u32) -> Result<(), RingError> {
        self.check()?;

        let head = cursor.first().ok_or(RingError::EmptyChain)?;
        if !self.consumed.contains(head as usize) {
            return Err(RingError::InvalidState);
        }

        let elem = UsedElem {
            id: head as u32,
            len,
        };
        self.mem
            .write_val(self.used.slot_addr(self.used_idx), elem)
            .map_err(|_| RingError::MemError)?;

        let next = self.used_idx.wrapping_add(1);
        self.mem
            .store_release(self.used.idx_addr(), next)
            .map_err(|_| RingError::MemError)?;

        self.used_idx = next;
        self.consumed.set(head as usize, false);
        self.inflight -= 1;
        Ok(())
    }

    /// Has the driver published chains we have not consumed yet?
    pub fn poll(&self) -> Result<bool, RingError> {
        self.check()?;
        let shared = self.load_avail_idx()?;
        let pending =
            pending_entries(shared, self.next_avail, self.ring_len).map_err(|e| self.poison(e))?;
        Ok(pending > 0)
    }

    /// Signal the driver unconditionally.
    pub fn notify(&self) {
        self.notifier.notify(self.stats());
    }

    /// Signal the driver unless it asked not to be notified.
    pub fn kick(&self) -> Result<bool, RingError> {
        self.check()?;
        self.mem.fence();

        let flags = EventFlags::read_acquire(&self.mem, self.avail.flags_addr())?;
        if flags.wants_notification() {
            self.notify();
            return Ok(true);
        }

        Ok(false)
    }

    /// Ask the driver not to notify us about new chains.
    pub fn disable_avail_notifications(&mut self) -> Result<(), RingError> {
        self.check()?;
        if self.event_flags_shadow.contains(EventFlags::NO_NOTIFY) {
            return Ok(());
        }

        EventFlags::NO_NOTIFY.write_release(&self.mem, self.used.flags_addr())?;
        self.event_flags_shadow = EventFlags::NO_NOTIFY;
        log::debug!("virtqueue device: avail notifications disabled");
        Ok(())
    }

    /// Ask the driver to notify us again. Returns whether chains arrived in the
    /// meantime.
    pub fn enable_avail_notifications(&mut self) -> Result<bool, RingError> {
        self.check()?;
        if !self.event_flags_shadow.is_empty() {
            EventFlags::empty().write_release(&self.mem, self.used.flags_addr())?;
            self.event_flags_shadow = EventFlags::empty();
            log::debug!("virtqueue device: avail notifications enabled");
        }

        self.mem.fence();
        self.poll()
    }

    /// Chains consumed and not yet completed.
    #[inline]
    pub fn num_inflight(&self) -> usize {
        self.inflight
    }

    /// Descriptor table capacity (DESC_CAPACITY).
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn mem(&self) -> &M {
        &self.mem
    }

    #[inline]
    pub fn is_broken(&self) -> bool {
        self.broken.get()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            num_free: (self.ring_len as usize).saturating_sub(self.inflight),
            num_inflight: self.inflight,
        }
    }

    fn step(&self, cursor: &mut ChainCursor) -> Result<Option<BufferElement>, RingError> {
        let Some(idx) = cursor.current() else {
            return Ok(None);
        };

        let desc = self.table.read(&self.mem, idx)?;
        let next = self.table.link(desc.next)?;

        if desc.is_next() != next.is_some() {
            return Err(RingError::BadChain);
        }

        if let Some(region) = &self.region {
            region.check(desc.addr, desc.len)?;
        }

        cursor.advance(next, self.table.len())?;
        Ok(Some(BufferElement::from(&desc)))
    }

    fn load_avail_idx(&self) -> Result<u16, RingError> {
        self.mem
            .load_acquire(self.avail.idx_addr())
            .map_err(|_| RingError::MemError)
    }

    fn check(&self) -> Result<(), RingError> {
        if self.broken.get() {
            return Err(RingError::Broken);
        }
        Ok(())
    }

    fn poison(&self, err: RingError) -> RingError {
        if err.is_fatal() && !self.broken.replace(true) {
            log::error!("virtqueue device disabled: {err}");
        }
        err
    }
}

/// Iterator returned by [`DeviceQueue::gather`].
///
/// Yields every remaining buffer of a chain and stops after the first error.
pub struct Gather<'a, M, N> {
    queue: &'a DeviceQueue<M, N>,
    cursor: &'a mut ChainCursor,
    done: bool,
}

impl<M: MemOps, N: Notifier> Iterator for Gather<'_, M, N> {
    type Item = Result<BufferElement, RingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.queue.gather_available(self.cursor) {
            Ok(Some(elem)) => Some(Ok(elem)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::testutil::*;
    use crate::{DescFlags, Descriptor};

    /// Publish `head` in the available ring the way a (possibly hostile) driver would.
    fn push_avail(q: &OwnedQueue, head: u16) {
        let avail = q.avail();
        let idx = q.avail_idx();
        q.mem().write_val(avail.slot_addr(idx), head).unwrap();
        q.mem().store_release(avail.idx_addr(), idx.wrapping_add(1)).unwrap();
    }

    fn device(q: &OwnedQueue) -> TestDevice {
        DeviceQueue::new(q.layout(), q.mem(), CountingNotifier::default()).unwrap()
    }

    #[test]
    fn gathers_chain_in_order() {
        let q = OwnedQueue::new(8, 8, 4096);
        let (mut driver, mut device, _, _) = make_pair(&q);
        let base = q.data().base();
        let elems = [
            BufferElement::readable(base, 3),
            BufferElement::readable(base + 16, 5),
            BufferElement::writable(base + 32, 7),
        ];
        driver.submit(&elems).unwrap();

        let mut cursor = device.consume_available().unwrap().unwrap();
        assert_eq!(device.chain_total_length(&cursor).unwrap(), 15);
        // sizing the chain does not move the cursor
        assert_eq!(cursor.steps(), 0);

        let got = device
            .gather(&mut cursor)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(got, elems);
        assert!(cursor.is_exhausted());
        assert_eq!(device.gather_available(&mut cursor).unwrap(), None);
    }

    #[test]
    fn consume_without_progress_is_a_no_op() {
        let q = OwnedQueue::new(4, 4, 4096);
        let (_driver, mut device, _, _) = make_pair(&q);
        assert!(device.consume_available().unwrap().is_none());
        assert!(!device.poll().unwrap());
        assert_eq!(device.num_inflight(), 0);
    }

    #[test]
    fn publish_used_needs_a_consumed_chain() {
        let q = OwnedQueue::new(4, 4, 4096);
        let (mut driver, mut device, _, _) = make_pair(&q);
        assert_eq!(
            device.publish_used(ChainCursor::EMPTY, 0),
            Err(RingError::EmptyChain)
        );

        let head = driver
            .submit(&[BufferElement::readable(q.data().base(), 1)])
            .unwrap();
        let cursor = device.consume_available().unwrap().unwrap();
        device.publish_used(cursor, 1).unwrap();
        assert_eq!(
            device.publish_used(ChainCursor::at(head), 1),
            Err(RingError::InvalidState)
        );
        assert_eq!(q.used_idx(), 1);
    }

    #[test]
    fn each_chain_is_published_once() {
        let q = OwnedQueue::new(4, 4, 4096);
        let (mut driver, mut device, _, _) = make_pair(&q);
        let base = q.data().base();

        let h1 = driver.submit(&[BufferElement::readable(base, 1)]).unwrap();
        let h2 = driver.submit(&[BufferElement::readable(base, 2)]).unwrap();
        let c1 = device.consume_available().unwrap().unwrap();
        let c2 = device.consume_available().unwrap().unwrap();
        assert_eq!(device.num_inflight(), 2);

        device.publish_used(c1, 0).unwrap();
        // with another chain still in flight, h1 must not be returned twice
        assert_eq!(
            device.publish_used(ChainCursor::at(h1), 0),
            Err(RingError::InvalidState)
        );
        assert_eq!(q.used_idx(), 1);
        assert_eq!(device.num_inflight(), 1);

        device.publish_used(c2, 0).unwrap();

        let mut ids = Vec::new();
        while let Some(mut used) = driver.consume_used().unwrap() {
            ids.push(used.id);
            driver.reclaim(&mut used.cursor).unwrap();
        }
        assert_eq!(ids, [h1, h2]);
        assert!(!driver.is_broken());
        assert_eq!(driver.num_free(), 4);
    }

    #[test]
    fn head_republished_while_in_flight_poisons() {
        let q = OwnedQueue::new(4, 4, 4096);
        let mut device = device(&q);
        q.write_desc(1, Descriptor::new(q.data().base(), 1, DescFlags::empty(), 4));
        push_avail(&q, 1);
        push_avail(&q, 1);

        let cursor = device.consume_available().unwrap().unwrap();
        assert_eq!(device.consume_available(), Err(RingError::BadChain));
        assert!(device.is_broken());
        assert_eq!(device.publish_used(cursor, 0), Err(RingError::Broken));
    }

    #[test]
    fn head_out_of_range_poisons() {
        let q = OwnedQueue::new(4, 4, 4096);
        let mut device = device(&q);
        push_avail(&q, 4);

        assert_eq!(device.consume_available(), Err(RingError::BadChain));
        assert!(device.is_broken());
        assert_eq!(device.consume_available(), Err(RingError::Broken));
        assert_eq!(device.poll(), Err(RingError::Broken));
    }

    #[test]
    fn cycle_is_caught() {
        let q = OwnedQueue::new(4, 4, 4096);
        let mut device = device(&q);
        let base = q.data().base();
        q.write_desc(0, Descriptor::new(base, 1, DescFlags::NEXT, 1));
        q.write_desc(1, Descriptor::new(base, 1, DescFlags::NEXT, 0));
        push_avail(&q, 0);

        let mut cursor = device.consume_available().unwrap().unwrap();
        assert_eq!(
            device.chain_total_length(&cursor),
            Err(RingError::BadChain)
        );
        assert_eq!(
            device.gather_available(&mut cursor),
            Err(RingError::Broken)
        );
    }

    #[test]
    fn cycle_is_caught_while_gathering() {
        let q = OwnedQueue::new(4, 4, 4096);
        let mut device = device(&q);
        let base = q.data().base();
        q.write_desc(2, Descriptor::new(base, 1, DescFlags::NEXT, 2));
        push_avail(&q, 2);

        let mut cursor = device.consume_available().unwrap().unwrap();
        let results = device.gather(&mut cursor).collect::<Vec<_>>();
        assert_eq!(results.len(), 4);
        assert_eq!(results.last(), Some(&Err(RingError::BadChain)));
        assert!(device.is_broken());
    }

    #[test]
    fn next_out_of_range_poisons() {
        let q = OwnedQueue::new(4, 4, 4096);
        let mut device = device(&q);
        q.write_desc(0, Descriptor::new(q.data().base(), 1, DescFlags::NEXT, 9));
        push_avail(&q, 0);

        let mut cursor = device.consume_available().unwrap().unwrap();
        assert_eq!(
            device.gather_available(&mut cursor),
            Err(RingError::BadChain)
        );
    }

    #[test]
    fn next_flag_must_agree_with_link() {
        let q = OwnedQueue::new(4, 4, 4096);
        let mut device = device(&q);
        let base = q.data().base();

        // NEXT set but link is SENTINEL
        q.write_desc(0, Descriptor::new(base, 1, DescFlags::NEXT, 4));
        push_avail(&q, 0);
        let mut cursor = device.consume_available().unwrap().unwrap();
        assert_eq!(
            device.gather_available(&mut cursor),
            Err(RingError::BadChain)
        );

        // link without NEXT
        let mut device = self::device(&q);
        q.write_desc(1, Descriptor::new(base, 1, DescFlags::empty(), 2));
        push_avail(&q, 1);
        // fresh device starts at counter 0, skip the first entry
        device.consume_available().unwrap().unwrap();
        let mut cursor = device.consume_available().unwrap().unwrap();
        assert_eq!(cursor.first(), Some(1));
        assert_eq!(
            device.gather_available(&mut cursor),
            Err(RingError::BadChain)
        );
    }

    #[test]
    fn buffers_outside_region_are_rejected() {
        let q = OwnedQueue::new(4, 4, 4096);
        let (mut driver, mut device, _, _) = make_pair(&q);
        device.restrict_buffers(q.data());
        let base = q.data().base();

        driver
            .submit(&[BufferElement::readable(base + 4000, 96)])
            .unwrap();
        let mut cursor = device.consume_available().unwrap().unwrap();
        assert!(device.gather_available(&mut cursor).unwrap().is_some());

        // a descriptor pointing at the ring itself
        driver.submit(&[BufferElement::writable(0, 16)]).unwrap();
        let mut cursor = device.consume_available().unwrap().unwrap();
        assert_eq!(
            device.gather_available(&mut cursor),
            Err(RingError::BufferOutOfBounds { addr: 0, len: 16 })
        );
        assert!(device.is_broken());
    }

    #[test]
    fn avail_index_jump_poisons() {
        let q = OwnedQueue::new(4, 4, 4096);
        let device = device(&q);
        q.mem().store_release(q.avail().idx_addr(), 9).unwrap();

        assert_eq!(
            device.poll(),
            Err(RingError::BadIndex {
                idx: 9,
                expected: 0
            })
        );
        assert!(device.is_broken());
    }

    #[test]
    fn kick_honors_driver_suppression() {
        let q = OwnedQueue::new(4, 4, 4096);
        let (mut driver, mut device, _, to_driver) = make_pair(&q);

        assert!(device.kick().unwrap());
        driver.disable_used_notifications().unwrap();
        assert!(!device.kick().unwrap());
        assert_eq!(to_driver.count(), 1);

        driver.enable_used_notifications().unwrap();
        assert!(device.kick().unwrap());
        assert_eq!(to_driver.count(), 2);

        device.disable_avail_notifications().unwrap();
        driver
            .submit(&[BufferElement::readable(q.data().base(), 1)])
            .unwrap();
        assert!(device.enable_avail_notifications().unwrap());
    }
}
