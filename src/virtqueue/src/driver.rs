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

//! Driver role: owns the descriptors, produces the available ring and
//! consumes the used ring.
//!
//! # Lifecycle
//!
//! 1. Build: [`DriverQueue::chain`] returns a [`ChainBuilder`]; every
//!    [`ChainBuilder::publish_available`] allocates and links one descriptor.
//! 2. Commit: [`ChainBuilder::commit`] writes the chain head into the available
//!    ring and release-stores `avail.idx`. Nothing is visible to the device before
//!    this point, and dropping an uncommitted builder frees its descriptors.
//! 3. Notify: [`DriverQueue::kick`] signals the device unless it suppressed
//!    notifications.
//! 4. Reclaim: [`DriverQueue::consume_used`] dequeues a completion and
//!    [`DriverQueue::gather_used`] walks the chain, returning each descriptor to
//!    the free list.

use fixedbitset::FixedBitSet;

use super::access::MemOps;
use super::cursor::ChainCursor;
use super::desc::{BufferElement, DescAllocator, DescFlags};
use super::event::EventFlags;
use super::layout::{AvailRing, Layout, UsedElem, UsedRing, pending_entries};
use crate::{Notifier, QueueStats, RingError};

/// A completion dequeued from the used ring.
#[derive(Debug, PartialEq, Eq)]
pub struct UsedBuffer {
    /// Head of the completed chain, as returned by [`ChainBuilder::commit`].
    pub id: u16,
    /// Length reported by the device.
    pub len: u32,
    /// Cursor for reclaiming the chain with [`DriverQueue::gather_used`].
    pub cursor: ChainCursor,
}

/// The driver half of a split virtqueue.
#[derive(Debug)]
pub struct DriverQueue<M, N> {
    mem: M,
    notifier: N,
    alloc: DescAllocator,
    avail: AvailRing,
    used: UsedRing,
    ring_len: u16,
    /// Our own `avail.idx`, the last value published to the device.
    avail_idx: u16,
    /// Next used counter value we expect the device to publish.
    next_used: u16,
    /// Heads published and not yet returned by the device.
    outstanding: FixedBitSet,
    /// Heads returned by the device and not yet fully reclaimed.
    returned: FixedBitSet,
    event_flags_shadow: EventFlags,
    broken: bool,
}

impl<M: MemOps, N: Notifier> DriverQueue<M, N> {
    /// Create the driver half and reset the available ring header.
    ///
    /// The caller keeps ownership of the memory; `mem` is only an accessor.
    pub fn new(layout: Layout, mem: M, notifier: N) -> Result<Self, RingError> {
        layout.validate()?;

        let avail = AvailRing::new(&layout);
        let size = layout.desc_table_len as usize;

        EventFlags::empty().write_release(&mem, avail.flags_addr())?;
        mem.store_release(avail.idx_addr(), 0)
            .map_err(|_| RingError::MemError)?;

        Ok(Self {
            alloc: DescAllocator::new(layout.desc_table()),
            avail,
            used: UsedRing::new(&layout),
            ring_len: layout.ring_len,
            avail_idx: 0,
            next_used: 0,
            outstanding: FixedBitSet::with_capacity(size),
            returned: FixedBitSet::with_capacity(size),
            event_flags_shadow: EventFlags::empty(),
            broken: false,
            mem,
            notifier,
        })
    }

    /// Start building a new chain.
    pub fn chain(&mut self) -> ChainBuilder<'_, M, N> {
        ChainBuilder {
            queue: self,
            cursor: ChainCursor::EMPTY,
        }
    }

    /// Build and commit a whole chain in one call.
    ///
    /// Fails with [`RingError::WouldBlock`] without touching anything if there
    /// are fewer free descriptors than `elems`.
    pub fn submit(&mut self, elems: &[BufferElement]) -> Result<u16, RingError> {
        self.check()?;

        if elems.is_empty() {
            return Err(RingError::EmptyChain);
        }

        if elems.len() > self.num_free() {
            return Err(RingError::WouldBlock);
        }

        let mut chain = self.chain();
        for elem in elems {
            chain.publish_available(elem.addr, elem.len, elem.flags)?;
        }
        chain.commit()
    }

    /// Dequeue the next completion, if the device published one.
    ///
    /// The returned cursor must be walked with [`gather_used`](Self::gather_used)
    /// (or handed to [`reclaim`](Self::reclaim)) to free the chain.
    pub fn consume_used(&mut self) -> Result<Option<UsedBuffer>, RingError> {
        self.check()?;

        let shared = self.load_used_idx()?;
        let pending =
            pending_entries(shared, self.next_used, self.ring_len).map_err(|e| self.poison(e))?;

        if pending == 0 {
            return Ok(None);
        }

        let elem: UsedElem = self
            .mem
            .read_val(self.used.slot_addr(self.next_used))
            .map_err(|_| RingError::MemError)?;

        let id = match u16::try_from(elem.id) {
            Ok(id) if self.outstanding.contains(id as usize) => id,
            _ => return Err(self.poison(RingError::BadId(elem.id))),
        };

        self.next_used = self.next_used.wrapping_add(1);
        self.outstanding.set(id as usize, false);
        self.returned.insert(id as usize);

        Ok(Some(UsedBuffer {
            id,
            len: elem.len,
            cursor: ChainCursor::at(id),
        }))
    }

    /// Free the descriptor under `cursor` and step to the next one.
    ///
    /// The head descriptor stays allocated until the tail has been gathered.
    /// Returns `None` once the whole chain is back on the free list. The walk
    /// follows the driver's private copy of the chain, never the shared table.
    pub fn gather_used(
        &mut self,
        cursor: &mut ChainCursor,
    ) -> Result<Option<BufferElement>, RingError> {
        self.check()?;

        let (Some(head), Some(cur)) = (cursor.first(), cursor.current()) else {
            return Ok(None);
        };

        if !self.returned.contains(head as usize) {
            return Err(RingError::InvalidState);
        }

        // The head is freed last. Until then it cannot be handed out to a new
        // chain, so its `returned` bit stays ours.
        let (elem, next) = match cur == head {
            true => self.alloc.peek(cur)?,
            false => self.alloc.release(cur)?,
        };
        cursor.advance(next, self.alloc.table().len())?;

        if next.is_none() {
            self.alloc.release(head)?;
            self.returned.set(head as usize, false);
        }

        Ok(Some(elem))
    }

    /// Free an entire returned chain, returning how many descriptors it held.
    pub fn reclaim(&mut self, cursor: &mut ChainCursor) -> Result<usize, RingError> {
        let mut count = 0;
        while self.gather_used(cursor)?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Has the device published completions we have not consumed yet?
    pub fn poll(&mut self) -> Result<bool, RingError> {
        self.check()?;
        let shared = self.load_used_idx()?;
        let pending =
            pending_entries(shared, self.next_used, self.ring_len).map_err(|e| self.poison(e))?;
        Ok(pending > 0)
    }

    /// Signal the device unconditionally.
    pub fn notify(&self) {
        self.notifier.notify(self.stats());
    }

    /// Signal the device unless it asked not to be notified.
    ///
    /// Returns whether the notifier was called.
    pub fn kick(&self) -> Result<bool, RingError> {
        self.check()?;
        self.mem.fence();

        let flags = EventFlags::read_acquire(&self.mem, self.used.flags_addr())?;
        if flags.wants_notification() {
            self.notify();
            return Ok(true);
        }

        Ok(false)
    }

    /// Ask the device not to notify us about completions.
    pub fn disable_used_notifications(&mut self) -> Result<(), RingError> {
        self.check()?;
        if self.event_flags_shadow.contains(EventFlags::NO_NOTIFY) {
            return Ok(());
        }

        EventFlags::NO_NOTIFY.write_release(&self.mem, self.avail.flags_addr())?;
        self.event_flags_shadow = EventFlags::NO_NOTIFY;
        log::debug!("virtqueue driver: used notifications disabled");
        Ok(())
    }

    /// Ask the device to notify us about completions again.
    ///
    /// Returns whether completions arrived while notifications were off; those
    /// will not be signalled and must be consumed now.
    pub fn enable_used_notifications(&mut self) -> Result<bool, RingError> {
        self.check()?;
        if !self.event_flags_shadow.is_empty() {
            EventFlags::empty().write_release(&self.mem, self.avail.flags_addr())?;
            self.event_flags_shadow = EventFlags::empty();
            log::debug!("virtqueue driver: used notifications enabled");
        }

        self.mem.fence();
        self.poll()
    }

    /// Number of free descriptors.
    #[inline]
    pub fn num_free(&self) -> usize {
        self.alloc.num_free()
    }

    /// Number of descriptors that are not on the free list.
    #[inline]
    pub fn num_inflight(&self) -> usize {
        self.len() - self.num_free()
    }

    /// Descriptor table capacity (DESC_CAPACITY).
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.alloc.table().len()
    }

    #[inline]
    pub fn mem(&self) -> &M {
        &self.mem
    }

    /// Has a malformed completion disabled this queue?
    #[inline]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            num_free: self.num_free(),
            num_inflight: self.num_inflight(),
        }
    }

    fn load_used_idx(&self) -> Result<u16, RingError> {
        self.mem
            .load_acquire(self.used.idx_addr())
            .map_err(|_| RingError::MemError)
    }

    /// Publish a fully built chain.
    fn commit_chain(&mut self, head: u16) -> Result<(), RingError> {
        self.mem
            .write_val(self.avail.slot_addr(self.avail_idx), head)
            .map_err(|_| RingError::MemError)?;

        let next = self.avail_idx.wrapping_add(1);
        self.mem
            .store_release(self.avail.idx_addr(), next)
            .map_err(|_| RingError::MemError)?;

        self.avail_idx = next;
        self.outstanding.insert(head as usize);
        Ok(())
    }

    fn check(&self) -> Result<(), RingError> {
        if self.broken {
            return Err(RingError::Broken);
        }
        Ok(())
    }

    fn poison(&mut self, err: RingError) -> RingError {
        if err.is_fatal() && !self.broken {
            self.broken = true;
            log::error!("virtqueue driver disabled: {err}");
        }
        err
    }
}

/// A chain under construction.
///
/// Holds the driver mutably, so the device cannot be notified about a
/// half-built chain. Dropping the builder without committing frees every
/// descriptor it allocated.
#[derive(Debug)]
pub struct ChainBuilder<'a, M, N> {
    queue: &'a mut DriverQueue<M, N>,
    cursor: ChainCursor,
}

impl<M: MemOps, N: Notifier> ChainBuilder<'_, M, N> {
    /// Allocate one descriptor and append it to the chain.
    ///
    /// On [`RingError::WouldBlock`] the chain, the table and the free list are
    /// exactly as they were before the call.
    pub fn publish_available(
        &mut self,
        addr: u64,
        len: u32,
        flags: DescFlags,
    ) -> Result<u16, RingError> {
        self.queue.check()?;

        let elem = BufferElement::new(addr, len, flags);
        let idx = self
            .queue
            .alloc
            .allocate(&self.queue.mem, elem, self.cursor.current())?;

        if self.cursor.is_empty() {
            self.cursor.start(idx);
        } else {
            self.cursor.extend(idx);
        }

        Ok(idx)
    }

    /// The chain built so far.
    pub fn cursor(&self) -> &ChainCursor {
        &self.cursor
    }

    /// Number of descriptors in the chain.
    pub fn len(&self) -> usize {
        self.cursor.steps() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.is_empty()
    }

    /// Make the chain visible to the device and return its head.
    pub fn commit(mut self) -> Result<u16, RingError> {
        self.queue.check()?;
        let head = self.cursor.first().ok_or(RingError::EmptyChain)?;
        self.queue.commit_chain(head)?;
        self.cursor.reset();
        Ok(head)
    }

    /// Discard the chain, freeing its descriptors.
    pub fn abort(self) {}
}

impl<M, N> Drop for ChainBuilder<'_, M, N> {
    fn drop(&mut self) {
        let mut cur = self.cursor.first();
        while let Some(idx) = cur {
            match self.queue.alloc.release(idx) {
                Ok((_, next)) => cur = next,
                Err(_) => break,
            }
        }
    }
}
