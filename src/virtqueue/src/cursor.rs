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

//! Chain cursor: role-local position within one descriptor chain.
//!
//! ```text
//!   EMPTY ──build/consume──> BUILDING / TRAVERSING ──walk past tail──> EXHAUSTED
//! ```

use crate::RingError;

/// Local, never shared, position within one descriptor chain.
///
/// `None` stands for SENTINEL. Cursors only come out of
/// [`DeviceQueue::consume_available`](crate::DeviceQueue::consume_available),
/// [`DriverQueue::consume_used`](crate::DriverQueue::consume_used) or a
/// [`ChainBuilder`](crate::ChainBuilder), so a cursor always refers to a chain
/// that role has actually dequeued or built. Not `Clone`: a used-ring cursor
/// frees its chain exactly once.
#[derive(Debug, PartialEq, Eq, Default)]
pub struct ChainCursor {
    first: Option<u16>,
    cur: Option<u16>,
    steps: u32,
}

impl ChainCursor {
    /// The empty cursor: `first == cur == SENTINEL`.
    pub const EMPTY: Self = Self {
        first: None,
        cur: None,
        steps: 0,
    };

    /// A cursor positioned at the head of the chain starting at `head`.
    pub(crate) fn at(head: u16) -> Self {
        Self {
            first: Some(head),
            cur: Some(head),
            steps: 0,
        }
    }

    /// Head of the chain, or None for an empty cursor.
    #[inline]
    pub fn first(&self) -> Option<u16> {
        self.first
    }

    /// The descriptor the next gather will return.
    #[inline]
    pub(crate) fn current(&self) -> Option<u16> {
        self.cur
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Has a walk gone past the tail of the chain?
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.first.is_some() && self.cur.is_none()
    }

    /// Number of descriptors stepped over so far.
    #[inline]
    pub fn steps(&self) -> u32 {
        self.steps
    }

    /// Record the first descriptor of a chain under construction.
    pub(crate) fn start(&mut self, head: u16) {
        debug_assert!(self.is_empty());
        *self = Self {
            first: Some(head),
            cur: Some(head),
            steps: 1,
        };
    }

    /// Record `idx` as the new tail of a chain under construction.
    pub(crate) fn extend(&mut self, idx: u16) {
        self.cur = Some(idx);
        self.steps += 1;
    }

    /// Step to `next`, refusing to walk more than `limit` descriptors.
    pub(crate) fn advance(&mut self, next: Option<u16>, limit: usize) -> Result<(), RingError> {
        self.steps += 1;
        if self.steps as usize > limit || (next.is_some() && self.steps as usize >= limit) {
            return Err(RingError::BadChain);
        }
        self.cur = next;
        Ok(())
    }

    /// Back to EMPTY.
    pub fn reset(&mut self) {
        *self = Self::EMPTY;
    }
}
