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

//! Split Virtqueue Implementation
//!
//! A zero-copy, lock-free, single-producer/single-consumer transport that lets two
//! mutually distrusting execution contexts exchange scatter-gather buffers through a
//! fixed region of shared memory and a one-way notification primitive.
//!
//! # Architecture
//!
//! The shared region holds three areas (see [`Layout`]):
//!
//! - **Descriptor table**: `DESC_CAPACITY` [`Descriptor`]s linked into chains through
//!   their `next` field. Only the driver allocates and frees descriptors.
//! - **Available ring**: chain heads published by the driver to the device.
//! - **Used ring**: `(head, length)` completions published by the device to the driver.
//!
//! The two roles get two distinct handles, so it is a compile-time error for
//! device code to allocate or free descriptors:
//!
//! - [`DriverQueue`]: owns the [`DescAllocator`], builds chains with a
//!   [`ChainBuilder`], consumes the used ring and reclaims descriptors.
//! - [`DeviceQueue`]: consumes the available ring, walks chains read-only with a
//!   [`ChainCursor`] and publishes completions.
//!
//! On top of the ring sits a copying channel ([`VirtqProducer`], [`VirtqConsumer`])
//! that moves byte payloads through a [`BufferPool`].
//!
//! # Quick Start
//!
//! ```ignore
//! // driver
//! let mut chain = driver.chain();
//! chain.publish_available(req_addr, req_len, DescFlags::empty())?;
//! chain.publish_available(resp_addr, resp_len, DescFlags::WRITE)?;
//! chain.commit()?;
//! driver.kick()?;
//!
//! // device
//! while let Some(mut cursor) = device.consume_available()? {
//!     let total = device.chain_total_length(&cursor)?;
//!     while let Some(elem) = device.gather_available(&mut cursor)? {
//!         handle(elem);
//!     }
//!     device.publish_used(cursor, written)?;
//! }
//! device.kick()?;
//!
//! // driver
//! while let Some(used) = driver.consume_used()? {
//!     let mut cursor = used.cursor;
//!     while let Some(elem) = driver.gather_used(&mut cursor)? {
//!         recycle(elem);
//!     }
//! }
//! ```
//!
//! # Memory Ordering
//!
//! Each shared index has exactly one writer. Descriptor and ring-slot contents are
//! written with plain stores and then exposed by a release store of the index; the
//! consumer acquire-loads the index before reading anything it exposes. No
//! read-modify-write operation is ever performed on shared memory.

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

mod access;
mod channel;
mod cursor;
mod desc;
mod device;
mod driver;
mod event;
mod layout;
mod pool;

pub use access::*;
pub use channel::*;
pub use cursor::*;
pub use desc::*;
pub use device::*;
pub use driver::*;
pub use event::*;
pub use layout::*;
pub use pool::*;
use thiserror::Error;

/// A trait for signalling the peer that new work was published.
///
/// The doorbell itself (an interrupt, an IPC send, an event fd) is outside this
/// crate; implementations are fire-and-forget. Any closure taking [`QueueStats`]
/// is a notifier, which is how per-queue context is attached.
pub trait Notifier {
    fn notify(&self, stats: QueueStats);
}

impl<F: Fn(QueueStats)> Notifier for F {
    fn notify(&self, stats: QueueStats) {
        self(stats)
    }
}

/// Statistics about the current queue state.
///
/// Provided to the [`Notifier`] when sending notifications, allowing
/// the notifier to make decisions based on queue pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Number of free slots: descriptors on the driver side, ring entries on the device side.
    pub num_free: usize,
    /// Number of descriptors (driver) or chains (device) currently in flight.
    pub num_inflight: usize,
}

/// Errors reported by ring operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("Descriptor table is full")]
    WouldBlock,
    #[error("Buffer chain is empty")]
    EmptyChain,
    #[error("Buffer chain is malformed")]
    BadChain,
    #[error("Peer published index {idx} while {expected} was expected")]
    BadIndex { idx: u16, expected: u16 },
    #[error("Peer returned descriptor {0} which is not an outstanding chain head")]
    BadId(u32),
    #[error("Buffer {addr:#x}+{len} lies outside the registered data region")]
    BufferOutOfBounds { addr: u64, len: u32 },
    #[error("Invalid state")]
    InvalidState,
    #[error("Invalid memory layout")]
    InvalidLayout,
    #[error("Backend memory error")]
    MemError,
    #[error("Queue disabled after a previous fatal error")]
    Broken,
}

impl RingError {
    /// Errors caused by malformed shared state. Reporting one of these poisons
    /// the handle that observed it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RingError::BadChain
                | RingError::BadIndex { .. }
                | RingError::BadId(_)
                | RingError::BufferOutOfBounds { .. }
                | RingError::Broken
        )
    }
}
