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

//! Copying request/response channel on top of the two queue roles.
//!
//! A [`VirtqProducer`] copies each request into a pool buffer, optionally adds a
//! device-writable response buffer and publishes the pair as one chain. A
//! [`VirtqConsumer`] copies the request out, and later scatters the response into
//! the writable buffers and completes the chain. A node of a switch talks to its
//! peer through two such channels, one per direction.

use alloc::vec;
use alloc::vec::Vec;

use bytes::Bytes;
use smallvec::SmallVec;
use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use super::access::{BufferRegion, MemOps};
use super::cursor::ChainCursor;
use super::desc::{BufferElement, DescFlags};
use super::device::DeviceQueue;
use super::driver::DriverQueue;
use super::layout::Layout;
use super::pool::{AllocError, AllocGuard, Allocation, BufferProvider};
use crate::{Notifier, RingError};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtqError {
    #[error("Ring error: {0}")]
    Ring(#[from] RingError),
    #[error("Allocation error: {0}")]
    Alloc(#[from] AllocError),
    #[error("Invalid token")]
    BadToken,
    #[error("Request too large")]
    ReqTooLarge,
    #[error("Response too large for the buffer provided by the driver")]
    RespTooLarge,
    #[error("Internal state error")]
    InvalidState,
    #[error("Memory read error")]
    MemoryReadError,
    #[error("Memory write error")]
    MemoryWriteError,
}

/// Correlates a request with its response; the head index of the chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Token(pub u16);

/// A request received by the consumer.
#[derive(Debug)]
pub struct Request {
    /// Pass to [`VirtqConsumer::complete`].
    pub token: Token,
    /// Request payload.
    pub data: Bytes,
    /// Bytes the driver made available for the response.
    pub resp_cap: usize,
}

/// A response received by the producer.
#[derive(Debug)]
pub struct Response {
    pub token: Token,
    /// Response payload, `written` bytes long.
    pub data: Bytes,
    /// Number of bytes the device reported.
    pub written: usize,
}

#[derive(Debug, Clone, Copy)]
struct ProducerInflight {
    req: Option<Allocation>,
    resp: Option<Allocation>,
    resp_cap: usize,
}

/// Driver side of a channel.
pub struct VirtqProducer<M, N, P> {
    queue: DriverQueue<M, N>,
    pool: P,
    inflight: Vec<Option<ProducerInflight>>,
}

impl<M, N, P> VirtqProducer<M, N, P>
where
    M: MemOps,
    N: Notifier,
    P: BufferProvider + Clone,
{
    /// Create a producer. `pool` hands out buffers inside memory reachable
    /// through `mem`.
    pub fn new(layout: Layout, mem: M, notifier: N, pool: P) -> Result<Self, VirtqError> {
        let queue = DriverQueue::new(layout, mem, notifier)?;
        let inflight = vec![None; queue.len()];

        Ok(Self {
            queue,
            pool,
            inflight,
        })
    }

    fn alloc(
        &self,
        size: usize,
    ) -> Result<AllocGuard<impl FnOnce(Allocation) + use<M, N, P>>, VirtqError> {
        let alloc = self.pool.alloc(size)?;
        let pool = self.pool.clone();

        Ok(AllocGuard::new(alloc, move |a| {
            let _ = pool.dealloc(a);
        }))
    }

    /// Send a request and notify the device if it wants to be notified.
    ///
    /// `resp_cap` is the space offered for the response; zero sends a chain with
    /// no writable buffer.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn send(&mut self, req: &[u8], resp_cap: usize) -> Result<Token, VirtqError> {
        let token = self.enqueue(req, resp_cap)?;
        self.queue.kick()?;
        Ok(token)
    }

    /// Publish a request without notifying the device. Follow a batch of
    /// these with [`kick`](Self::kick).
    pub fn enqueue(&mut self, req: &[u8], resp_cap: usize) -> Result<Token, VirtqError> {
        let need = usize::from(!req.is_empty()) + usize::from(resp_cap > 0);
        if need == 0 {
            return Err(RingError::EmptyChain.into());
        }

        if self.queue.num_free() < need {
            return Err(RingError::WouldBlock.into());
        }

        let req_len = u32::try_from(req.len()).map_err(|_| VirtqError::ReqTooLarge)?;
        let resp_len = u32::try_from(resp_cap).map_err(|_| VirtqError::RespTooLarge)?;

        let req_guard = match req.is_empty() {
            true => None,
            false => Some(self.alloc(req.len())?),
        };
        let resp_guard = match resp_cap {
            0 => None,
            _ => Some(self.alloc(resp_cap)?),
        };

        if let Some(guard) = &req_guard
            && let Some(alloc) = guard.allocation()
        {
            self.queue
                .mem()
                .write(alloc.addr, req)
                .map_err(|_| VirtqError::MemoryWriteError)?;
        }

        let mut chain = self.queue.chain();
        if let Some(alloc) = req_guard.as_ref().and_then(AllocGuard::allocation) {
            chain.publish_available(alloc.addr, req_len, DescFlags::empty())?;
        }
        if let Some(alloc) = resp_guard.as_ref().and_then(AllocGuard::allocation) {
            chain.publish_available(alloc.addr, resp_len, DescFlags::WRITE)?;
        }
        let head = chain.commit()?;

        let slot = self
            .inflight
            .get_mut(head as usize)
            .ok_or(VirtqError::InvalidState)?;
        debug_assert!(slot.is_none());

        *slot = Some(ProducerInflight {
            req: req_guard.and_then(AllocGuard::dismiss),
            resp: resp_guard.and_then(AllocGuard::dismiss),
            resp_cap,
        });

        Ok(Token(head))
    }

    /// Notify the device about everything enqueued so far, unless it polls.
    pub fn kick(&self) -> Result<bool, VirtqError> {
        Ok(self.queue.kick()?)
    }

    /// Take one completed response, if any.
    ///
    /// Every descriptor of the chain and both pool buffers are released even
    /// when the device reports more bytes than it was offered; that case is
    /// returned as [`VirtqError::InvalidState`].
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn poll_once(&mut self) -> Result<Option<Response>, VirtqError> {
        let Some(mut used) = self.queue.consume_used()? else {
            return Ok(None);
        };

        self.queue.reclaim(&mut used.cursor)?;

        let inf = self
            .inflight
            .get_mut(used.id as usize)
            .and_then(Option::take)
            .ok_or(VirtqError::InvalidState)?;

        let written = used.len as usize;
        let result = if written > inf.resp_cap {
            Err(VirtqError::InvalidState)
        } else {
            self.read_response(inf.resp, written)
        };

        let freed = [inf.req, inf.resp]
            .into_iter()
            .flatten()
            .map(|alloc| self.pool.dealloc(alloc))
            .fold(Ok(()), Result::and);
        freed?;

        Ok(Some(Response {
            token: Token(used.id),
            data: result?,
            written,
        }))
    }

    fn read_response(&self, resp: Option<Allocation>, written: usize) -> Result<Bytes, VirtqError> {
        let Some(resp) = resp.filter(|_| written > 0) else {
            return Ok(Bytes::new());
        };

        let mut buf = vec![0u8; written];
        self.queue
            .mem()
            .read(resp.addr, &mut buf)
            .map_err(|_| VirtqError::MemoryReadError)?;
        Ok(Bytes::from(buf))
    }

    /// Hand every available response to `f`.
    pub fn drain(&mut self, mut f: impl FnMut(Token, Bytes)) -> Result<(), VirtqError> {
        while let Some(resp) = self.poll_once()? {
            f(resp.token, resp.data);
        }

        Ok(())
    }

    /// Stop the device from notifying us; responses must then be polled.
    pub fn disable_notifications(&mut self) -> Result<(), VirtqError> {
        Ok(self.queue.disable_used_notifications()?)
    }

    /// Re-enable notifications. Returns whether responses are already waiting.
    pub fn enable_notifications(&mut self) -> Result<bool, VirtqError> {
        Ok(self.queue.enable_used_notifications()?)
    }

    /// Number of requests awaiting a response.
    pub fn num_inflight(&self) -> usize {
        self.inflight.iter().flatten().count()
    }

    pub fn queue(&self) -> &DriverQueue<M, N> {
        &self.queue
    }
}

#[derive(Debug)]
struct ConsumerInflight {
    resp: SmallVec<[BufferElement; 4]>,
    resp_cap: usize,
}

/// Device side of a channel.
pub struct VirtqConsumer<M, N> {
    queue: DeviceQueue<M, N>,
    inflight: Vec<Option<ConsumerInflight>>,
    /// Rejected heads whose return to the driver has not been published yet.
    returning: Vec<u16>,
}

impl<M: MemOps, N: Notifier> VirtqConsumer<M, N> {
    pub fn new(layout: Layout, mem: M, notifier: N) -> Result<Self, VirtqError> {
        let queue = DeviceQueue::new(layout, mem, notifier)?;
        let inflight = (0..queue.len()).map(|_| None).collect();

        Ok(Self {
            queue,
            inflight,
            returning: Vec::new(),
        })
    }

    /// Reject every buffer outside `region`.
    pub fn restrict(&mut self, region: BufferRegion) {
        self.queue.restrict_buffers(region);
    }

    /// Take one request, if any.
    ///
    /// A chain that cannot be turned into a request is handed straight back to
    /// the driver with zero bytes written and reported as an error. That covers
    /// readable buffers following a writable one, a payload larger than
    /// `max_req` and request buffers that cannot be read.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn poll_once(&mut self, max_req: usize) -> Result<Option<Request>, VirtqError> {
        self.flush_returning()?;

        let Some(mut cursor) = self.queue.consume_available()? else {
            return Ok(None);
        };
        let head = cursor.first().ok_or(VirtqError::InvalidState)?;

        let (data, resp) = match self.read_request(&mut cursor, max_req) {
            Ok(req) => req,
            Err(err) => {
                self.reject(head)?;
                return Err(err);
            }
        };

        let resp_cap = resp.iter().map(|e| e.len as usize).sum();
        match self.inflight.get_mut(head as usize).filter(|s| s.is_none()) {
            Some(slot) => *slot = Some(ConsumerInflight { resp, resp_cap }),
            None => {
                self.reject(head)?;
                return Err(VirtqError::InvalidState);
            }
        }

        Ok(Some(Request {
            token: Token(head),
            data,
            resp_cap,
        }))
    }

    /// Copy out the readable part of the chain under `cursor` and collect its
    /// writable buffers.
    fn read_request(
        &self,
        cursor: &mut ChainCursor,
        max_req: usize,
    ) -> Result<(Bytes, SmallVec<[BufferElement; 4]>), VirtqError> {
        let mut readable: SmallVec<[BufferElement; 4]> = SmallVec::new();
        let mut writable: SmallVec<[BufferElement; 4]> = SmallVec::new();
        for elem in self.queue.gather(cursor) {
            let elem = elem?;
            match (elem.is_writable(), writable.is_empty()) {
                (true, _) => writable.push(elem),
                (false, true) => readable.push(elem),
                (false, false) => return Err(RingError::BadChain.into()),
            }
        }

        let req_len: u64 = readable.iter().map(|e| e.len as u64).sum();
        if req_len > max_req as u64 {
            return Err(VirtqError::ReqTooLarge);
        }

        let mut buf = vec![0u8; req_len as usize];
        let mut off = 0;
        for elem in &readable {
            let end = off + elem.len as usize;
            self.queue
                .mem()
                .read(elem.addr, &mut buf[off..end])
                .map_err(|_| VirtqError::MemoryReadError)?;
            off = end;
        }

        Ok((Bytes::from(buf), writable))
    }

    /// Return the chain at `head` to the driver with nothing written.
    ///
    /// A poisoned queue publishes nothing more. If the used ring cannot be
    /// written, the head is kept and retried on the next poll.
    fn reject(&mut self, head: u16) -> Result<(), VirtqError> {
        if self.queue.is_broken() {
            return Ok(());
        }

        if let Err(err) = self.queue.publish_used(ChainCursor::at(head), 0) {
            self.returning.push(head);
            return Err(err.into());
        }
        Ok(())
    }

    fn flush_returning(&mut self) -> Result<(), VirtqError> {
        while let Some(&head) = self.returning.last() {
            self.queue.publish_used(ChainCursor::at(head), 0)?;
            self.returning.pop();
        }
        Ok(())
    }

    /// Write `resp` into the driver's response buffers, complete the chain and
    /// notify the driver if it wants to be notified.
    ///
    /// A response that does not fit leaves the request in flight, so it can be
    /// completed again with less data.
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace"))]
    pub fn complete(&mut self, tok: Token, resp: &[u8]) -> Result<(), VirtqError> {
        let slot = self
            .inflight
            .get_mut(tok.0 as usize)
            .ok_or(VirtqError::BadToken)?;

        let inf = slot.as_ref().ok_or(VirtqError::BadToken)?;
        if resp.len() > inf.resp_cap {
            return Err(VirtqError::RespTooLarge);
        }

        let mut rest = resp;
        for elem in &inf.resp {
            if rest.is_empty() {
                break;
            }
            let (chunk, tail) = rest.split_at(rest.len().min(elem.len as usize));
            self.queue
                .mem()
                .write(elem.addr, chunk)
                .map_err(|_| VirtqError::MemoryWriteError)?;
            rest = tail;
        }

        let written = u32::try_from(resp.len()).map_err(|_| VirtqError::RespTooLarge)?;
        self.queue.publish_used(ChainCursor::at(tok.0), written)?;
        *slot = None;
        self.queue.kick()?;
        Ok(())
    }

    /// Stop the driver from notifying us; requests must then be polled.
    pub fn disable_notifications(&mut self) -> Result<(), VirtqError> {
        Ok(self.queue.disable_avail_notifications()?)
    }

    /// Re-enable notifications. Returns whether requests are already waiting.
    pub fn enable_notifications(&mut self) -> Result<bool, VirtqError> {
        Ok(self.queue.enable_avail_notifications()?)
    }

    /// Number of requests taken and not yet completed.
    pub fn num_inflight(&self) -> usize {
        self.queue.num_inflight()
    }

    pub fn queue(&self) -> &DeviceQueue<M, N> {
        &self.queue
    }
}


#[cfg(all(test, loom))]
mod model {
    //! Loom model of the index protocol.
    //!
    //! Every ring index and flags word is a loom atomic, and every other
    //! region (each descriptor, each ring slot, the data area) is a separate
    //! `loom::cell::UnsafeCell`. Loom then reports any plain access that is not
    //! ordered by an acquire/release pair on an index.

    use alloc::collections::BTreeMap;
    use alloc::sync::Arc;
    use core::num::NonZeroU16;

    use loom::cell::UnsafeCell;
    use loom::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
    use loom::thread;

    use super::*;
    use crate::{AvailRing, BufferPool, Descriptor, QueueStats, UsedElem, UsedRing};

    #[derive(Debug)]
    struct MemErr;

    #[derive(Debug, Clone, Copy)]
    enum Region {
        Cell(usize),
        Word(usize),
    }

    struct LoomMem {
        cells: Vec<UnsafeCell<Vec<u8>>>,
        words: Vec<AtomicU16>,
        regions: BTreeMap<u64, (Region, usize)>,
        layout: Layout,
    }

    // SAFETY: every cell access goes through loom, which checks it.
    unsafe impl Sync for LoomMem {}
    // SAFETY: as above.
    unsafe impl Send for LoomMem {}

    impl LoomMem {
        fn new(num_descs: u16, data_base: u64, data_len: usize) -> Self {
            let n = NonZeroU16::new(num_descs).unwrap();
            let layout = Layout::from_base(0, n, n).unwrap();
            let avail = AvailRing::new(&layout);
            let used = UsedRing::new(&layout);

            let mut mem = Self {
                cells: Vec::new(),
                words: Vec::new(),
                regions: BTreeMap::new(),
                layout,
            };

            for i in 0..num_descs as u64 {
                mem.add_cell(layout.desc_table_addr + i * Descriptor::SIZE as u64, Descriptor::SIZE);
            }
            for i in 0..num_descs {
                mem.add_cell(avail.slot_addr(i), 2);
                mem.add_cell(used.slot_addr(i), UsedElem::SIZE);
            }
            for addr in [avail.flags_addr(), avail.idx_addr(), used.flags_addr(), used.idx_addr()] {
                mem.regions.insert(addr, (Region::Word(mem.words.len()), 2));
                mem.words.push(AtomicU16::new(0));
            }
            mem.add_cell(data_base, data_len);
            mem
        }

        fn add_cell(&mut self, addr: u64, size: usize) {
            self.regions.insert(addr, (Region::Cell(self.cells.len()), size));
            self.cells.push(UnsafeCell::new(vec![0u8; size]));
        }

        fn region(&self, addr: u64, len: usize) -> Result<(Region, usize), MemErr> {
            let (&base, &(region, size)) = self.regions.range(..=addr).next_back().ok_or(MemErr)?;
            let off = (addr - base) as usize;
            if off + len > size {
                return Err(MemErr);
            }
            Ok((region, off))
        }

        fn word(&self, addr: u64) -> Result<&AtomicU16, MemErr> {
            match self.region(addr, 2)? {
                (Region::Word(i), 0) => Ok(&self.words[i]),
                _ => Err(MemErr),
            }
        }
    }

    impl MemOps for LoomMem {
        type Error = MemErr;

        fn read(&self, addr: u64, dst: &mut [u8]) -> Result<usize, Self::Error> {
            let (Region::Cell(i), off) = self.region(addr, dst.len())? else {
                return Err(MemErr);
            };
            // SAFETY: loom checks the access against concurrent writers.
            self.cells[i].with(|buf| dst.copy_from_slice(&unsafe { &*buf }[off..off + dst.len()]));
            Ok(dst.len())
        }

        fn write(&self, addr: u64, src: &[u8]) -> Result<usize, Self::Error> {
            let (Region::Cell(i), off) = self.region(addr, src.len())? else {
                return Err(MemErr);
            };
            // SAFETY: loom checks the access against concurrent readers.
            self.cells[i]
                .with_mut(|buf| (unsafe { &mut *buf })[off..off + src.len()].copy_from_slice(src));
            Ok(src.len())
        }

        fn load_acquire(&self, addr: u64) -> Result<u16, Self::Error> {
            Ok(self.word(addr)?.load(Ordering::Acquire))
        }

        fn store_release(&self, addr: u64, val: u16) -> Result<(), Self::Error> {
            self.word(addr)?.store(val, Ordering::Release);
            Ok(())
        }

        fn fence(&self) {
            loom::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Kicks(Arc<AtomicUsize>);

    impl Notifier for Kicks {
        fn notify(&self, _stats: QueueStats) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn virtq_ping_pong() {
        loom::model(|| {
            let data_base = 0x1000;
            let data_len = 0x400;

            let mem = Arc::new(LoomMem::new(4, data_base, data_len));
            let pool = Arc::new(BufferPool::<64>::new(data_base, data_len).unwrap());
            let layout = mem.layout;

            let mut prod = VirtqProducer::new(layout, mem.clone(), Kicks::default(), pool).unwrap();
            let mut cons = VirtqConsumer::new(layout, mem.clone(), Kicks::default()).unwrap();

            let t_prod = thread::spawn(move || {
                let tok = prod.send(b"ping", 32).unwrap();
                loop {
                    if let Some(r) = prod.poll_once().unwrap() {
                        assert_eq!(r.token, tok);
                        assert_eq!(&r.data[..], b"pong");
                        break;
                    }
                    thread::yield_now();
                }
            });

            let t_cons = thread::spawn(move || {
                let req = loop {
                    if let Some(r) = cons.poll_once(1024).unwrap() {
                        break r;
                    }
                    thread::yield_now();
                };
                assert_eq!(&req.data[..], b"ping");
                cons.complete(req.token, b"pong").unwrap();
            });

            t_prod.join().unwrap();
            t_cons.join().unwrap();
        });
    }
}
