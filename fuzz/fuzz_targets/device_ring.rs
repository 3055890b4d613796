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

#![no_main]

use std::num::NonZeroU16;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use virtqueue::{
    AvailRing, BufferRegion, DeviceQueue, HeapMem, Layout, MemOps, QueueStats, RingError,
    VirtqConsumer,
};

const DESCS: u16 = 8;
const DATA_BASE: u64 = 0x1000;
const DATA_LEN: u64 = 0x1000;

/// What a hostile driver can write: raw descriptors, ring slots and the index.
#[derive(Arbitrary, Debug)]
struct Driver {
    descs: Vec<(u8, u64, u32, u16, u16)>,
    ring: Vec<(u8, u16)>,
    avail_idx: u16,
    use_channel: bool,
}

// The device side must never panic, and must return every error as a value
// however the driver scribbles over the descriptor table and available ring.
fuzz_target!(|input: Driver| {
    let n = NonZeroU16::new(DESCS).unwrap();
    let layout = Layout::from_base(0, n, n).unwrap();
    let mem = HeapMem::new((DATA_BASE + DATA_LEN) as usize);
    let region = BufferRegion::new(DATA_BASE, DATA_LEN).unwrap();
    let avail = AvailRing::new(&layout);

    if input.use_channel {
        let mut consumer = VirtqConsumer::new(layout, &mem, |_: QueueStats| {}).unwrap();
        consumer.restrict(region);
        scribble(&mem, &layout, &avail, &input);
        for _ in 0..DESCS {
            match consumer.poll_once(DATA_LEN as usize) {
                Ok(Some(req)) => {
                    let _ = consumer.complete(req.token, &req.data[..req.data.len().min(req.resp_cap)]);
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }
        return;
    }

    let mut device = DeviceQueue::new(layout, &mem, |_: QueueStats| {}).unwrap();
    device.restrict_buffers(region);
    scribble(&mem, &layout, &avail, &input);

    while let Ok(Some(mut cursor)) = device.consume_available() {
        let _ = device.chain_total_length(&cursor);
        let mut walked = 0;
        for elem in device.gather(&mut cursor) {
            walked += 1;
            if let Ok(elem) = elem {
                assert!(region.contains(elem.addr, elem.len));
            }
        }
        assert!(walked <= DESCS as usize);
        let _ = device.publish_used(cursor, 0);
    }

    if device.is_broken() {
        assert_eq!(device.consume_available(), Err(RingError::Broken));
        assert_eq!(device.poll(), Err(RingError::Broken));
    }
});

fn scribble(mem: &HeapMem, layout: &Layout, avail: &AvailRing, input: &Driver) {
    for &(idx, addr, len, flags, next) in &input.descs {
        let desc = virtqueue::Descriptor {
            addr,
            len,
            flags,
            next,
        };
        let at = layout.desc_table_addr + (idx as u64 % DESCS as u64) * virtqueue::Descriptor::SIZE as u64;
        let _ = mem.write_val(at, desc);
    }
    for &(slot, head) in &input.ring {
        let _ = mem.write_val(avail.slot_addr(slot as u16), head);
    }
    let _ = mem.store_release(avail.idx_addr(), input.avail_idx);
}
