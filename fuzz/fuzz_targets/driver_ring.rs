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
    BufferElement, DriverQueue, HeapMem, Layout, MemOps, QueueStats, UsedElem, UsedRing,
};

const DESCS: u16 = 8;

#[derive(Arbitrary, Debug)]
enum Step {
    Submit(Vec<BufferElement>),
    Complete { slot: u8, id: u32, len: u32 },
    PublishUsed(u16),
    Collect,
}

// Whatever a hostile device writes to the used ring, the driver never frees a
// descriptor twice and never loses one.
fuzz_target!(|steps: Vec<Step>| {
    let n = NonZeroU16::new(DESCS).unwrap();
    let layout = Layout::from_base(0, n, n).unwrap();
    let mem = HeapMem::new(0x1000);
    let used = UsedRing::new(&layout);
    let mut driver = DriverQueue::new(layout, &mem, |_: QueueStats| {}).unwrap();
    let mut submitted = 0usize;
    let mut reclaimed = 0usize;

    for step in steps {
        match step {
            Step::Submit(elems) => {
                if driver.submit(&elems).is_ok() {
                    submitted += elems.len();
                }
            }
            Step::Complete { slot, id, len } => {
                let _ = mem.write_val(used.slot_addr(slot as u16), UsedElem { id, len });
            }
            Step::PublishUsed(idx) => {
                let _ = mem.store_release(used.idx_addr(), idx);
            }
            Step::Collect => {
                while let Ok(Some(mut buf)) = driver.consume_used() {
                    reclaimed += driver.reclaim(&mut buf.cursor).unwrap_or(0);
                }
            }
        }
        assert_eq!(driver.num_inflight(), submitted - reclaimed);
    }
});
