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

use std::num::NonZeroU16;
use std::sync::Arc;

use anyhow::{Context, Result};
use virtqueue::{BufferRegion, HeapMem, Layout};

/// Queue areas at address zero, followed by a page aligned data region.
pub struct SharedQueue {
    pub mem: Arc<HeapMem>,
    pub layout: Layout,
    pub data: BufferRegion,
}

pub fn shared_queue(descs: u16, data_len: u64) -> Result<SharedQueue> {
    let n = NonZeroU16::new(descs).context("queue size must be non-zero")?;
    let layout = Layout::from_base(0, n, n)?;
    let data_base = (Layout::query_size(descs as usize, descs as usize) as u64).next_multiple_of(4096);
    let mem = Arc::new(HeapMem::new((data_base + data_len) as usize));

    Ok(SharedQueue {
        mem,
        layout,
        data: BufferRegion::new(data_base, data_len)?,
    })
}
