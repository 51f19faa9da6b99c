//! Host-test support: a heap-backed [`FrameSource`].
//!
//! "Physical" addresses are the addresses of leaked page-aligned boxes,
//! so the physical-to-virtual view is the identity and the page-table
//! walker runs unmodified on the host.

extern crate std;

use std::collections::HashMap;

use crate::error::{KernelError, KernelResult};

use super::address_space::FrameSource;
use super::page_table::PageTable;
use super::{PhysicalAddress, PAGE_SIZE};

pub struct MockFrameSource {
    pub live: HashMap<u64, *mut PageTable>,
    pub allocs: usize,
    pub frees: usize,
    pub fail_after: Option<usize>,
}

impl Default for MockFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFrameSource {
    pub fn new() -> Self {
        Self {
            live: HashMap::new(),
            allocs: 0,
            frees: 0,
            fail_after: None,
        }
    }

    pub fn contains(&self, phys: PhysicalAddress) -> bool {
        self.live.contains_key(&phys.as_u64())
    }
}

impl FrameSource for MockFrameSource {
    fn alloc_frame(&mut self) -> KernelResult<PhysicalAddress> {
        if let Some(limit) = self.fail_after {
            if self.allocs >= limit {
                return Err(KernelError::OutOfMemory {
                    requested: PAGE_SIZE,
                });
            }
        }
        let frame = std::boxed::Box::into_raw(std::boxed::Box::new(PageTable::new()));
        self.live.insert(frame as u64, frame);
        self.allocs += 1;
        Ok(PhysicalAddress::new(frame as u64))
    }

    fn free_frame(&mut self, phys: PhysicalAddress) {
        let frame = self
            .live
            .remove(&phys.as_u64())
            .expect("freeing frame not allocated by this source");
        // SAFETY: the pointer came from Box::into_raw in alloc_frame.
        unsafe { drop(std::boxed::Box::from_raw(frame)) };
        self.frees += 1;
    }

    fn phys_to_virt(&self, phys: PhysicalAddress) -> *mut u8 {
        phys.as_u64() as *mut u8
    }
}
