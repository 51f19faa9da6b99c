//! Copy-on-write frame sharing.
//!
//! A side table, indexed by physical frame number, tracks how many address
//! spaces reference each shared frame. Frames absent from the table have
//! exactly one owner. `clone_for_fork` increments counts, fault resolution
//! and `unmap` decrement them; a frame may be returned to the allocator
//! only once its last reference is gone.

extern crate alloc;

use alloc::collections::BTreeMap;

use crate::sync::SpinLock;

use super::FrameNumber;

/// Reference counts for shared frames. Absent entry = sole owner.
pub struct ShareTable {
    counts: BTreeMap<u64, u32>,
}

impl ShareTable {
    pub const fn new() -> Self {
        Self {
            counts: BTreeMap::new(),
        }
    }

    /// Record one additional owner of `frame`.
    pub fn share(&mut self, frame: FrameNumber) {
        let count = self.counts.entry(frame.as_u64()).or_insert(1);
        *count += 1;
    }

    /// Drop one reference to `frame`. Returns the number of owners that
    /// remain; `0` means the caller held the last reference and now owns
    /// the frame outright (and may free it).
    pub fn release(&mut self, frame: FrameNumber) -> u32 {
        match self.counts.get_mut(&frame.as_u64()) {
            None => 0,
            Some(count) => {
                *count -= 1;
                let remaining = *count;
                if remaining <= 1 {
                    // Back to a single owner; absent-means-one keeps the
                    // table small.
                    self.counts.remove(&frame.as_u64());
                }
                remaining
            }
        }
    }

    /// Current owner count for `frame`.
    pub fn owners(&self, frame: FrameNumber) -> u32 {
        self.counts.get(&frame.as_u64()).copied().unwrap_or(1)
    }

    /// Whether `frame` has more than one owner.
    pub fn is_shared(&self, frame: FrameNumber) -> bool {
        self.owners(frame) > 1
    }
}

impl Default for ShareTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Global share table for the running kernel.
pub static SHARE_TABLE: SpinLock<ShareTable> = SpinLock::new(ShareTable {
    counts: BTreeMap::new(),
});

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn unshared_frame_has_one_owner() {
        let table = ShareTable::new();
        assert_eq!(table.owners(FrameNumber::new(10)), 1);
        assert!(!table.is_shared(FrameNumber::new(10)));
    }

    #[test]
    fn share_then_release_returns_to_sole_ownership() {
        let mut table = ShareTable::new();
        let frame = FrameNumber::new(42);

        table.share(frame);
        assert_eq!(table.owners(frame), 2);
        assert!(table.is_shared(frame));

        assert_eq!(table.release(frame), 1);
        assert!(!table.is_shared(frame));
        assert_eq!(table.release(frame), 0);
    }

    #[test]
    fn release_of_never_shared_frame_means_caller_owned_it() {
        let mut table = ShareTable::new();
        assert_eq!(table.release(FrameNumber::new(7)), 0);
    }

    #[test]
    fn three_way_share_counts_down() {
        let mut table = ShareTable::new();
        let frame = FrameNumber::new(3);
        table.share(frame);
        table.share(frame);
        assert_eq!(table.owners(frame), 3);
        assert_eq!(table.release(frame), 2);
        assert_eq!(table.release(frame), 1);
        assert_eq!(table.release(frame), 0);
    }
}
