//! Per-session sequence allocation.
//!
//! Each session owns one allocator, so allocations for different
//! sessions never touch the same counter. Numbers start at 1; 0 means
//! "nothing acknowledged yet".

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct SequenceAllocator {
    next: AtomicU64,
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The number the next allocation will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// Highest number handed out so far (0 if none).
    pub fn head(&self) -> u64 {
        self.peek() - 1
    }
}
