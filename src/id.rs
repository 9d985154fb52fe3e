//! FastCGI request id allocation.
//!
//! Clients choose the 16-bit id of each request they multiplex onto a
//! connection. This allocator hands out the smallest free positive id and
//! remembers released ids below the high-water mark as gaps, so ids are
//! reused before the range grows. The server side never allocates ids, but
//! its request store obeys the same rules; the allocator is what a client
//! (such as the test harness in `tests/`) uses to stay within them.

use crate::error::IdExhausted;
use std::collections::BTreeSet;

/// Per-connection allocator of FastCGI request ids
#[derive(Debug, Default)]
pub struct RequestIdAllocator {
    // Largest id ever handed out and not yet reclaimed by range shrinking.
    // Ids in `gaps` are below this and free.
    high: u16,
    gaps: BTreeSet<u16>,
}

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the smallest free positive id
    pub fn allocate(&mut self) -> Result<u16, IdExhausted> {
        if let Some(&gap) = self.gaps.iter().next() {
            self.gaps.remove(&gap);
            return Ok(gap);
        }
        if self.high == u16::MAX {
            return Err(IdExhausted);
        }
        self.high += 1;
        Ok(self.high)
    }

    /// Releases an id so it can be handed out again.
    ///
    /// Releasing the current maximum shrinks the range, absorbing any
    /// trailing gaps; releasing anything below it records a gap. Ids that
    /// were never allocated are ignored.
    pub fn release(&mut self, id: u16) {
        if id == 0 || id > self.high || self.gaps.contains(&id) {
            return;
        }
        if id < self.high {
            self.gaps.insert(id);
            return;
        }
        self.high -= 1;
        while self.high > 0 && self.gaps.remove(&self.high) {
            self.high -= 1;
        }
    }

    /// True if `id` is currently handed out
    pub fn is_allocated(&self, id: u16) -> bool {
        id != 0 && id <= self.high && !self.gaps.contains(&id)
    }

    /// Number of ids currently handed out
    pub fn in_use(&self) -> usize {
        self.high as usize - self.gaps.len()
    }
}
