//! Capture port pairs.
//!
//! RTP goes to an even port and RTCP to the next odd one. Pairs are handed
//! out round-robin so a just-released pair is not reused immediately while
//! the previous encoder may still hold the socket.

use std::collections::BTreeSet;

/// An RTP/RTCP port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

/// Allocator over an inclusive port range.
#[derive(Debug)]
pub struct PortAllocator {
    first: u16,
    last: u16,
    next: u16,
    in_use: BTreeSet<u16>,
}

impl PortAllocator {
    /// Build an allocator over `[min, max]`.
    ///
    /// Only even ports whose odd successor is also in range are used.
    #[must_use]
    pub fn new(min: u16, max: u16) -> Self {
        let first = if min % 2 == 0 { min } else { min.saturating_add(1) };
        // Highest even port with room for RTCP after it.
        let last = match max.checked_sub(1) {
            Some(top) if top % 2 == 0 => top,
            Some(top) => top.saturating_sub(1),
            None => 0,
        };
        Self {
            first,
            last,
            next: first,
            in_use: BTreeSet::new(),
        }
    }

    /// Number of pairs the range holds.
    #[must_use]
    pub fn capacity(&self) -> usize {
        if self.last < self.first {
            0
        } else {
            usize::from((self.last - self.first) / 2) + 1
        }
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    /// Reserve the next free pair, or `None` when the range is exhausted.
    pub fn allocate(&mut self) -> Option<PortPair> {
        let capacity = self.capacity();
        let mut candidate = self.next;
        for _ in 0..capacity {
            if candidate > self.last || candidate < self.first {
                candidate = self.first;
            }
            if self.in_use.insert(candidate) {
                self.next = candidate.saturating_add(2);
                return Some(PortPair {
                    rtp: candidate,
                    rtcp: candidate + 1,
                });
            }
            candidate = candidate.saturating_add(2);
        }
        None
    }

    /// Return a pair to the pool. Releasing twice is harmless.
    pub fn release(&mut self, pair: PortPair) {
        self.in_use.remove(&pair.rtp);
    }
}
