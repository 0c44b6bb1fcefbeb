//! Outbound sequence number reservation
//!
//! Each outbound batch reserves a contiguous range of sequence numbers with a
//! single read-modify-write of the SA counter. The counter holds the next
//! number to hand out. Numbers above the SA's limit (`u32::MAX` without ESN,
//! `u64::MAX` with ESN) are never granted; a batch crossing the limit is
//! truncated and the caller fails the remainder with an overflow.

use std::sync::atomic::{AtomicU64, Ordering};

/// Range of sequence numbers granted to one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqnReservation {
    /// Sequence number of the first packet
    pub first: u64,
    /// Number of packets that got a sequence number
    pub granted: usize,
}

impl SqnReservation {
    /// Sequence number of packet `i` of the batch
    ///
    /// `None` once the number no longer fits in 64 bits, which only happens
    /// for packets past the grant of an ESN SA at the top of its space.
    pub fn nth(&self, i: usize) -> Option<u64> {
        self.first.checked_add(i as u64)
    }
}

/// Outbound sequence counter
#[derive(Debug)]
pub struct OutboundSqn {
    next: AtomicU64,
    mask: u64,
    atomic: bool,
}

impl OutboundSqn {
    /// Counter starting at `initial` (at least 1)
    pub fn new(initial: u64, esn: bool, atomic: bool) -> Self {
        OutboundSqn {
            next: AtomicU64::new(initial.max(1)),
            mask: if esn { u64::MAX } else { u32::MAX as u64 },
            atomic,
        }
    }

    /// Largest sequence number representable for this SA
    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Next sequence number that would be handed out
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    /// Reserve up to `n` consecutive sequence numbers
    ///
    /// Under the atomic discipline this is safe against concurrent callers;
    /// otherwise the caller guarantees a single writer.
    pub fn reserve(&self, n: usize) -> SqnReservation {
        let add = n as u64;
        let old = if self.atomic {
            match self
                .next
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                    Some(cur.saturating_add(add))
                }) {
                Ok(prev) | Err(prev) => prev,
            }
        } else {
            let cur = self.next.load(Ordering::Relaxed);
            self.next.store(cur.saturating_add(add), Ordering::Relaxed);
            cur
        };

        let end = old as u128 + add as u128;
        let granted = if end > self.mask as u128 {
            let excess = end - self.mask as u128;
            (add as u128).saturating_sub(excess) as usize
        } else {
            n
        };

        SqnReservation {
            first: old,
            granted,
        }
    }

    /// Zero the counter
    pub fn clear(&self) {
        self.next.store(0, Ordering::Release);
    }
}
