//! Per-SA statistics
//!
//! All counters use relaxed atomics so concurrent batches against one SA
//! can update them without coordination.
//!
//! # Example
//!
//! ```
//! use corvid_proto::ipsec::metrics::SaStats;
//!
//! let stats = SaStats::new();
//! stats.record_accepted(2, 1400);
//! stats.record_replay_rejected(1);
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.packets, 2);
//! assert_eq!(snapshot.errors, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic per-SA counters
#[derive(Debug, Default)]
pub struct SaStats {
    packets: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    auth_failed: AtomicU64,
    replay_rejected: AtomicU64,
    sqn_overflow: AtomicU64,
}

/// Point-in-time copy of [`SaStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SaStatsSnapshot {
    /// Packets that completed the transform
    pub packets: u64,
    /// Bytes of those packets after the transform
    pub bytes: u64,
    /// Packets rejected for any reason
    pub errors: u64,
    /// Packets rejected because crypto or protocol offload failed
    pub auth_failed: u64,
    /// Packets rejected by the anti-replay window
    pub replay_rejected: u64,
    /// Packets rejected because the sequence space ran out
    pub sqn_overflow: u64,
}

impl SaStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `packets` accepted packets totalling `bytes`
    pub fn record_accepted(&self, packets: usize, bytes: usize) {
        self.packets.fetch_add(packets as u64, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record rejected packets not covered by a more specific counter
    pub fn record_errors(&self, count: usize) {
        self.errors.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record offload / authentication failures
    pub fn record_auth_failed(&self, count: usize) {
        self.auth_failed.fetch_add(count as u64, Ordering::Relaxed);
        self.record_errors(count);
    }

    /// Record anti-replay rejections
    pub fn record_replay_rejected(&self, count: usize) {
        self.replay_rejected.fetch_add(count as u64, Ordering::Relaxed);
        self.record_errors(count);
    }

    /// Record packets refused for lack of sequence numbers
    pub fn record_sqn_overflow(&self, count: usize) {
        self.sqn_overflow.fetch_add(count as u64, Ordering::Relaxed);
        self.record_errors(count);
    }

    /// Copy the current values
    pub fn snapshot(&self) -> SaStatsSnapshot {
        SaStatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            auth_failed: self.auth_failed.load(Ordering::Relaxed),
            replay_rejected: self.replay_rejected.load(Ordering::Relaxed),
            sqn_overflow: self.sqn_overflow.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter to zero
    pub fn reset(&self) {
        self.packets.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.auth_failed.store(0, Ordering::Relaxed);
        self.replay_rejected.store(0, Ordering::Relaxed);
        self.sqn_overflow.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specific_counters_feed_errors() {
        let stats = SaStats::new();
        stats.record_auth_failed(2);
        stats.record_sqn_overflow(1);
        stats.record_errors(3);

        let snap = stats.snapshot();
        assert_eq!(snap.auth_failed, 2);
        assert_eq!(snap.sqn_overflow, 1);
        assert_eq!(snap.errors, 6);
    }

    #[test]
    fn test_reset() {
        let stats = SaStats::new();
        stats.record_accepted(10, 15000);
        stats.record_replay_rejected(4);
        stats.reset();
        assert_eq!(stats.snapshot(), SaStatsSnapshot::default());
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = SaStats::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        stats.record_accepted(1, 100);
                    }
                });
            }
        });

        let snap = stats.snapshot();
        assert_eq!(snap.packets, 4000);
        assert_eq!(snap.bytes, 400_000);
    }
}
