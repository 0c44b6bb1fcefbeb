//! Anti-Replay Protection for IPSec ESP
//!
//! Implements RFC 4303 Section 3.4.3 - Anti-Replay mechanism, with the
//! RFC 4303 Appendix A extended sequence number reconstruction.
//!
//! # Algorithm
//!
//! The window is a circular bitmap of 64-bit buckets. Sequence number `s`
//! lives in bucket `(s >> 6) & (nb - 1)`, bit `s & 63`:
//!
//! ```text
//!  high = 200, window = 64, nb = 4
//!
//!  bucket:   0          1          2          3
//!          [128..191] [192..255] [ 0.. 63]  [ 64..127]
//!                ↑          ↑
//!           lower edge   high (bit 8)
//!
//!  accepted interval: [high - window + 1, high] = [137, 200]
//! ```
//!
//! Advancing `high` clears every bucket between the old and the new high
//! bucket, so bits that fall out of the window never survive a wrap of the
//! circular array. The bucket count is a power of two with one spare bucket,
//! so the whole window is always covered.
//!
//! # Concurrency
//!
//! [`ReplaySqn`] holds one window for the plain discipline and two snapshots
//! for the atomic discipline. Readers look at the published snapshot; a
//! writer copies it into the spare slot, updates the copy and publishes it
//! when the [`ReplayUpdate`] guard drops.
//!
//! # References
//!
//! - [RFC 4303 Section 3.4.3](https://datatracker.ietf.org/doc/html/rfc4303#section-3.4.3)
//! - [RFC 4303 Appendix A](https://datatracker.ietf.org/doc/html/rfc4303#appendix-A)

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{Error, Result};

/// log2 of the bucket width
pub const WINDOW_BUCKET_BITS: u32 = 6;

/// Sequence numbers per bucket
pub const WINDOW_BUCKET_SIZE: u64 = 1 << WINDOW_BUCKET_BITS;

/// Upper bound on the number of buckets
pub const WINDOW_MAX_BUCKETS: usize = 32768;

/// Largest window size that fits the bucket cap
pub const MAX_WINDOW_SIZE: u32 = ((WINDOW_MAX_BUCKETS as u64 - 1) * WINDOW_BUCKET_SIZE) as u32;

const WINDOW_BIT_MASK: u64 = WINDOW_BUCKET_SIZE - 1;

/// Number of buckets needed for a window of `window` sequence numbers
pub fn bucket_count(window: u32) -> usize {
    let needed = (window as u64).div_ceil(WINDOW_BUCKET_SIZE) as usize + 1;
    needed.next_power_of_two().clamp(2, WINDOW_MAX_BUCKETS)
}

/// Rebuild a 64-bit ESN from its transmitted low half
///
/// `high` is the window's highest accepted sequence number and `window` its
/// size. The result is the candidate sharing `sqn_low` that lies in
/// `[high - window + 1, high + 2^32 - window]`, so values just past a
/// 32-bit wrap move the high half forward and late packets from before a
/// wrap move it back.
pub fn reconstruct_esn(high: u64, sqn_low: u32, window: u32) -> u64 {
    let tl = high as u32;
    let mut th = (high >> 32) as u32;
    let bl = tl.wrapping_sub(window).wrapping_add(1);

    if tl >= window.wrapping_sub(1) {
        // window does not straddle a 32-bit boundary
        if sqn_low < bl {
            th = th.wrapping_add(1);
        }
    } else if th != 0 && sqn_low >= bl {
        th -= 1;
    }

    ((th as u64) << 32) | sqn_low as u64
}

/// Sliding anti-replay window
#[derive(Debug)]
pub struct ReplayWindow {
    high: u64,
    window: u32,
    buckets: Box<[u64]>,
}

impl Clone for ReplayWindow {
    fn clone(&self) -> Self {
        ReplayWindow {
            high: self.high,
            window: self.window,
            buckets: self.buckets.clone(),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        self.high = source.high;
        self.window = source.window;
        if self.buckets.len() == source.buckets.len() {
            self.buckets.copy_from_slice(&source.buckets);
        } else {
            self.buckets = source.buckets.clone();
        }
    }
}

impl ReplayWindow {
    /// Create a window of `window` sequence numbers with high watermark `initial`
    pub fn new(window: u32, initial: u64) -> Self {
        ReplayWindow {
            high: initial,
            window,
            buckets: vec![0; bucket_count(window)].into_boxed_slice(),
        }
    }

    /// Highest accepted sequence number
    pub fn high(&self) -> u64 {
        self.high
    }

    /// Window size in sequence numbers
    pub fn window_size(&self) -> u32 {
        self.window
    }

    /// Number of 64-bit buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn index_mask(&self) -> u64 {
        self.buckets.len() as u64 - 1
    }

    fn bucket_of(&self, sqn: u64) -> usize {
        ((sqn >> WINDOW_BUCKET_BITS) & self.index_mask()) as usize
    }

    /// Check `sqn` without recording it
    ///
    /// # Errors
    ///
    /// Returns [`Error::StaleSequence`] for zero or numbers below the window
    /// and [`Error::ReplayDetected`] for numbers already recorded.
    pub fn check(&self, sqn: u64) -> Result<()> {
        if sqn == 0 {
            return Err(Error::StaleSequence(sqn));
        }
        if sqn > self.high {
            return Ok(());
        }
        if sqn.saturating_add(self.window as u64) <= self.high {
            return Err(Error::StaleSequence(sqn));
        }

        let bit = 1u64 << (sqn & WINDOW_BIT_MASK);
        if self.buckets[self.bucket_of(sqn)] & bit != 0 {
            return Err(Error::ReplayDetected(sqn));
        }
        Ok(())
    }

    /// Record `sqn`, sliding the window forward if it is the new maximum
    ///
    /// # Errors
    ///
    /// Same as [`ReplayWindow::check`]; the window is unchanged on error.
    pub fn update(&mut self, sqn: u64) -> Result<()> {
        self.check(sqn)?;

        if sqn > self.high {
            let last = self.high >> WINDOW_BUCKET_BITS;
            let diff = (sqn >> WINDOW_BUCKET_BITS) - last;
            let n = diff.min(self.buckets.len() as u64);
            let mask = self.index_mask();
            for i in 1..=n {
                self.buckets[((last + i) & mask) as usize] = 0;
            }
            self.high = sqn;
        }

        let idx = self.bucket_of(sqn);
        self.buckets[idx] |= 1u64 << (sqn & WINDOW_BIT_MASK);
        Ok(())
    }

    /// Forget all state
    pub fn clear(&mut self) {
        self.high = 0;
        self.buckets.iter_mut().for_each(|b| *b = 0);
    }
}

/// Replay state of an inbound SA
#[derive(Debug)]
pub struct ReplaySqn {
    snapshots: Box<[RwLock<ReplayWindow>]>,
    published: AtomicUsize,
    writer: Mutex<()>,
}

impl ReplaySqn {
    /// Create replay state; `atomic` keeps a second snapshot for lock-free readers
    pub fn new(window: u32, initial: u64, atomic: bool) -> Self {
        let count = if atomic { 2 } else { 1 };
        let snapshots = (0..count)
            .map(|_| RwLock::new(ReplayWindow::new(window, initial)))
            .collect();

        ReplaySqn {
            snapshots,
            published: AtomicUsize::new(0),
            writer: Mutex::new(()),
        }
    }

    /// Whether two snapshots are kept
    pub fn is_atomic(&self) -> bool {
        self.snapshots.len() > 1
    }

    /// Read access to the published window
    pub fn read(&self) -> RwLockReadGuard<'_, ReplayWindow> {
        self.snapshots[self.published.load(Ordering::Acquire)].read()
    }

    /// Copy of the published window
    ///
    /// The read lock is released before returning, so a long check pass over
    /// the copy never holds up writers.
    pub fn snapshot(&self) -> ReplayWindow {
        self.read().clone()
    }

    /// Start a batch update
    ///
    /// Under the atomic discipline the returned guard works on a private copy
    /// of the published window, which becomes visible when the guard drops.
    pub fn begin_update(&self) -> ReplayUpdate<'_> {
        if !self.is_atomic() {
            return ReplayUpdate {
                window: self.snapshots[0].write(),
                publish: None,
                _writer: None,
            };
        }

        let writer = self.writer.lock();
        let cur = self.published.load(Ordering::Acquire);
        let next = (cur + 1) % self.snapshots.len();

        let mut window = self.snapshots[next].write();
        window.clone_from(&self.snapshots[cur].read());

        ReplayUpdate {
            window,
            publish: Some((&self.published, next)),
            _writer: Some(writer),
        }
    }

    /// Zero every snapshot
    pub fn clear(&self) {
        let _writer = self.writer.lock();
        for snapshot in self.snapshots.iter() {
            snapshot.write().clear();
        }
    }
}

/// Scoped write access to a replay window, see [`ReplaySqn::begin_update`]
pub struct ReplayUpdate<'a> {
    window: RwLockWriteGuard<'a, ReplayWindow>,
    publish: Option<(&'a AtomicUsize, usize)>,
    _writer: Option<MutexGuard<'a, ()>>,
}

impl Deref for ReplayUpdate<'_> {
    type Target = ReplayWindow;

    fn deref(&self) -> &ReplayWindow {
        &self.window
    }
}

impl DerefMut for ReplayUpdate<'_> {
    fn deref_mut(&mut self) -> &mut ReplayWindow {
        &mut self.window
    }
}

impl Drop for ReplayUpdate<'_> {
    fn drop(&mut self) {
        if let Some((published, idx)) = self.publish {
            published.store(idx, Ordering::Release);
        }
    }
}
