//! Batch bookkeeping shared by every transform
//!
//! Rejected packets are never dropped. They are moved to the tail of the
//! caller's slice with [`move_bad`], keeping the relative order of both the
//! accepted prefix and the rejected suffix.

use std::ops::Range;

use corvid_platform::{CryptoOp, Mbuf, OffloadFlags, OpStatus, SessionAttach};

use super::{Error, ErrorClass, Result};

/// Result of one batch call
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    /// Number of entries at the front of the slice that succeeded
    pub accepted: usize,
    /// First error raised during the call
    pub error: Option<Error>,
}

impl BatchOutcome {
    /// Errno-style class of the reported error
    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(Error::class)
    }
}

/// Stable partition: move `items[i]` for every `i` in `bad` to the tail
///
/// Indices past the end of `items` are ignored and duplicates count once.
/// Returns the number of items left at the front.
pub fn move_bad<T>(items: &mut [T], bad: &[usize]) -> usize {
    let mut is_bad = vec![false; items.len()];
    for &i in bad {
        if let Some(slot) = is_bad.get_mut(i) {
            *slot = true;
        }
    }
    partition(items, &is_bad)
}

/// Stable partition by mask; `is_bad` may be shorter than `items`
fn partition<T>(items: &mut [T], is_bad: &[bool]) -> usize {
    let n = items.len();
    let bad = |i: usize| is_bad.get(i).copied().unwrap_or(false);

    // order[j] = index of the item that ends up at j
    let order: Vec<usize> = (0..n)
        .filter(|&i| !bad(i))
        .chain((0..n).filter(|&i| bad(i)))
        .collect();
    let good = (0..n).filter(|&i| !bad(i)).count();

    let mut placed = vec![false; n];
    for start in 0..n {
        if placed[start] {
            continue;
        }
        let mut j = start;
        loop {
            placed[j] = true;
            let k = order[j];
            if k == start {
                break;
            }
            items.swap(j, k);
            j = k;
        }
    }

    good
}

/// Rejected indices of one batch plus the first error seen
#[derive(Debug, Default)]
pub(crate) struct Rejects {
    rejected: Vec<bool>,
    count: usize,
    first: Option<Error>,
}

impl Rejects {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record an error that is not tied to one packet
    pub(crate) fn note(&mut self, err: Error) {
        if self.first.is_none() {
            self.first = Some(err);
        }
    }

    /// Reject packet `index`; a packet rejected twice counts once
    pub(crate) fn push(&mut self, index: usize, err: Error) {
        if index >= self.rejected.len() {
            self.rejected.resize(index + 1, false);
        }
        if !self.rejected[index] {
            self.rejected[index] = true;
            self.count += 1;
        }
        self.note(err);
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn contains(&self, index: usize) -> bool {
        self.rejected.get(index).copied().unwrap_or(false)
    }

    /// Move rejected items to the tail and build the outcome
    pub(crate) fn finish<T>(self, items: &mut [T]) -> BatchOutcome {
        let accepted = if self.count == 0 {
            items.len()
        } else {
            partition(items, &self.rejected)
        };

        BatchOutcome {
            accepted,
            error: self.first,
        }
    }
}

/// Run of consecutive ops sharing one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoGroup {
    /// Session of every op in the run
    pub session: SessionAttach,
    /// Op (and packet) indices of the run
    pub range: Range<usize>,
}

/// Reflect op completion status on the packets and group ops by session
///
/// Each packet gets `RX_SEC_OFFLOAD`, plus `RX_SEC_OFFLOAD_FAILED` when its
/// op did not succeed, which is what the process stage inspects.
///
/// # Errors
///
/// Returns [`Error::InvalidState`] if an op has no session attached
pub fn crypto_group(ops: &[CryptoOp], mbufs: &mut [Mbuf]) -> Result<Vec<CryptoGroup>> {
    let n = ops.len().min(mbufs.len());
    let mut groups: Vec<CryptoGroup> = Vec::new();

    for (i, (op, mb)) in ops.iter().zip(mbufs.iter_mut()).take(n).enumerate() {
        let session = op
            .session
            .ok_or_else(|| Error::InvalidState(format!("crypto op {} has no session", i)))?;

        mb.ol_flags.insert(OffloadFlags::RX_SEC_OFFLOAD);
        mb.ol_flags.set(
            OffloadFlags::RX_SEC_OFFLOAD_FAILED,
            op.status != OpStatus::Success,
        );

        match groups.last_mut() {
            Some(g) if g.session == session => g.range.end = i + 1,
            _ => groups.push(CryptoGroup {
                session,
                range: i..i + 1,
            }),
        }
    }

    Ok(groups)
}
