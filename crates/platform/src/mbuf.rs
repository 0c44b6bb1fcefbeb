//! Segmented packet buffers
//!
//! An [`Mbuf`] is a chain of fixed-capacity [`Segment`]s. Each segment owns a
//! byte buffer split into head room, a data window and tail room:
//!
//! ```text
//!  buf[0]          data_off            data_off + data_len        capacity
//!    │   head room    │      data window       │      tail room      │
//!    └────────────────┴────────────────────────┴─────────────────────┘
//! ```
//!
//! Headers grow into the first segment's head room (`prepend`), trailers grow
//! into the last segment's tail room (`append`). Packet-level offsets used by
//! [`Mbuf::copy_in`], [`Mbuf::copy_out`] and [`Mbuf::iova_at`] walk the chain,
//! and may run past `pkt_len` into the last segment's tail room, which is where
//! transform code keeps per-packet scratch such as AEAD associated data.

use std::ops::Range;

use bitflags::bitflags;

use crate::crypto::SecuritySessionHandle;
use crate::error::{PlatformError, PlatformResult};

/// Default head room reserved by [`Mbuf::from_bytes`] callers in tests and benches
pub const DEFAULT_HEADROOM: usize = 128;

bitflags! {
    /// Offload status flags carried by a packet buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OffloadFlags: u64 {
        /// Packet went through a security offload on receive
        const RX_SEC_OFFLOAD = 1 << 0;
        /// Security offload reported a failure for this packet
        const RX_SEC_OFFLOAD_FAILED = 1 << 1;
        /// Packet requests security offload on transmit
        const TX_SEC_OFFLOAD = 1 << 2;
    }
}

/// Packet type classification
///
/// Layer classes occupy separate nibbles so transforms can keep or drop
/// whole layers with a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PacketType(u32);

impl PacketType {
    /// Unclassified packet
    pub const UNKNOWN: PacketType = PacketType(0);

    /// L2 class mask
    pub const L2_MASK: u32 = 0x0000_000f;
    /// L3 class mask
    pub const L3_MASK: u32 = 0x0000_00f0;
    /// L4 class mask
    pub const L4_MASK: u32 = 0x0000_0f00;
    /// Tunnel class mask
    pub const TUNNEL_MASK: u32 = 0x0000_f000;

    /// Ethernet
    pub const L2_ETHER: u32 = 0x0000_0001;
    /// IPv4
    pub const L3_IPV4: u32 = 0x0000_0010;
    /// IPv6
    pub const L3_IPV6: u32 = 0x0000_0020;
    /// TCP
    pub const L4_TCP: u32 = 0x0000_0100;
    /// UDP
    pub const L4_UDP: u32 = 0x0000_0200;
    /// ESP tunnel
    pub const TUNNEL_ESP: u32 = 0x0000_1000;

    /// Build a packet type from raw class bits
    pub const fn new(bits: u32) -> Self {
        PacketType(bits)
    }

    /// Raw class bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keep only the classes selected by `mask`
    pub const fn masked(self, mask: u32) -> Self {
        PacketType(self.0 & mask)
    }
}

/// One fixed-capacity buffer in a packet chain
#[derive(Debug, Clone)]
pub struct Segment {
    buf: Vec<u8>,
    data_off: usize,
    data_len: usize,
    buf_iova: u64,
}

impl Segment {
    /// Create an empty segment
    ///
    /// # Arguments
    ///
    /// * `capacity` - Total buffer size in bytes
    /// * `headroom` - Bytes reserved ahead of the data window
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidSegment`] if `headroom > capacity`
    pub fn new(capacity: usize, headroom: usize) -> PlatformResult<Self> {
        if headroom > capacity {
            return Err(PlatformError::InvalidSegment(format!(
                "head room {} exceeds capacity {}",
                headroom, capacity
            )));
        }

        Ok(Segment {
            buf: vec![0; capacity],
            data_off: headroom,
            data_len: 0,
            buf_iova: 0,
        })
    }

    /// Create a segment holding `data`, with the given head and tail room
    pub fn with_data(data: &[u8], headroom: usize, tailroom: usize) -> Self {
        let mut buf = vec![0; headroom + data.len() + tailroom];
        buf[headroom..headroom + data.len()].copy_from_slice(data);

        Segment {
            buf,
            data_off: headroom,
            data_len: data.len(),
            buf_iova: 0,
        }
    }

    /// Set the IO address of the first byte of the underlying buffer
    pub fn with_iova(mut self, buf_iova: u64) -> Self {
        self.buf_iova = buf_iova;
        self
    }

    /// Total buffer size
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes in the data window
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Free bytes ahead of the data window
    pub fn headroom(&self) -> usize {
        self.data_off
    }

    /// Free bytes after the data window
    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.data_off - self.data_len
    }

    /// Data window
    pub fn data(&self) -> &[u8] {
        &self.buf[self.data_off..self.data_off + self.data_len]
    }

    /// Mutable data window
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data_off..self.data_off + self.data_len]
    }

    /// IO address of the first data byte
    pub fn iova(&self) -> u64 {
        self.buf_iova + self.data_off as u64
    }

    // data window followed by tail room
    fn window_and_tail(&self) -> &[u8] {
        &self.buf[self.data_off..]
    }

    fn window_and_tail_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data_off..]
    }
}

/// A packet: a non-empty chain of segments plus offload metadata
#[derive(Debug, Clone)]
pub struct Mbuf {
    segs: Vec<Segment>,
    pkt_len: usize,

    /// Length of the L2 header
    pub l2_len: usize,

    /// Length of the L3 header (including IPv6 extension headers)
    pub l3_len: usize,

    /// Offload flags
    pub ol_flags: OffloadFlags,

    /// Packet type classes
    pub packet_type: PacketType,

    /// Security session metadata attached for inline offload
    pub sec_session: Option<SecuritySessionHandle>,
}

impl Mbuf {
    /// Create an empty single-segment packet
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidSegment`] if `headroom > capacity`
    pub fn new(capacity: usize, headroom: usize) -> PlatformResult<Self> {
        Ok(Self::from_segment(Segment::new(capacity, headroom)?))
    }

    /// Create a single-segment packet holding `data`
    pub fn from_bytes(data: &[u8], headroom: usize, tailroom: usize) -> Self {
        Self::from_segment(Segment::with_data(data, headroom, tailroom))
    }

    /// Create a packet from one segment
    pub fn from_segment(seg: Segment) -> Self {
        let pkt_len = seg.data_len();
        Mbuf {
            segs: vec![seg],
            pkt_len,
            l2_len: 0,
            l3_len: 0,
            ol_flags: OffloadFlags::empty(),
            packet_type: PacketType::UNKNOWN,
            sec_session: None,
        }
    }

    /// Create a packet from a chain of segments
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidSegment`] if `segs` is empty
    pub fn from_segments(segs: Vec<Segment>) -> PlatformResult<Self> {
        if segs.is_empty() {
            return Err(PlatformError::InvalidSegment(
                "a packet needs at least one segment".into(),
            ));
        }

        let pkt_len = segs.iter().map(Segment::data_len).sum();
        Ok(Mbuf {
            segs,
            pkt_len,
            l2_len: 0,
            l3_len: 0,
            ol_flags: OffloadFlags::empty(),
            packet_type: PacketType::UNKNOWN,
            sec_session: None,
        })
    }

    /// Set L2/L3 header lengths
    pub fn with_header_lens(mut self, l2_len: usize, l3_len: usize) -> Self {
        self.l2_len = l2_len;
        self.l3_len = l3_len;
        self
    }

    /// Total data bytes over all segments
    pub fn pkt_len(&self) -> usize {
        self.pkt_len
    }

    /// Number of segments
    pub fn nb_segs(&self) -> usize {
        self.segs.len()
    }

    /// All segments, first to last
    pub fn segments(&self) -> &[Segment] {
        &self.segs
    }

    /// First segment
    pub fn first_segment(&self) -> &Segment {
        &self.segs[0]
    }

    /// Last segment
    pub fn last_segment(&self) -> &Segment {
        &self.segs[self.segs.len() - 1]
    }

    /// Head room of the first segment
    pub fn headroom(&self) -> usize {
        self.first_segment().headroom()
    }

    /// Tail room of the last segment
    pub fn tailroom(&self) -> usize {
        self.last_segment().tailroom()
    }

    /// Grow the packet at the front by `len` bytes
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::NoHeadroom`] if the first segment lacks room
    pub fn prepend(&mut self, len: usize) -> PlatformResult<()> {
        let seg = &mut self.segs[0];
        if len > seg.data_off {
            return Err(PlatformError::NoHeadroom {
                required: len,
                available: seg.data_off,
            });
        }

        seg.data_off -= len;
        seg.data_len += len;
        self.pkt_len += len;
        Ok(())
    }

    /// Grow the packet at the tail by `len` bytes
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::NoTailroom`] if the last segment lacks room
    pub fn append(&mut self, len: usize) -> PlatformResult<()> {
        let last = self.segs.len() - 1;
        let seg = &mut self.segs[last];
        let available = seg.tailroom();
        if len > available {
            return Err(PlatformError::NoTailroom {
                required: len,
                available,
            });
        }

        seg.data_len += len;
        self.pkt_len += len;
        Ok(())
    }

    /// Remove `len` bytes from the front of the first segment
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::OutOfBounds`] if the first segment holds fewer bytes
    pub fn adj(&mut self, len: usize) -> PlatformResult<()> {
        let seg = &mut self.segs[0];
        if len > seg.data_len {
            return Err(PlatformError::OutOfBounds {
                offset: 0,
                len,
                limit: seg.data_len,
            });
        }

        seg.data_off += len;
        seg.data_len -= len;
        self.pkt_len -= len;
        Ok(())
    }

    /// Remove `len` bytes from the tail, releasing segments that become empty
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::OutOfBounds`] if `len > pkt_len`
    pub fn trim(&mut self, len: usize) -> PlatformResult<()> {
        if len > self.pkt_len {
            return Err(PlatformError::OutOfBounds {
                offset: 0,
                len,
                limit: self.pkt_len,
            });
        }

        let mut remaining = len;
        while remaining > 0 {
            let last = self.segs.len() - 1;
            let seg = &mut self.segs[last];
            if seg.data_len >= remaining {
                seg.data_len -= remaining;
                remaining = 0;
            } else {
                remaining -= seg.data_len;
                seg.data_len = 0;
            }

            if self.segs.len() > 1 && self.segs[last].data_len == 0 {
                self.segs.pop();
            }
        }

        self.pkt_len -= len;
        Ok(())
    }

    /// First `len` data bytes, which must sit in the first segment
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::OutOfBounds`] if the first segment is shorter
    pub fn head(&self, len: usize) -> PlatformResult<&[u8]> {
        let seg = self.first_segment();
        if len > seg.data_len {
            return Err(PlatformError::OutOfBounds {
                offset: 0,
                len,
                limit: seg.data_len,
            });
        }
        Ok(&seg.data()[..len])
    }

    /// Mutable first `len` data bytes, which must sit in the first segment
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::OutOfBounds`] if the first segment is shorter
    pub fn head_mut(&mut self, len: usize) -> PlatformResult<&mut [u8]> {
        let seg = &mut self.segs[0];
        if len > seg.data_len {
            return Err(PlatformError::OutOfBounds {
                offset: 0,
                len,
                limit: seg.data_len,
            });
        }
        Ok(&mut seg.data_mut()[..len])
    }

    /// Shift bytes `range` of the first segment's data window by `delta`
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidShift`] if source or destination leaves the window
    pub fn shift_head(&mut self, range: Range<usize>, delta: isize) -> PlatformResult<()> {
        shift_region(self.segs[0].data_mut(), range, delta)
    }

    /// Copy bytes at packet offset `offset` into `dst`
    ///
    /// The copy may extend past `pkt_len` into the last segment's tail room.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::OutOfBounds`] if the range is not addressable
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> PlatformResult<()> {
        self.check_span(offset, dst.len())?;

        let last = self.segs.len() - 1;
        let mut skip = offset;
        let mut done = 0;
        for (i, seg) in self.segs.iter().enumerate() {
            if done == dst.len() {
                break;
            }
            let span = if i == last {
                seg.window_and_tail()
            } else {
                seg.data()
            };
            if skip >= span.len() {
                skip -= span.len();
                continue;
            }
            let n = (span.len() - skip).min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&span[skip..skip + n]);
            done += n;
            skip = 0;
        }
        Ok(())
    }

    /// Copy `src` to packet offset `offset`
    ///
    /// The copy may extend past `pkt_len` into the last segment's tail room
    /// without changing the packet length.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::OutOfBounds`] if the range is not addressable
    pub fn copy_in(&mut self, offset: usize, src: &[u8]) -> PlatformResult<()> {
        self.check_span(offset, src.len())?;

        let last = self.segs.len() - 1;
        let mut skip = offset;
        let mut done = 0;
        for (i, seg) in self.segs.iter_mut().enumerate() {
            if done == src.len() {
                break;
            }
            let span = if i == last {
                seg.window_and_tail_mut()
            } else {
                seg.data_mut()
            };
            if skip >= span.len() {
                skip -= span.len();
                continue;
            }
            let n = (span.len() - skip).min(src.len() - done);
            span[skip..skip + n].copy_from_slice(&src[done..done + n]);
            done += n;
            skip = 0;
        }
        Ok(())
    }

    /// IO address of packet offset `offset`
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::OutOfBounds`] past the last segment's tail room
    pub fn iova_at(&self, offset: usize) -> PlatformResult<u64> {
        let last = self.segs.len() - 1;
        let mut skip = offset;
        for (i, seg) in self.segs.iter().enumerate() {
            let span = if i == last {
                seg.data_len + seg.tailroom()
            } else {
                seg.data_len
            };
            if skip < span || (i == last && skip == span) {
                return Ok(seg.iova() + skip as u64);
            }
            skip -= span;
        }

        Err(PlatformError::OutOfBounds {
            offset,
            len: 0,
            limit: self.addressable(),
        })
    }

    /// Linearized copy of the packet data
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pkt_len);
        for seg in &self.segs {
            out.extend_from_slice(seg.data());
        }
        out
    }

    fn addressable(&self) -> usize {
        self.pkt_len + self.tailroom()
    }

    fn check_span(&self, offset: usize, len: usize) -> PlatformResult<()> {
        let limit = self.addressable();
        match offset.checked_add(len) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(PlatformError::OutOfBounds { offset, len, limit }),
        }
    }
}

/// Move bytes `range` of `bytes` by `delta` positions
///
/// Overlapping source and destination are handled. Bytes uncovered by the
/// move keep their previous contents.
///
/// # Errors
///
/// Returns [`PlatformError::InvalidShift`] if the source range or the
/// destination range does not fit in `bytes`.
pub fn shift_region(bytes: &mut [u8], range: Range<usize>, delta: isize) -> PlatformResult<()> {
    let invalid = || PlatformError::InvalidShift {
        start: range.start,
        end: range.end,
        delta,
    };

    if range.start > range.end || range.end > bytes.len() {
        return Err(invalid());
    }

    let dest = if delta >= 0 {
        range.start.checked_add(delta.unsigned_abs())
    } else {
        range.start.checked_sub(delta.unsigned_abs())
    }
    .ok_or_else(invalid)?;

    if dest + range.len() > bytes.len() {
        return Err(invalid());
    }

    bytes.copy_within(range, dest);
    Ok(())
}
