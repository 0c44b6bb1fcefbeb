//! Symmetric crypto operation descriptors
//!
//! A [`CryptoOp`] tells a crypto device which bytes of a packet to encrypt,
//! which to authenticate, where the digest lives and where the AEAD
//! associated data lives. Ops are submitted as a slice in lock-step with the
//! packet slice: `ops[i]` describes `mbufs[i]`.
//!
//! Every location is a [`DataPtr`]: a virtual location (packet offset or
//! offset into the op's private scratch area) paired with the IO address a
//! DMA engine would use.

/// Size of the per-operation private scratch area (IV / nonce material)
pub const OP_SCRATCH_SIZE: usize = 64;

/// Handle to a crypto session owned by a crypto device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CryptoSessionHandle(pub u64);

/// Handle to a security (full protocol offload) session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SecuritySessionHandle(pub u64);

/// Session attached to an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionAttach {
    /// Plain symmetric crypto session
    Crypto(CryptoSessionHandle),
    /// Security session, the device runs the whole protocol
    Security(SecuritySessionHandle),
}

/// Completion status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpStatus {
    /// Not yet executed
    #[default]
    NotProcessed,
    /// Executed successfully
    Success,
    /// Digest verification failed
    AuthFailed,
    /// Session handle unknown to the device
    InvalidSession,
    /// Any other execution failure
    Error,
}

/// `{offset, length}` of a region, relative to the packet start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataRegion {
    /// Packet offset of the first byte
    pub offset: u32,
    /// Number of bytes
    pub length: u32,
}

impl DataRegion {
    /// Create a region
    pub const fn new(offset: u32, length: u32) -> Self {
        DataRegion { offset, length }
    }
}

/// Virtual location of a byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLoc {
    /// Offset inside the packet (may reach into the last segment's tail room)
    Packet(usize),
    /// Offset inside the op's scratch area
    Scratch(usize),
}

/// Virtual/IO address pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPtr {
    /// Virtual location
    pub loc: DataLoc,
    /// IO address
    pub iova: u64,
}

impl DataPtr {
    /// Location inside the packet
    pub const fn packet(offset: usize, iova: u64) -> Self {
        DataPtr {
            loc: DataLoc::Packet(offset),
            iova,
        }
    }
}

/// Symmetric operation layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymOp {
    /// No layout filled in
    #[default]
    Empty,
    /// Single-pass authenticated encryption
    Aead {
        /// Region encrypted and authenticated
        data: DataRegion,
        /// Digest (ICV) location
        digest: DataPtr,
        /// Associated data location
        aad: DataPtr,
    },
    /// Separate cipher and authentication passes
    CipherAuth {
        /// Region encrypted
        cipher: DataRegion,
        /// Region authenticated
        auth: DataRegion,
        /// Digest (ICV) location
        digest: DataPtr,
    },
}

/// A symmetric crypto operation
#[derive(Debug, Clone)]
pub struct CryptoOp {
    /// Completion status
    pub status: OpStatus,
    /// Attached session
    pub session: Option<SessionAttach>,
    /// Region layout
    pub sym: SymOp,
    scratch: [u8; OP_SCRATCH_SIZE],
    iova: u64,
}

impl Default for CryptoOp {
    fn default() -> Self {
        Self::new(0)
    }
}

impl CryptoOp {
    /// Create an op whose scratch area sits at IO address `iova`
    pub fn new(iova: u64) -> Self {
        CryptoOp {
            status: OpStatus::NotProcessed,
            session: None,
            sym: SymOp::Empty,
            scratch: [0; OP_SCRATCH_SIZE],
            iova,
        }
    }

    /// Allocate a batch of ops with consecutive scratch IO addresses
    pub fn batch(n: usize, base_iova: u64) -> Vec<CryptoOp> {
        (0..n)
            .map(|i| CryptoOp::new(base_iova + (i * OP_SCRATCH_SIZE) as u64))
            .collect()
    }

    /// Reset status and attached session, keeping the scratch area
    pub fn reset(&mut self, session: SessionAttach) {
        self.status = OpStatus::NotProcessed;
        self.session = Some(session);
        self.sym = SymOp::Empty;
    }

    /// Scratch area
    pub fn scratch(&self) -> &[u8; OP_SCRATCH_SIZE] {
        &self.scratch
    }

    /// Mutable scratch area
    pub fn scratch_mut(&mut self) -> &mut [u8; OP_SCRATCH_SIZE] {
        &mut self.scratch
    }

    /// Address pair of scratch offset `offset`
    pub fn scratch_ptr(&self, offset: usize) -> DataPtr {
        DataPtr {
            loc: DataLoc::Scratch(offset),
            iova: self.iova + offset as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_iova_layout() {
        let ops = CryptoOp::batch(3, 0x8000);
        assert_eq!(ops[2].scratch_ptr(0).iova, 0x8000 + 2 * OP_SCRATCH_SIZE as u64);
        assert_eq!(ops[1].scratch_ptr(16).loc, DataLoc::Scratch(16));
    }

    #[test]
    fn test_reset_attaches_session() {
        let mut op = CryptoOp::default();
        op.status = OpStatus::Success;
        op.scratch_mut()[0] = 0xAB;

        op.reset(SessionAttach::Crypto(CryptoSessionHandle(7)));
        assert_eq!(op.status, OpStatus::NotProcessed);
        assert_eq!(
            op.session,
            Some(SessionAttach::Crypto(CryptoSessionHandle(7)))
        );
        assert_eq!(op.sym, SymOp::Empty);
        assert_eq!(op.scratch()[0], 0xAB);
    }
}
