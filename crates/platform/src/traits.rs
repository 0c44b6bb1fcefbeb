//! Device traits at the engine boundary

use crate::crypto::{CryptoOp, SecuritySessionHandle};
use crate::mbuf::Mbuf;

/// Symmetric crypto execution backend
///
/// Implemented by software cipher libraries and by lookaside accelerators.
pub trait CryptoDevice: Send + Sync {
    /// Device name
    fn name(&self) -> &'static str;

    /// Execute `ops` against the packets they describe
    ///
    /// `ops[i]` refers to `mbufs[i]`; only the first `min(ops.len(), mbufs.len())`
    /// pairs are executed. Every executed op gets a final [`crate::OpStatus`].
    ///
    /// # Returns
    ///
    /// Number of ops that completed with [`crate::OpStatus::Success`]
    fn process(&self, ops: &mut [CryptoOp], mbufs: &mut [Mbuf]) -> usize;
}

/// Security (full protocol offload) context of a NIC or accelerator
pub trait SecurityContext: Send + Sync {
    /// Whether transmitted packets need per-packet session metadata
    fn needs_pkt_metadata(&self) -> bool {
        true
    }

    /// Attach session metadata to a packet about to be transmitted
    fn set_pkt_metadata(&self, session: SecuritySessionHandle, mbuf: &mut Mbuf) {
        mbuf.sec_session = Some(session);
    }
}
