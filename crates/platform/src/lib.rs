//! # Corvid Platform
//!
//! Boundary types shared by the Corvid ESP engine and the collaborators it
//! drives: the packet buffer provider and the crypto execution backend.
//!
//! This crate provides:
//! - Segmented packet buffers (`Mbuf`, `Segment`) with offload metadata
//! - Crypto operation descriptors (`CryptoOp`, `SymOp`, `DataPtr`)
//! - Device traits (`CryptoDevice`, `SecurityContext`)
//! - Buffer error types (`PlatformError`, `PlatformResult`)
//!
//! # Examples
//!
//! ```
//! use corvid_platform::{Mbuf, PlatformResult};
//!
//! # fn main() -> PlatformResult<()> {
//! let mut mb = Mbuf::from_bytes(b"payload", 16, 16);
//! mb.prepend(4)?;
//! mb.copy_in(0, &[0xde, 0xad, 0xbe, 0xef])?;
//! mb.append(2)?;
//! assert_eq!(mb.pkt_len(), 13);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod crypto;
pub mod error;
pub mod mbuf;
pub mod traits;

pub use crypto::{
    CryptoOp, CryptoSessionHandle, DataLoc, DataPtr, DataRegion, OpStatus, SecuritySessionHandle,
    SessionAttach, SymOp, OP_SCRATCH_SIZE,
};
pub use error::{PlatformError, PlatformResult};
pub use mbuf::{shift_region, Mbuf, OffloadFlags, PacketType, Segment, DEFAULT_HEADROOM};
pub use traits::{CryptoDevice, SecurityContext};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
