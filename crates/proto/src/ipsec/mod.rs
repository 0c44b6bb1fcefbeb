//! IPsec ESP batch transform engine (RFC 4303)
//!
//! This module turns batches of packet buffers into ESP packets and back.
//! Crypto itself runs on an external [`corvid_platform::CryptoDevice`];
//! the engine rewrites headers, lays out crypto operations and enforces
//! sequence numbering and anti-replay.
//!
//! # Architecture
//!
//! ```text
//!            Sa (params, layout, sequence state, replay window)
//!                               |
//!                    Session (crypto / security handles)
//!                               |
//!  mbufs --> prepare --> CryptoDevice::process --> crypto_group --> process --> mbufs
//!            (encap / replay check,                 (status ->       (ESN slot, trailer,
//!             fill ops)                              offload flags)   decap, replay update)
//! ```
//!
//! Every batch entry point returns the number of accepted packets. Rejected
//! packets are never dropped: they are moved to the tail of the slice in
//! their original order and the first error is reported with the count.
//!
//! # Processing strategies
//!
//! [`ActionType`] selects the prepare/process pair when the SA is built:
//!
//! - `LookasideNone`: headers and crypto ops here, crypto on a lookaside device
//! - `InlineCrypto`: headers here, crypto by the NIC on the wire
//! - `InlineProtocol`, `LookasideProtocol`: everything offloaded, the engine
//!   attaches sessions and checks completion flags
//!
//! # Quick Start
//!
//! ```rust
//! use corvid_platform::{CryptoOp, Mbuf};
//! use corvid_proto::ipsec::{
//!     crypto::{CipherAlgorithm, AuthAlgorithm, CryptoDirection, CryptoXform, SoftCryptoDevice},
//!     Direction, Mode, Sa, SaParams, Session, SessionBinding,
//! };
//!
//! # fn main() -> corvid_proto::ipsec::Result<()> {
//! let xform = CryptoXform::cipher_auth(
//!     CipherAlgorithm::AesCbc,
//!     &[1; 16],
//!     AuthAlgorithm::HmacSha256,
//!     &[2; 32],
//! );
//! let params = |direction| {
//!     SaParams::builder()
//!         .with_spi(0x2000)
//!         .with_direction(direction)
//!         .with_mode(Mode::Transport)
//!         .with_crypto(xform.clone())
//!         .build()
//! };
//! let out_sa = Sa::new(&params(Direction::Outbound)?)?;
//! let in_sa = Sa::new(&params(Direction::Inbound)?)?;
//!
//! let dev = SoftCryptoDevice::new();
//! let enc = dev.create_session(&xform, CryptoDirection::Encrypt)?;
//! let dec = dev.create_session(&xform, CryptoDirection::Decrypt)?;
//!
//! let mut ip = vec![0u8; 48];
//! ip[0] = 0x45;
//! ip[2..4].copy_from_slice(&48u16.to_be_bytes());
//! ip[9] = 17;
//!
//! let mut mbufs = vec![Mbuf::from_bytes(&ip, 64, 128).with_header_lens(0, 20)];
//! let mut ops = CryptoOp::batch(1, 0);
//!
//! Session::new(&out_sa, SessionBinding::Crypto(enc))?.run(&dev, &mut mbufs, &mut ops)?;
//! Session::new(&in_sa, SessionBinding::Crypto(dec))?.run(&dev, &mut mbufs, &mut ops)?;
//!
//! assert_eq!(mbufs[0].to_vec(), ip);
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Keys are wrapped in zeroizing buffers and redacted from `Debug` output
//! - ICVs are compared in constant time by the software crypto device
//! - Anti-replay window per RFC 4303 §3.4.3, with ESN reconstruction
//! - `Sa::fini` wipes the salt, sequence counters and replay state
//!
//! # References
//!
//! - [RFC 4303](https://datatracker.ietf.org/doc/html/rfc4303) - IP Encapsulating Security Payload (ESP)
//! - [RFC 4106](https://datatracker.ietf.org/doc/html/rfc4106) - AES-GCM in ESP
//! - [RFC 7634](https://datatracker.ietf.org/doc/html/rfc7634) - ChaCha20-Poly1305 in IKE and IPsec
//! - [RFC 3686](https://datatracker.ietf.org/doc/html/rfc3686) - AES-CTR in ESP
//! - [RFC 4543](https://datatracker.ietf.org/doc/html/rfc4543) - AES-GMAC in ESP

pub mod batch;
pub mod config;
pub mod crypto;
pub mod error;
pub mod esp;
mod inbound;
pub mod iph;
pub mod logging;
pub mod metrics;
mod outbound;
pub mod replay;
pub mod sa;
pub mod session;
pub mod sqn;

pub use batch::{crypto_group, move_bad, BatchOutcome, CryptoGroup};
pub use config::{
    ActionType, Direction, IpVersion, IpsecProtocol, Mode, SaParams, SaParamsBuilder,
    TunnelHeader,
};
pub use error::{Error, ErrorClass, Result};
pub use metrics::{SaStats, SaStatsSnapshot};
pub use replay::{reconstruct_esn, ReplayWindow};
pub use sa::{AlgoType, CryptoOffsets, Sa, SaType};
pub use session::{Session, SessionBinding};
