//! Protocol engines for the Corvid packet security stack.
//!
//! This crate provides:
//!
//! - **IPsec ESP** (Encapsulating Security Payload) - RFC 4303 batch
//!   encapsulation and decapsulation over segmented packet buffers
//!
//! # Features
//!
//! - `ipsec` (default) - ESP transform engine and software crypto device
//! - `serde` - Serialization of configuration enums and statistics snapshots
//!
//! # Example
//!
//! ```rust
//! use corvid_proto::ipsec::{esp::EspHeader, reconstruct_esn};
//!
//! let hdr = EspHeader { spi: 0x1000, seq: 7 };
//! let parsed = EspHeader::parse(&hdr.to_bytes()).unwrap();
//! assert_eq!(parsed, hdr);
//!
//! // low 32 bits wrapped past the current high watermark
//! assert_eq!(reconstruct_esn(0xFFFF_FFF0, 0x10, 64), 0x1_0000_0010);
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use the audited RustCrypto crates
//! - Constant-time ICV comparison
//! - Secure memory handling with `zeroize`
//! - Fuzz target for the inbound path
//!
//! # References
//!
//! - [RFC 4303](https://datatracker.ietf.org/doc/html/rfc4303) - IP Encapsulating Security Payload (ESP)
//! - [RFC 4301](https://datatracker.ietf.org/doc/html/rfc4301) - Security Architecture for the Internet Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ipsec")]
pub mod ipsec;
