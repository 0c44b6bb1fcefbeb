//! Security Association parameters
//!
//! [`SaParams`] is the complete, validated description of one SA direction.
//! It is built with [`SaParams::builder`] and handed to [`crate::ipsec::Sa::init`].

use std::net::{Ipv4Addr, Ipv6Addr};

use super::crypto::CryptoXform;
use super::iph::{IPPROTO_ESP, IPPROTO_IPIP, IPPROTO_IPV6, IPV4_HDR_LEN, IPV6_HDR_LEN};
use super::{Error, Result};

/// Largest outer header template (L2 + L3) an outbound tunnel SA may carry
pub const MAX_TUNNEL_HDR_LEN: usize = 64;

/// Default anti-replay window size
pub const DEFAULT_REPLAY_WINDOW: u32 = 64;

/// IP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IpVersion {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl IpVersion {
    /// Protocol number of this version when carried inside a tunnel
    pub fn tunnel_proto(self) -> u8 {
        match self {
            IpVersion::V4 => IPPROTO_IPIP,
            IpVersion::V6 => IPPROTO_IPV6,
        }
    }
}

/// SA direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Decapsulate received packets
    Inbound,
    /// Encapsulate packets to transmit
    Outbound,
}

/// Encapsulation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Mode {
    /// ESP inserted between the IP header and its payload
    Transport,
    /// Whole packet wrapped in a new outer header of the given version
    Tunnel(IpVersion),
}

/// IPsec protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IpsecProtocol {
    /// Encapsulating Security Payload
    Esp,
    /// Authentication Header (not provided)
    Ah,
}

/// Where crypto and header processing happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ActionType {
    /// Headers rewritten here, crypto on a lookaside device
    #[default]
    LookasideNone,
    /// Headers rewritten here, crypto done by the NIC on the wire
    InlineCrypto,
    /// Whole protocol done by the NIC on the wire
    InlineProtocol,
    /// Whole protocol done by a lookaside device
    LookasideProtocol,
}

/// Prebuilt outer header for outbound tunnel SAs
///
/// Holds an optional L2 prefix followed by the outer IP header. Per packet
/// the length field and (IPv4) the identification field are rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHeader {
    bytes: Vec<u8>,
    l3_offset: usize,
    version: IpVersion,
}

impl TunnelHeader {
    /// IPv4 outer header carrying ESP
    pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, ttl: u8) -> Self {
        let mut hdr = vec![0u8; IPV4_HDR_LEN];
        hdr[0] = 0x45;
        hdr[6] = 0x40; // DF
        hdr[8] = ttl;
        hdr[9] = IPPROTO_ESP;
        hdr[12..16].copy_from_slice(&src.octets());
        hdr[16..20].copy_from_slice(&dst.octets());

        TunnelHeader {
            bytes: hdr,
            l3_offset: 0,
            version: IpVersion::V4,
        }
    }

    /// IPv6 outer header carrying ESP
    pub fn ipv6(src: Ipv6Addr, dst: Ipv6Addr, hop_limit: u8) -> Self {
        let mut hdr = vec![0u8; IPV6_HDR_LEN];
        hdr[0] = 0x60;
        hdr[6] = IPPROTO_ESP;
        hdr[7] = hop_limit;
        hdr[8..24].copy_from_slice(&src.octets());
        hdr[24..40].copy_from_slice(&dst.octets());

        TunnelHeader {
            bytes: hdr,
            l3_offset: 0,
            version: IpVersion::V6,
        }
    }

    /// Template from raw bytes with the outer IP header at `l3_offset`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the template is too long, the
    /// offset leaves no room for an IP header, or the version nibble is
    /// neither 4 nor 6.
    pub fn from_bytes(bytes: &[u8], l3_offset: usize) -> Result<Self> {
        if bytes.len() > MAX_TUNNEL_HDR_LEN {
            return Err(Error::InvalidParameter(format!(
                "tunnel header is {} bytes, at most {} allowed",
                bytes.len(),
                MAX_TUNNEL_HDR_LEN
            )));
        }
        let l3 = bytes.get(l3_offset..).unwrap_or_default();
        let version = match l3.first().map(|b| b >> 4) {
            Some(4) if l3.len() >= IPV4_HDR_LEN => IpVersion::V4,
            Some(6) if l3.len() >= IPV6_HDR_LEN => IpVersion::V6,
            _ => {
                return Err(Error::InvalidParameter(format!(
                    "no IPv4/IPv6 header at tunnel template offset {}",
                    l3_offset
                )))
            }
        };

        Ok(TunnelHeader {
            bytes: bytes.to_vec(),
            l3_offset,
            version,
        })
    }

    /// Put `l2` in front of the IP header
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the result exceeds the template limit
    pub fn with_l2(self, l2: &[u8]) -> Result<Self> {
        let mut bytes = l2.to_vec();
        bytes.extend_from_slice(&self.bytes[self.l3_offset..]);
        Self::from_bytes(&bytes, l2.len())
    }

    /// Template bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Template length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the template is empty (never true for a valid template)
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset of the outer IP header
    pub fn l3_offset(&self) -> usize {
        self.l3_offset
    }

    /// Outer IP version
    pub fn version(&self) -> IpVersion {
        self.version
    }
}

/// Parameters of one SA direction
#[derive(Debug, Clone)]
pub struct SaParams {
    /// Security Parameter Index
    pub spi: u32,
    /// IPsec protocol
    pub protocol: IpsecProtocol,
    /// Direction
    pub direction: Direction,
    /// Encapsulation mode
    pub mode: Mode,
    /// IP version of the protected packet (inner header in tunnel mode)
    pub ip_version: IpVersion,
    /// Processing strategy
    pub action: ActionType,
    /// Algorithms and keys
    pub crypto: CryptoXform,
    /// Salt for AEAD, CTR and GMAC nonces
    pub salt: u32,
    /// Extended sequence numbers
    pub esn: bool,
    /// Allow concurrent batches against this SA
    pub atomic_sqn: bool,
    /// Anti-replay window size in packets (0 disables, inbound only)
    pub replay_window: u32,
    /// Initial sequence number (outbound counter or inbound high watermark)
    pub initial_sqn: u64,
    /// Outer header template (outbound tunnel only)
    pub tunnel: Option<TunnelHeader>,
}

impl SaParams {
    /// Create builder for SA parameters
    pub fn builder() -> SaParamsBuilder {
        SaParamsBuilder::new()
    }

    /// Validate parameters
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] (or a key length / support error
    /// from the transform) describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.spi == 0 {
            return Err(Error::InvalidParameter("SPI 0 is reserved".into()));
        }

        self.crypto.validate()?;

        if let CryptoXform::Aead(aead) = &self.crypto {
            let want = if self.esn { 12 } else { 8 };
            if aead.aad_len != want {
                return Err(Error::InvalidParameter(format!(
                    "AEAD AAD length {} does not match ESN setting (want {})",
                    aead.aad_len, want
                )));
            }
        }

        if self.esn && !self.crypto.is_aead() {
            let icv = self.crypto.digest_len();
            if icv < 4 || icv % 4 != 0 {
                return Err(Error::InvalidParameter(format!(
                    "ESN with a separate auth algorithm needs a 4-byte aligned ICV, got {}",
                    icv
                )));
            }
        }

        match (self.direction, self.mode, &self.tunnel) {
            (Direction::Outbound, Mode::Tunnel(version), Some(hdr)) => {
                if hdr.version() != version {
                    return Err(Error::InvalidParameter(format!(
                        "tunnel mode is {:?} but template header is {:?}",
                        version,
                        hdr.version()
                    )));
                }
            }
            (Direction::Outbound, Mode::Tunnel(_), None) => {
                return Err(Error::InvalidParameter(
                    "outbound tunnel SA needs a header template".into(),
                ));
            }
            _ => {}
        }

        Ok(())
    }

    /// Next protocol recorded in the ESP trailer for tunnel SAs
    pub fn inner_proto(&self) -> u8 {
        self.ip_version.tunnel_proto()
    }
}

/// Builder for [`SaParams`]
#[derive(Default)]
pub struct SaParamsBuilder {
    spi: Option<u32>,
    protocol: Option<IpsecProtocol>,
    direction: Option<Direction>,
    mode: Option<Mode>,
    ip_version: Option<IpVersion>,
    action: ActionType,
    crypto: Option<CryptoXform>,
    salt: u32,
    esn: bool,
    atomic_sqn: bool,
    replay_window: Option<u32>,
    initial_sqn: u64,
    tunnel: Option<TunnelHeader>,
}

impl SaParamsBuilder {
    /// Create new SA parameter builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set SPI
    pub fn with_spi(mut self, spi: u32) -> Self {
        self.spi = Some(spi);
        self
    }

    /// Set protocol (defaults to ESP)
    pub fn with_protocol(mut self, protocol: IpsecProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Set direction
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Set mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set the protected packet's IP version (defaults to IPv4)
    pub fn with_ip_version(mut self, version: IpVersion) -> Self {
        self.ip_version = Some(version);
        self
    }

    /// Set processing strategy
    pub fn with_action(mut self, action: ActionType) -> Self {
        self.action = action;
        self
    }

    /// Set algorithms and keys
    pub fn with_crypto(mut self, crypto: CryptoXform) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Set nonce salt
    pub fn with_salt(mut self, salt: u32) -> Self {
        self.salt = salt;
        self
    }

    /// Enable extended sequence numbers
    pub fn with_esn(mut self, esn: bool) -> Self {
        self.esn = esn;
        self
    }

    /// Use the atomic sequence discipline
    pub fn with_atomic_sqn(mut self, atomic: bool) -> Self {
        self.atomic_sqn = atomic;
        self
    }

    /// Set anti-replay window size
    pub fn with_replay_window(mut self, window: u32) -> Self {
        self.replay_window = Some(window);
        self
    }

    /// Set initial sequence number
    pub fn with_initial_sqn(mut self, sqn: u64) -> Self {
        self.initial_sqn = sqn;
        self
    }

    /// Set outer header template
    pub fn with_tunnel_header(mut self, hdr: TunnelHeader) -> Self {
        self.tunnel = Some(hdr);
        self
    }

    /// Build SaParams with validation
    pub fn build(self) -> Result<SaParams> {
        let params = SaParams {
            spi: self
                .spi
                .ok_or_else(|| Error::InvalidParameter("spi is required".into()))?,
            protocol: self.protocol.unwrap_or(IpsecProtocol::Esp),
            direction: self
                .direction
                .ok_or_else(|| Error::InvalidParameter("direction is required".into()))?,
            mode: self
                .mode
                .ok_or_else(|| Error::InvalidParameter("mode is required".into()))?,
            ip_version: self.ip_version.unwrap_or(IpVersion::V4),
            action: self.action,
            crypto: self
                .crypto
                .ok_or_else(|| Error::InvalidParameter("crypto transform is required".into()))?,
            salt: self.salt,
            esn: self.esn,
            atomic_sqn: self.atomic_sqn,
            replay_window: self.replay_window.unwrap_or(DEFAULT_REPLAY_WINDOW),
            initial_sqn: self.initial_sqn,
            tunnel: self.tunnel,
        };

        params.validate()?;
        Ok(params)
    }
}
