//! Security Association record
//!
//! An [`Sa`] is built once from [`SaParams`] and then shared by reference
//! with every batch that runs against it. All per-packet layout arithmetic
//! (IV length, padding alignment, crypto region offsets) is resolved here so
//! the transforms only add packet lengths to precomputed values.
//!
//! Construction is two-phase, like a fixed-memory allocator would want it:
//!
//! ```
//! use corvid_proto::ipsec::{
//!     crypto::{AeadAlgorithm, CryptoXform},
//!     Direction, Mode, Sa, SaParams,
//! };
//!
//! # fn main() -> corvid_proto::ipsec::Result<()> {
//! let params = SaParams::builder()
//!     .with_spi(0x1000)
//!     .with_direction(Direction::Inbound)
//!     .with_mode(Mode::Transport)
//!     .with_crypto(CryptoXform::aead(AeadAlgorithm::AesGcm, &[7; 16], false))
//!     .build()?;
//!
//! let size = Sa::size(&params)?;
//! let mut sa = Sa::init(&params, size)?;
//! assert_eq!(sa.spi(), 0x1000);
//! sa.fini();
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::mem::size_of;

use bitflags::bitflags;
use corvid_platform::DataRegion;
use parking_lot::RwLock;
use zeroize::Zeroize;

use super::config::{ActionType, Direction, IpVersion, IpsecProtocol, Mode, SaParams, TunnelHeader};
use super::crypto::{AuthAlgorithm, CipherAlgorithm, CryptoXform};
use super::esp::{ESP_HDR_LEN, SQH_LEN};
use super::logging;
use super::metrics::SaStats;
use super::replay::{bucket_count, ReplaySqn, ReplayWindow, MAX_WINDOW_SIZE, WINDOW_BUCKET_SIZE};
use super::sqn::OutboundSqn;
use super::{Error, Result};

bitflags! {
    /// Packed SA type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SaType: u32 {
        /// Outbound (encapsulating) SA
        const OUTBOUND = 1 << 0;
        /// Protected packet is IPv6 (inner header in tunnel mode)
        const IPV6 = 1 << 1;
        /// Tunnel mode with an IPv4 outer header
        const TUNNEL_V4 = 1 << 2;
        /// Tunnel mode with an IPv6 outer header
        const TUNNEL_V6 = 1 << 3;
        /// Extended sequence numbers
        const ESN = 1 << 4;
        /// Atomic sequence discipline
        const SQN_ATOMIC = 1 << 5;
        /// Single-pass AEAD algorithm
        const AEAD = 1 << 6;
    }
}

impl SaType {
    /// Whether the SA runs in tunnel mode
    pub fn is_tunnel(self) -> bool {
        self.intersects(SaType::TUNNEL_V4 | SaType::TUNNEL_V6)
    }

    /// Whether the SA encapsulates
    pub fn is_outbound(self) -> bool {
        self.contains(SaType::OUTBOUND)
    }
}

/// Algorithm layout of an SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgoType {
    /// NULL cipher (with HMAC or no integrity)
    Null,
    /// AES-CBC + HMAC
    AesCbc,
    /// AES-CTR + HMAC
    AesCtr,
    /// AES-GCM
    AesGcm,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
    /// NULL cipher + AES-GMAC
    AesGmac,
}

impl AlgoType {
    fn from_xform(xform: &CryptoXform) -> Self {
        use super::crypto::AeadAlgorithm;

        match xform {
            CryptoXform::Aead(a) => match a.algo {
                AeadAlgorithm::AesGcm => AlgoType::AesGcm,
                AeadAlgorithm::ChaCha20Poly1305 => AlgoType::ChaCha20Poly1305,
            },
            CryptoXform::CipherAuth { cipher, auth } => match (cipher.algo, auth.algo) {
                (CipherAlgorithm::Null, AuthAlgorithm::AesGmac) => AlgoType::AesGmac,
                (CipherAlgorithm::Null, _) => AlgoType::Null,
                (CipherAlgorithm::AesCbc, _) => AlgoType::AesCbc,
                (CipherAlgorithm::AesCtr, _) => AlgoType::AesCtr,
            },
        }
    }

    /// Whether the algorithm is a single-pass AEAD
    pub fn is_aead(self) -> bool {
        matches!(self, AlgoType::AesGcm | AlgoType::ChaCha20Poly1305)
    }

    /// Explicit IV carried in each packet
    pub fn iv_len(self) -> usize {
        match self {
            AlgoType::Null => 0,
            AlgoType::AesCbc => 16,
            AlgoType::AesCtr | AlgoType::AesGcm | AlgoType::ChaCha20Poly1305 | AlgoType::AesGmac => 8,
        }
    }

    /// Required alignment of payload + padding + trailer
    pub fn pad_align(self) -> usize {
        match self {
            AlgoType::AesCbc => 16,
            _ => 4,
        }
    }

    /// Short name for logs
    pub fn name(self) -> &'static str {
        match self {
            AlgoType::Null => "null",
            AlgoType::AesCbc => "aes-cbc",
            AlgoType::AesCtr => "aes-ctr",
            AlgoType::AesGcm => "aes-gcm",
            AlgoType::ChaCha20Poly1305 => "chacha20-poly1305",
            AlgoType::AesGmac => "aes-gmac",
        }
    }
}

impl fmt::Display for AlgoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Precomputed crypto regions, relative to the start of the ESP header
///
/// Outbound, the per-packet region is `{esp + offset, length + clen}` where
/// `clen` is the padded payload length. Inbound, it is
/// `{esp + offset, plen - length}` where `plen` runs from the ESP header to
/// the end of the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CryptoOffsets {
    /// Encrypted region
    pub cipher: DataRegion,
    /// Authenticated region
    pub auth: DataRegion,
}

impl CryptoOffsets {
    fn outbound(algo: AlgoType, iv_len: usize, sqh_len: usize) -> Self {
        let hdr = (ESP_HDR_LEN + iv_len) as u32;
        let cipher = match algo {
            // the in-packet IV is encrypted too, under a zero op IV
            AlgoType::AesCbc => DataRegion::new(ESP_HDR_LEN as u32, iv_len as u32),
            AlgoType::AesGmac => DataRegion::new(0, 0),
            _ => DataRegion::new(hdr, 0),
        };
        let auth = if algo.is_aead() {
            cipher
        } else {
            DataRegion::new(0, hdr + sqh_len as u32)
        };
        CryptoOffsets { cipher, auth }
    }

    fn inbound(algo: AlgoType, iv_len: usize, icv_len: usize, sqh_len: usize) -> Self {
        let hdr = (ESP_HDR_LEN + iv_len) as u32;
        let cipher = DataRegion::new(hdr, icv_len as u32 + hdr);
        let auth = if algo.is_aead() {
            cipher
        } else {
            DataRegion::new(0, (icv_len - sqh_len) as u32)
        };
        CryptoOffsets { cipher, auth }
    }
}

/// Prepare stage bound to an SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrepareKind {
    /// Nothing to prepare, packets go straight to process
    None,
    OutboundTunnel,
    OutboundTransport,
    Inbound,
    /// Attach the security session to each op
    SecuritySession,
}

/// Process stage bound to an SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessKind {
    /// Remove the ESN high-bits slot after crypto
    OutboundSqh,
    /// Inspect the offload-failed flag only
    CheckFlags,
    /// Decapsulate, `inline` packets carry no ESN slot
    Inbound { tunnel: bool, inline: bool },
    /// Rewrite headers for inline crypto
    InlineOutbound { tunnel: bool },
    /// Mark packets for inline protocol offload
    InlineProtocolOutbound,
}

/// Security Association
#[derive(Debug)]
pub struct Sa {
    pub(crate) ty: SaType,
    pub(crate) spi: u32,
    pub(crate) salt: u32,
    /// Next protocol written to / expected in the trailer of tunnel packets
    pub(crate) proto: u8,
    pub(crate) algo: AlgoType,
    pub(crate) action: ActionType,
    pub(crate) icv_len: usize,
    pub(crate) iv_len: usize,
    pub(crate) iv_ofs: usize,
    pub(crate) aad_len: usize,
    pub(crate) sqh_len: usize,
    pub(crate) pad_align: usize,
    pub(crate) ctp: CryptoOffsets,
    pub(crate) ip_version: IpVersion,
    pub(crate) tunnel: Option<TunnelHeader>,
    pub(crate) replay_window: u32,
    pub(crate) outbound: Option<OutboundSqn>,
    pub(crate) replay: Option<ReplaySqn>,
    pub(crate) stats: SaStats,
    pub(crate) prepare: PrepareKind,
    pub(crate) process: ProcessKind,
    size: usize,
}

impl Sa {
    /// Bytes needed for an SA built from `params`
    ///
    /// # Errors
    ///
    /// Same as [`Sa::init`] for parameter problems
    pub fn size(params: &SaParams) -> Result<usize> {
        check_params(params)?;

        let mut size = size_of::<Sa>();
        if let Some(hdr) = &params.tunnel {
            size += hdr.len();
        }
        let window = effective_window(params);
        if params.direction == Direction::Inbound && window > 0 {
            let snapshots = if params.atomic_sqn { 2 } else { 1 };
            size += snapshots
                * (size_of::<RwLock<ReplayWindow>>() + bucket_count(window) * size_of::<u64>());
        }
        Ok(size)
    }

    /// Build an SA from `params` within a budget of `size` bytes
    ///
    /// # Errors
    ///
    /// - [`Error::NotSupported`] for AH
    /// - [`Error::InvalidParameter`] / [`Error::InvalidKeyLength`] for bad parameters
    /// - [`Error::InsufficientMemory`] if `size` is below [`Sa::size`]
    pub fn init(params: &SaParams, size: usize) -> Result<Sa> {
        let required = Self::size(params)?;
        if size < required {
            return Err(Error::InsufficientMemory {
                required,
                provided: size,
            });
        }

        let algo = AlgoType::from_xform(&params.crypto);
        let outbound = params.direction == Direction::Outbound;

        let mut ty = SaType::empty();
        ty.set(SaType::OUTBOUND, outbound);
        ty.set(SaType::IPV6, params.ip_version == IpVersion::V6);
        ty.set(SaType::TUNNEL_V4, params.mode == Mode::Tunnel(IpVersion::V4));
        ty.set(SaType::TUNNEL_V6, params.mode == Mode::Tunnel(IpVersion::V6));
        ty.set(SaType::ESN, params.esn);
        ty.set(SaType::SQN_ATOMIC, params.atomic_sqn);
        ty.set(SaType::AEAD, algo.is_aead());

        let iv_len = algo.iv_len();
        let icv_len = params.crypto.digest_len();
        let sqh_len = if params.esn && !algo.is_aead() { SQH_LEN } else { 0 };
        let aad_len = match &params.crypto {
            CryptoXform::Aead(a) => a.aad_len as usize,
            CryptoXform::CipherAuth { .. } => 0,
        };
        let ctp = if outbound {
            CryptoOffsets::outbound(algo, iv_len, sqh_len)
        } else {
            CryptoOffsets::inbound(algo, iv_len, icv_len, sqh_len)
        };

        let window = effective_window(params);
        let replay = (!outbound && window > 0)
            .then(|| ReplaySqn::new(window, params.initial_sqn, params.atomic_sqn));
        let outbound_sqn =
            outbound.then(|| OutboundSqn::new(params.initial_sqn, params.esn, params.atomic_sqn));

        let (prepare, process) = select_funcs(params, sqh_len);

        let sa = Sa {
            ty,
            spi: params.spi,
            salt: params.salt,
            proto: params.inner_proto(),
            algo,
            action: params.action,
            icv_len,
            iv_len,
            iv_ofs: params.crypto.iv_offset(),
            aad_len,
            sqh_len,
            pad_align: algo.pad_align(),
            ctp,
            ip_version: params.ip_version,
            tunnel: if outbound { params.tunnel.clone() } else { None },
            replay_window: window,
            outbound: outbound_sqn,
            replay,
            stats: SaStats::new(),
            prepare,
            process,
            size: required,
        };

        logging::log_sa_created(
            sa.spi,
            if outbound { "outbound" } else { "inbound" },
            mode_name(params.mode),
            algo.name(),
            required,
        );
        if let Some(hdr) = &sa.tunnel {
            logging::log_tunnel_template(sa.spi, hdr.as_bytes());
        }

        Ok(sa)
    }

    /// Build an SA with exactly the memory it needs
    pub fn new(params: &SaParams) -> Result<Sa> {
        let size = Self::size(params)?;
        Self::init(params, size)
    }

    /// Tear the SA down: zero the salt, sequence state and replay window
    pub fn fini(&mut self) {
        self.salt.zeroize();
        if let Some(sqn) = &self.outbound {
            sqn.clear();
        }
        if let Some(rsn) = &self.replay {
            rsn.clear();
        }
        self.stats.reset();
        logging::log_sa_destroyed(self.spi);
    }

    /// Security Parameter Index
    pub fn spi(&self) -> u32 {
        self.spi
    }

    /// Packed type
    pub fn sa_type(&self) -> SaType {
        self.ty
    }

    /// Algorithm layout
    pub fn algo(&self) -> AlgoType {
        self.algo
    }

    /// Processing strategy
    pub fn action(&self) -> ActionType {
        self.action
    }

    /// ICV length on the wire
    pub fn icv_len(&self) -> usize {
        self.icv_len
    }

    /// Explicit IV length
    pub fn iv_len(&self) -> usize {
        self.iv_len
    }

    /// AEAD associated data length
    pub fn aad_len(&self) -> usize {
        self.aad_len
    }

    /// Bytes of ESN high bits authenticated but not transmitted
    pub fn sqh_len(&self) -> usize {
        self.sqh_len
    }

    /// Padding alignment
    pub fn pad_align(&self) -> usize {
        self.pad_align
    }

    /// Precomputed crypto regions
    pub fn crypto_offsets(&self) -> CryptoOffsets {
        self.ctp
    }

    /// Effective anti-replay window size (0 when disabled)
    pub fn replay_window(&self) -> u32 {
        self.replay_window
    }

    /// Bytes accounted for this SA
    pub fn mem_size(&self) -> usize {
        self.size
    }

    /// Next outbound sequence number
    pub fn next_sqn(&self) -> Option<u64> {
        self.outbound.as_ref().map(OutboundSqn::peek)
    }

    /// Highest sequence number accepted inbound
    pub fn replay_high(&self) -> Option<u64> {
        self.replay.as_ref().map(|r| r.read().high())
    }

    /// Counters
    pub fn stats(&self) -> &SaStats {
        &self.stats
    }

    pub(crate) fn esn(&self) -> bool {
        self.ty.contains(SaType::ESN)
    }

    /// Full sequence number of an inbound packet carrying `low`
    pub(crate) fn inbound_sqn(&self, high: u64, low: u32) -> u64 {
        if self.esn() {
            super::replay::reconstruct_esn(high, low, self.replay_window)
        } else {
            low as u64
        }
    }
}

fn check_params(params: &SaParams) -> Result<()> {
    if params.protocol == IpsecProtocol::Ah {
        return Err(Error::NotSupported("AH protocol".into()));
    }
    params.validate()?;

    if params.direction == Direction::Inbound && params.replay_window > MAX_WINDOW_SIZE {
        return Err(Error::InvalidParameter(format!(
            "replay window {} exceeds {}",
            params.replay_window, MAX_WINDOW_SIZE
        )));
    }
    Ok(())
}

fn effective_window(params: &SaParams) -> u32 {
    if params.direction == Direction::Outbound {
        0
    } else if params.esn {
        params.replay_window.max(WINDOW_BUCKET_SIZE as u32)
    } else {
        params.replay_window
    }
}

fn select_funcs(params: &SaParams, sqh_len: usize) -> (PrepareKind, ProcessKind) {
    let tunnel = matches!(params.mode, Mode::Tunnel(_));
    match (params.action, params.direction) {
        (ActionType::LookasideNone, Direction::Outbound) => (
            if tunnel {
                PrepareKind::OutboundTunnel
            } else {
                PrepareKind::OutboundTransport
            },
            if sqh_len > 0 {
                ProcessKind::OutboundSqh
            } else {
                ProcessKind::CheckFlags
            },
        ),
        (ActionType::LookasideNone, Direction::Inbound) => (
            PrepareKind::Inbound,
            ProcessKind::Inbound {
                tunnel,
                inline: false,
            },
        ),
        (ActionType::InlineCrypto, Direction::Outbound) => {
            (PrepareKind::None, ProcessKind::InlineOutbound { tunnel })
        }
        (ActionType::InlineCrypto, Direction::Inbound) => (
            PrepareKind::None,
            ProcessKind::Inbound {
                tunnel,
                inline: true,
            },
        ),
        (ActionType::InlineProtocol, Direction::Outbound) => {
            (PrepareKind::None, ProcessKind::InlineProtocolOutbound)
        }
        (ActionType::InlineProtocol, Direction::Inbound) => {
            (PrepareKind::None, ProcessKind::CheckFlags)
        }
        (ActionType::LookasideProtocol, _) => {
            (PrepareKind::SecuritySession, ProcessKind::CheckFlags)
        }
    }
}

fn mode_name(mode: Mode) -> &'static str {
    match mode {
        Mode::Transport => "transport",
        Mode::Tunnel(IpVersion::V4) => "tunnel-v4",
        Mode::Tunnel(IpVersion::V6) => "tunnel-v6",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::crypto::AeadAlgorithm;
    use std::net::Ipv4Addr;

    fn inbound(crypto: CryptoXform) -> SaParams {
        SaParams::builder()
            .with_spi(0x200)
            .with_direction(Direction::Inbound)
            .with_mode(Mode::Transport)
            .with_crypto(crypto)
            .build()
            .unwrap()
    }

    fn cbc_sha256() -> CryptoXform {
        CryptoXform::cipher_auth(
            CipherAlgorithm::AesCbc,
            &[1; 16],
            AuthAlgorithm::HmacSha256,
            &[2; 32],
        )
    }

    #[test]
    fn test_two_phase_init() {
        let params = inbound(cbc_sha256());
        let size = Sa::size(&params).unwrap();
        assert!(size > size_of::<Sa>());

        assert!(matches!(
            Sa::init(&params, size - 1),
            Err(Error::InsufficientMemory { .. })
        ));
        let sa = Sa::init(&params, size).unwrap();
        assert_eq!(sa.mem_size(), size);
    }

    #[test]
    fn test_ah_not_supported() {
        let mut params = inbound(cbc_sha256());
        params.protocol = IpsecProtocol::Ah;
        assert!(matches!(Sa::new(&params), Err(Error::NotSupported(_))));
        assert!(matches!(Sa::size(&params), Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_layout_cbc_inbound() {
        let sa = Sa::new(&inbound(cbc_sha256())).unwrap();
        assert_eq!(sa.algo(), AlgoType::AesCbc);
        assert_eq!(sa.iv_len(), 16);
        assert_eq!(sa.pad_align(), 16);
        assert_eq!(sa.icv_len(), 16);
        assert_eq!(sa.sqh_len(), 0);
        assert_eq!(sa.aad_len(), 0);
        assert_eq!(sa.crypto_offsets().cipher, DataRegion::new(24, 40));
        assert_eq!(sa.crypto_offsets().auth, DataRegion::new(0, 16));
    }

    #[test]
    fn test_layout_gcm_esn_outbound() {
        let params = SaParams::builder()
            .with_spi(0x300)
            .with_direction(Direction::Outbound)
            .with_mode(Mode::Tunnel(IpVersion::V4))
            .with_tunnel_header(TunnelHeader::ipv4(
                Ipv4Addr::new(192, 0, 2, 1),
                Ipv4Addr::new(192, 0, 2, 2),
                64,
            ))
            .with_crypto(CryptoXform::aead(AeadAlgorithm::AesGcm, &[1; 16], true))
            .with_esn(true)
            .build()
            .unwrap();
        let sa = Sa::new(&params).unwrap();

        assert!(sa.sa_type().contains(SaType::OUTBOUND | SaType::ESN | SaType::AEAD));
        assert!(sa.sa_type().is_tunnel());
        assert_eq!(sa.aad_len(), 12);
        assert_eq!(sa.sqh_len(), 0);
        assert_eq!(sa.crypto_offsets().cipher, DataRegion::new(16, 0));
        assert_eq!(sa.crypto_offsets().auth, sa.crypto_offsets().cipher);
        assert_eq!(sa.next_sqn(), Some(1));
        assert_eq!(sa.replay_high(), None);
    }

    #[test]
    fn test_esn_forces_window_and_sqh() {
        let mut params = inbound(CryptoXform::cipher_auth(
            CipherAlgorithm::AesCtr,
            &[1; 16],
            AuthAlgorithm::HmacSha256,
            &[2; 32],
        ));
        params.esn = true;
        params.replay_window = 32;

        let sa = Sa::new(&params).unwrap();
        assert_eq!(sa.replay_window(), 64);
        assert_eq!(sa.sqh_len(), 4);
        assert_eq!(sa.crypto_offsets().auth, DataRegion::new(0, 12));
    }

    #[test]
    fn test_window_zero_disables_replay() {
        let mut params = inbound(cbc_sha256());
        params.replay_window = 0;
        let sa = Sa::new(&params).unwrap();
        assert_eq!(sa.replay_high(), None);
    }

    #[test]
    fn test_window_too_large() {
        let mut params = inbound(cbc_sha256());
        params.replay_window = MAX_WINDOW_SIZE + 1;
        assert!(matches!(Sa::new(&params), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_dispatch_selection() {
        let mut params = inbound(cbc_sha256());
        let sa = Sa::new(&params).unwrap();
        assert_eq!(sa.prepare, PrepareKind::Inbound);
        assert_eq!(
            sa.process,
            ProcessKind::Inbound {
                tunnel: false,
                inline: false
            }
        );

        params.action = ActionType::InlineProtocol;
        let sa = Sa::new(&params).unwrap();
        assert_eq!(sa.prepare, PrepareKind::None);
        assert_eq!(sa.process, ProcessKind::CheckFlags);

        params.action = ActionType::LookasideProtocol;
        let sa = Sa::new(&params).unwrap();
        assert_eq!(sa.prepare, PrepareKind::SecuritySession);
    }

    #[test]
    fn test_fini_zeroes_state() {
        let mut params = inbound(cbc_sha256());
        params.initial_sqn = 500;
        params.salt = 0xDEADBEEF;
        let mut sa = Sa::new(&params).unwrap();
        assert_eq!(sa.replay_high(), Some(500));

        sa.stats().record_accepted(1, 10);
        sa.fini();
        assert_eq!(sa.salt, 0);
        assert_eq!(sa.replay_high(), Some(0));
        assert_eq!(sa.stats().snapshot().packets, 0);
    }
}
