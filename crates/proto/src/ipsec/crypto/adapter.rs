//! Crypto operation filling
//!
//! Turns the per-packet layout computed by the transforms into a
//! [`CryptoOp`]: region offsets, digest and AAD locations, and the IV /
//! nonce block in the op's scratch area. The algorithm branch is a plain
//! `match` on the SA's fixed [`AlgoType`].

use corvid_platform::{CryptoOp, DataPtr, DataRegion, Mbuf, SessionAttach, SymOp};

use crate::ipsec::esp::fill_aad;
use crate::ipsec::sa::{AlgoType, Sa};
use crate::ipsec::{Error, Result};

/// Per-packet crypto layout, all offsets from the packet start
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpLayout {
    /// ESP header
    pub esp_ofs: usize,
    /// Encrypted region length
    pub cipher_len: usize,
    /// Authenticated region length
    pub auth_len: usize,
    /// Digest (ICV)
    pub icv_ofs: usize,
    /// AEAD associated data, placed right after the ICV
    pub aad_ofs: usize,
}

impl OpLayout {
    /// Outbound layout for a packet whose padded payload is `clen` bytes
    pub(crate) fn outbound(sa: &Sa, esp_ofs: usize, clen: usize, icv_ofs: usize) -> Self {
        OpLayout {
            esp_ofs,
            cipher_len: sa.ctp.cipher.length as usize + clen,
            auth_len: sa.ctp.auth.length as usize + clen,
            icv_ofs,
            aad_ofs: icv_ofs + sa.icv_len,
        }
    }

    /// Inbound layout; `plen` runs from the ESP header to the packet end
    pub(crate) fn inbound(sa: &Sa, esp_ofs: usize, plen: usize, icv_ofs: usize) -> Self {
        OpLayout {
            esp_ofs,
            cipher_len: plen - sa.ctp.cipher.length as usize,
            auth_len: plen - sa.ctp.auth.length as usize,
            icv_ofs,
            aad_ofs: icv_ofs + sa.icv_len,
        }
    }
}

/// Fill `op` for one packet
///
/// `iv` is the explicit IV as it appears in the packet. For AEAD SAs the
/// associated data for `sqn` is written into the packet at `layout.aad_ofs`.
///
/// # Errors
///
/// Returns [`Error::Platform`] if a location is not addressable in `mb`
pub(crate) fn fill_op(
    sa: &Sa,
    op: &mut CryptoOp,
    mb: &mut Mbuf,
    session: SessionAttach,
    layout: &OpLayout,
    iv: &[u8],
    sqn: u64,
) -> Result<()> {
    op.reset(session);
    fill_iv(sa, op, iv, sa.ty.is_outbound());

    let region = |offset: u32, len: usize| -> Result<DataRegion> {
        let start = layout.esp_ofs + offset as usize;
        let to_u32 = |v: usize| {
            u32::try_from(v).map_err(|_| Error::InvalidLength {
                expected: u32::MAX as usize,
                actual: v,
            })
        };
        Ok(DataRegion::new(to_u32(start)?, to_u32(len)?))
    };
    let digest = DataPtr::packet(layout.icv_ofs, mb.iova_at(layout.icv_ofs)?);

    op.sym = if sa.algo.is_aead() {
        let mut aad = [0u8; 12];
        let aad_len = fill_aad(&mut aad, sa.spi, sqn, sa.esn());
        mb.copy_in(layout.aad_ofs, &aad[..aad_len])?;

        SymOp::Aead {
            data: region(sa.ctp.cipher.offset, layout.cipher_len)?,
            digest,
            aad: DataPtr::packet(layout.aad_ofs, mb.iova_at(layout.aad_ofs)?),
        }
    } else {
        SymOp::CipherAuth {
            cipher: region(sa.ctp.cipher.offset, layout.cipher_len)?,
            auth: region(sa.ctp.auth.offset, layout.auth_len)?,
            digest,
        }
    };

    Ok(())
}

/// Write the IV / nonce block for `iv` into the op scratch area
///
/// `zero_cbc_iv` selects the outbound CBC layout, where the in-packet IV is
/// encrypted as the first block under an all-zero op IV.
pub(crate) fn fill_iv(sa: &Sa, op: &mut CryptoOp, iv: &[u8], zero_cbc_iv: bool) {
    let salt = sa.salt.to_be_bytes();
    let block = &mut op.scratch_mut()[sa.iv_ofs..sa.iv_ofs + 16];

    match sa.algo {
        AlgoType::Null => {}
        AlgoType::AesCbc => {
            if zero_cbc_iv {
                block.fill(0);
            } else {
                block.copy_from_slice(&iv[..16]);
            }
        }
        // salt || iv || counter 1
        AlgoType::AesGcm | AlgoType::AesCtr => {
            block[..4].copy_from_slice(&salt);
            block[4..12].copy_from_slice(&iv[..8]);
            block[12..].copy_from_slice(&1u32.to_be_bytes());
        }
        // salt || iv
        AlgoType::ChaCha20Poly1305 | AlgoType::AesGmac => {
            block[..4].copy_from_slice(&salt);
            block[4..12].copy_from_slice(&iv[..8]);
            block[12..].fill(0);
        }
    }
}
