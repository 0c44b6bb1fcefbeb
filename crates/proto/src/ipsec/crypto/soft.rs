//! Software crypto device
//!
//! Runs prepared [`CryptoOp`]s with the RustCrypto primitives in
//! [`super::cipher`]. Each region is copied out of the (possibly segmented)
//! packet, transformed and copied back, so the device works on any
//! [`Mbuf`] layout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use corvid_platform::{
    CryptoDevice, CryptoOp, CryptoSessionHandle, DataLoc, DataPtr, DataRegion, Mbuf, OpStatus,
    SessionAttach, SymOp,
};
use parking_lot::RwLock;
use tracing::trace;

use super::cipher::{AuthAlgorithm, AEAD_NONCE_LEN, AES_BLOCK_LEN};
use super::xform::{CryptoDirection, CryptoXform};
use crate::ipsec::{Error, Result};

#[derive(Debug)]
struct SoftSession {
    xform: CryptoXform,
    direction: CryptoDirection,
}

/// Crypto device backed by software ciphers
#[derive(Debug)]
pub struct SoftCryptoDevice {
    sessions: RwLock<HashMap<u64, SoftSession>>,
    next_id: AtomicU64,
}

impl Default for SoftCryptoDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftCryptoDevice {
    /// Create a device with no sessions
    pub fn new() -> Self {
        SoftCryptoDevice {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a session for `xform` running in `direction`
    ///
    /// # Errors
    ///
    /// Returns the transform's validation error for bad keys or layouts
    pub fn create_session(
        &self,
        xform: &CryptoXform,
        direction: CryptoDirection,
    ) -> Result<CryptoSessionHandle> {
        xform.validate()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().insert(
            id,
            SoftSession {
                xform: xform.clone(),
                direction,
            },
        );
        Ok(CryptoSessionHandle(id))
    }

    /// Release a session and wipe its keys
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for an unknown handle
    pub fn destroy_session(&self, handle: CryptoSessionHandle) -> Result<()> {
        self.sessions
            .write()
            .remove(&handle.0)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidParameter(format!("unknown crypto session {}", handle.0)))
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl CryptoDevice for SoftCryptoDevice {
    fn name(&self) -> &'static str {
        "crypto_soft"
    }

    fn process(&self, ops: &mut [CryptoOp], mbufs: &mut [Mbuf]) -> usize {
        let sessions = self.sessions.read();
        let mut done = 0;

        for (op, mb) in ops.iter_mut().zip(mbufs.iter_mut()) {
            op.status = match op.session {
                Some(SessionAttach::Crypto(handle)) => match sessions.get(&handle.0) {
                    Some(sess) => match run(sess, op, mb) {
                        Ok(()) => OpStatus::Success,
                        Err(Error::CryptoError(msg)) if sess.direction == CryptoDirection::Decrypt => {
                            trace!(session = handle.0, reason = %msg, "ICV verification failed");
                            OpStatus::AuthFailed
                        }
                        Err(err) => {
                            trace!(session = handle.0, error = %err, "crypto op failed");
                            OpStatus::Error
                        }
                    },
                    None => OpStatus::InvalidSession,
                },
                _ => OpStatus::InvalidSession,
            };

            if op.status == OpStatus::Success {
                done += 1;
            }
        }

        done
    }
}

fn run(sess: &SoftSession, op: &CryptoOp, mb: &mut Mbuf) -> Result<()> {
    let encrypt = sess.direction == CryptoDirection::Encrypt;

    match (&sess.xform, op.sym) {
        (CryptoXform::Aead(xf), SymOp::Aead { data, digest, aad }) => {
            let nonce = scratch(op, xf.iv_offset as usize, AEAD_NONCE_LEN)?;
            let aad = read_ptr(op, mb, aad, xf.aad_len as usize)?;
            let mut buf = read_region(mb, data)?;
            let key = xf.key.as_bytes();

            if encrypt {
                let tag = xf.algo.seal_in_place(key, nonce, &aad, &mut buf)?;
                mb.copy_in(data.offset as usize, &buf)?;
                write_ptr(mb, digest, &tag[..xf.digest_len as usize])
            } else {
                let tag = read_ptr(op, mb, digest, xf.digest_len as usize)?;
                xf.algo.open_in_place(key, nonce, &aad, &mut buf, &tag)?;
                mb.copy_in(data.offset as usize, &buf)?;
                Ok(())
            }
        }
        (
            CryptoXform::CipherAuth { cipher, auth },
            SymOp::CipherAuth {
                cipher: cregion,
                auth: aregion,
                digest,
            },
        ) => {
            let digest_len = auth.digest_len as usize;
            let gmac_nonce = if auth.algo == AuthAlgorithm::AesGmac {
                scratch(op, auth.iv_offset as usize, AEAD_NONCE_LEN)?
            } else {
                &[]
            };

            if encrypt {
                apply_cipher(cipher, op, mb, cregion, true)?;
                let data = read_region(mb, aregion)?;
                let mut icv = vec![0u8; digest_len];
                auth.algo
                    .sign(auth.key.as_bytes(), gmac_nonce, &data, &mut icv)?;
                write_ptr(mb, digest, &icv)
            } else {
                let data = read_region(mb, aregion)?;
                let expected = read_ptr(op, mb, digest, digest_len)?;
                auth.algo
                    .verify(auth.key.as_bytes(), gmac_nonce, &data, &expected)?;
                apply_cipher(cipher, op, mb, cregion, false)
            }
        }
        _ => Err(Error::InvalidState(
            "op layout does not match session transform".into(),
        )),
    }
}

fn apply_cipher(
    xf: &super::xform::CipherXform,
    op: &CryptoOp,
    mb: &mut Mbuf,
    region: DataRegion,
    encrypt: bool,
) -> Result<()> {
    if xf.algo == super::cipher::CipherAlgorithm::Null {
        return Ok(());
    }

    let iv = scratch(op, xf.iv_offset as usize, AES_BLOCK_LEN)?;
    let mut buf = read_region(mb, region)?;
    if encrypt {
        xf.algo.encrypt_in_place(xf.key.as_bytes(), iv, &mut buf)?;
    } else {
        xf.algo.decrypt_in_place(xf.key.as_bytes(), iv, &mut buf)?;
    }
    mb.copy_in(region.offset as usize, &buf)?;
    Ok(())
}

fn scratch(op: &CryptoOp, offset: usize, len: usize) -> Result<&[u8]> {
    op.scratch()
        .get(offset..offset + len)
        .ok_or(Error::InvalidLength {
            expected: offset + len,
            actual: op.scratch().len(),
        })
}

fn read_region(mb: &Mbuf, region: DataRegion) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; region.length as usize];
    mb.copy_out(region.offset as usize, &mut buf)?;
    Ok(buf)
}

fn read_ptr(op: &CryptoOp, mb: &Mbuf, ptr: DataPtr, len: usize) -> Result<Vec<u8>> {
    match ptr.loc {
        DataLoc::Packet(offset) => {
            let mut buf = vec![0u8; len];
            mb.copy_out(offset, &mut buf)?;
            Ok(buf)
        }
        DataLoc::Scratch(offset) => Ok(scratch(op, offset, len)?.to_vec()),
    }
}

fn write_ptr(mb: &mut Mbuf, ptr: DataPtr, bytes: &[u8]) -> Result<()> {
    match ptr.loc {
        DataLoc::Packet(offset) => Ok(mb.copy_in(offset, bytes)?),
        DataLoc::Scratch(_) => Err(Error::InvalidState(
            "digest must live in the packet".into(),
        )),
    }
}
