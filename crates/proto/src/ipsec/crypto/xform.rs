//! Crypto transform descriptions
//!
//! A [`CryptoXform`] names the algorithms and keys of one SA direction. The
//! SA only keeps the layout it implies; keys go to the crypto device when the
//! session is created.

use std::fmt;

use corvid_platform::OP_SCRATCH_SIZE;
use zeroize::Zeroizing;

use super::cipher::{AeadAlgorithm, AuthAlgorithm, CipherAlgorithm};
use crate::ipsec::{Error, Result};

/// Largest IV / nonce block written into an op's scratch area
pub const MAX_OP_IV_LEN: usize = 16;

/// Secret key material, wiped on drop
#[derive(Clone, Default)]
pub struct CryptoKey(Zeroizing<Vec<u8>>);

impl CryptoKey {
    /// Copy `bytes` into a new key
    pub fn new(bytes: &[u8]) -> Self {
        CryptoKey(Zeroizing::new(bytes.to_vec()))
    }

    /// Key length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is empty (NULL algorithms)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoKey([REDACTED; {} bytes])", self.0.len())
    }
}

impl From<&[u8]> for CryptoKey {
    fn from(bytes: &[u8]) -> Self {
        CryptoKey::new(bytes)
    }
}

/// Direction a crypto session runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptoDirection {
    /// Encrypt and generate digest
    Encrypt,
    /// Verify digest and decrypt
    Decrypt,
}

/// AEAD transform
#[derive(Debug, Clone)]
pub struct AeadXform {
    /// Algorithm
    pub algo: AeadAlgorithm,
    /// Key
    pub key: CryptoKey,
    /// Offset of the nonce block inside the op scratch area
    pub iv_offset: u16,
    /// Tag length
    pub digest_len: u16,
    /// Associated data length (8, or 12 with ESN)
    pub aad_len: u16,
}

/// Cipher half of a cipher + auth transform
#[derive(Debug, Clone)]
pub struct CipherXform {
    /// Algorithm
    pub algo: CipherAlgorithm,
    /// Key
    pub key: CryptoKey,
    /// Offset of the IV / counter block inside the op scratch area
    pub iv_offset: u16,
}

/// Auth half of a cipher + auth transform
#[derive(Debug, Clone)]
pub struct AuthXform {
    /// Algorithm
    pub algo: AuthAlgorithm,
    /// Key
    pub key: CryptoKey,
    /// Truncated digest length carried on the wire
    pub digest_len: u16,
    /// Offset of the nonce block (GMAC only)
    pub iv_offset: u16,
}

/// Algorithms and keys for one SA direction
#[derive(Debug, Clone)]
pub enum CryptoXform {
    /// Single-pass AEAD
    Aead(AeadXform),
    /// Cipher followed by a separate integrity algorithm
    CipherAuth {
        /// Cipher transform
        cipher: CipherXform,
        /// Auth transform
        auth: AuthXform,
    },
}

impl CryptoXform {
    /// AEAD transform with the nonce at scratch offset 0 and a 16-byte tag
    pub fn aead(algo: AeadAlgorithm, key: &[u8], esn: bool) -> Self {
        CryptoXform::Aead(AeadXform {
            algo,
            key: CryptoKey::new(key),
            iv_offset: 0,
            digest_len: 16,
            aad_len: if esn { 12 } else { 8 },
        })
    }

    /// Cipher + auth transform with the IV at scratch offset 0 and the
    /// algorithm's default digest length
    pub fn cipher_auth(
        cipher: CipherAlgorithm,
        cipher_key: &[u8],
        auth: AuthAlgorithm,
        auth_key: &[u8],
    ) -> Self {
        CryptoXform::CipherAuth {
            cipher: CipherXform {
                algo: cipher,
                key: CryptoKey::new(cipher_key),
                iv_offset: 0,
            },
            auth: AuthXform {
                algo: auth,
                key: CryptoKey::new(auth_key),
                digest_len: auth.default_digest_len() as u16,
                iv_offset: 0,
            },
        }
    }

    /// Whether this is an AEAD transform
    pub fn is_aead(&self) -> bool {
        matches!(self, CryptoXform::Aead(_))
    }

    /// ICV length on the wire
    pub fn digest_len(&self) -> usize {
        match self {
            CryptoXform::Aead(a) => a.digest_len as usize,
            CryptoXform::CipherAuth { auth, .. } => auth.digest_len as usize,
        }
    }

    /// Scratch offset the IV / nonce block is written to
    pub fn iv_offset(&self) -> usize {
        match self {
            CryptoXform::Aead(a) => a.iv_offset as usize,
            CryptoXform::CipherAuth { cipher, auth } => {
                if auth.algo == AuthAlgorithm::AesGmac {
                    auth.iv_offset as usize
                } else {
                    cipher.iv_offset as usize
                }
            }
        }
    }

    /// Validate algorithm combination, key sizes and layout
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKeyLength`] for bad key sizes,
    /// [`Error::NotSupported`] for unsupported combinations and
    /// [`Error::InvalidParameter`] for bad digest / AAD / IV layout.
    pub fn validate(&self) -> Result<()> {
        if self.iv_offset() + MAX_OP_IV_LEN > OP_SCRATCH_SIZE {
            return Err(Error::InvalidParameter(format!(
                "iv offset {} leaves no room for a {}-byte IV in {}-byte op scratch",
                self.iv_offset(),
                MAX_OP_IV_LEN,
                OP_SCRATCH_SIZE
            )));
        }

        match self {
            CryptoXform::Aead(a) => {
                check_key_len(a.algo.key_lens(), a.key.len())?;
                if a.digest_len as usize != a.algo.tag_len() {
                    return Err(Error::InvalidParameter(format!(
                        "AEAD digest length must be {}, got {}",
                        a.algo.tag_len(),
                        a.digest_len
                    )));
                }
                if a.aad_len != 8 && a.aad_len != 12 {
                    return Err(Error::InvalidParameter(format!(
                        "AEAD AAD length must be 8 or 12, got {}",
                        a.aad_len
                    )));
                }
            }
            CryptoXform::CipherAuth { cipher, auth } => {
                check_key_len(cipher.algo.key_lens(), cipher.key.len())?;
                check_key_len(auth.algo.key_lens(), auth.key.len())?;

                if auth.algo == AuthAlgorithm::AesGmac && cipher.algo != CipherAlgorithm::Null {
                    return Err(Error::NotSupported(
                        "AES-GMAC is only defined with the NULL cipher".into(),
                    ));
                }

                let digest_len = auth.digest_len as usize;
                let valid = match auth.algo {
                    AuthAlgorithm::Null => digest_len == 0,
                    AuthAlgorithm::AesGmac => digest_len == 16,
                    _ => {
                        digest_len >= 12
                            && digest_len <= auth.algo.max_digest_len()
                            && digest_len % 4 == 0
                    }
                };
                if !valid {
                    return Err(Error::InvalidParameter(format!(
                        "digest length {} not valid for {:?}",
                        digest_len, auth.algo
                    )));
                }
            }
        }

        Ok(())
    }
}

fn check_key_len(allowed: &[usize], actual: usize) -> Result<()> {
    if allowed.contains(&actual) {
        Ok(())
    } else {
        Err(Error::InvalidKeyLength {
            expected: allowed.first().copied().unwrap_or(0),
            actual,
        })
    }
}
