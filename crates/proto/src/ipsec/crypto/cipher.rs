//! Cipher, AEAD and integrity primitives for ESP
//!
//! In-place primitives over contiguous byte slices. The software crypto
//! device linearizes each op's regions and calls into these.
//!
//! # Algorithms
//!
//! | Algorithm | RFC | Wire IV | Block / pad alignment |
//! |---|---|---|---|
//! | AES-GCM | RFC 4106 | 8 | 4 |
//! | ChaCha20-Poly1305 | RFC 7634 | 8 | 4 |
//! | AES-CBC | RFC 3602 | 16 | 16 |
//! | AES-CTR | RFC 3686 | 8 | 4 |
//! | AES-GMAC | RFC 4543 | 8 | 4 |
//! | HMAC-SHA-256/384/512 | RFC 4868 | - | - |

use crate::ipsec::{Error, Result};
use aes::{Aes128, Aes256};
use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes128Gcm, Aes256Gcm, Nonce as AesGcmNonce, Tag as AesGcmTag,
};
use cbc::{Decryptor, Encryptor};
use chacha20poly1305::{ChaCha20Poly1305, Nonce as ChaChaNonce, Tag as ChaChaTag};
use cipher::{generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};

/// AEAD nonce length
pub const AEAD_NONCE_LEN: usize = 12;

/// AES block size
pub const AES_BLOCK_LEN: usize = 16;

/// AEAD algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AeadAlgorithm {
    /// AES-GCM with a 128- or 256-bit key
    AesGcm,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    /// Accepted key lengths
    pub fn key_lens(self) -> &'static [usize] {
        match self {
            AeadAlgorithm::AesGcm => &[16, 32],
            AeadAlgorithm::ChaCha20Poly1305 => &[32],
        }
    }

    /// Explicit IV carried in each ESP packet
    pub fn iv_len(self) -> usize {
        8
    }

    /// Authentication tag length
    pub fn tag_len(self) -> usize {
        16
    }

    /// Payload alignment required by ESP
    pub fn pad_align(self) -> usize {
        4
    }

    /// Encrypt `buf` in place and return the tag
    ///
    /// # Arguments
    ///
    /// * `key` - AEAD key
    /// * `nonce` - 12-byte nonce (salt followed by the explicit IV)
    /// * `aad` - Associated data
    /// * `buf` - Plaintext, replaced by ciphertext
    pub fn seal_in_place(
        self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
    ) -> Result<[u8; 16]> {
        check_len("nonce", AEAD_NONCE_LEN, nonce.len())?;
        let failed = |_| Error::CryptoError(format!("{:?} encryption failed", self));

        let tag = match self {
            AeadAlgorithm::AesGcm => match key.len() {
                16 => aes128_gcm(key)?
                    .encrypt_in_place_detached(AesGcmNonce::from_slice(nonce), aad, buf)
                    .map_err(failed)?,
                32 => aes256_gcm(key)?
                    .encrypt_in_place_detached(AesGcmNonce::from_slice(nonce), aad, buf)
                    .map_err(failed)?,
                n => return Err(bad_key(16, n)),
            },
            AeadAlgorithm::ChaCha20Poly1305 => chacha(key)?
                .encrypt_in_place_detached(ChaChaNonce::from_slice(nonce), aad, buf)
                .map_err(failed)?,
        };

        Ok(tag.into())
    }

    /// Verify `tag` and decrypt `buf` in place
    ///
    /// On failure `buf` is left untouched.
    pub fn open_in_place(
        self,
        key: &[u8],
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        tag: &[u8],
    ) -> Result<()> {
        check_len("nonce", AEAD_NONCE_LEN, nonce.len())?;
        check_len("tag", self.tag_len(), tag.len())?;
        let failed = |_| Error::CryptoError(format!("{:?} authentication failed", self));

        match self {
            AeadAlgorithm::AesGcm => match key.len() {
                16 => aes128_gcm(key)?
                    .decrypt_in_place_detached(
                        AesGcmNonce::from_slice(nonce),
                        aad,
                        buf,
                        AesGcmTag::from_slice(tag),
                    )
                    .map_err(failed),
                32 => aes256_gcm(key)?
                    .decrypt_in_place_detached(
                        AesGcmNonce::from_slice(nonce),
                        aad,
                        buf,
                        AesGcmTag::from_slice(tag),
                    )
                    .map_err(failed),
                n => Err(bad_key(16, n)),
            },
            AeadAlgorithm::ChaCha20Poly1305 => chacha(key)?
                .decrypt_in_place_detached(
                    ChaChaNonce::from_slice(nonce),
                    aad,
                    buf,
                    ChaChaTag::from_slice(tag),
                )
                .map_err(failed),
        }
    }
}

/// Confidentiality algorithm of a cipher + auth SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    /// No encryption (RFC 2410)
    Null,
    /// AES-CBC
    AesCbc,
    /// AES-CTR
    AesCtr,
}

impl CipherAlgorithm {
    /// Accepted key lengths
    pub fn key_lens(self) -> &'static [usize] {
        match self {
            CipherAlgorithm::Null => &[0],
            CipherAlgorithm::AesCbc | CipherAlgorithm::AesCtr => &[16, 32],
        }
    }

    /// Explicit IV carried in each ESP packet
    pub fn iv_len(self) -> usize {
        match self {
            CipherAlgorithm::Null => 0,
            CipherAlgorithm::AesCbc => 16,
            CipherAlgorithm::AesCtr => 8,
        }
    }

    /// Payload alignment required by ESP
    pub fn pad_align(self) -> usize {
        match self {
            CipherAlgorithm::AesCbc => AES_BLOCK_LEN,
            CipherAlgorithm::Null | CipherAlgorithm::AesCtr => 4,
        }
    }

    /// Encrypt `buf` in place
    ///
    /// `iv` is the full 16-byte IV (CBC) or initial counter block (CTR).
    pub fn encrypt_in_place(self, key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
        match self {
            CipherAlgorithm::Null => Ok(()),
            CipherAlgorithm::AesCbc => {
                check_blocks(buf.len())?;
                match key.len() {
                    16 => cbc_encrypt(cbc_cipher::<Encryptor<Aes128>>(key, iv)?, buf),
                    32 => cbc_encrypt(cbc_cipher::<Encryptor<Aes256>>(key, iv)?, buf),
                    n => return Err(bad_key(16, n)),
                }
                Ok(())
            }
            CipherAlgorithm::AesCtr => ctr_apply(key, iv, buf),
        }
    }

    /// Decrypt `buf` in place
    pub fn decrypt_in_place(self, key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
        match self {
            CipherAlgorithm::Null => Ok(()),
            CipherAlgorithm::AesCbc => {
                check_blocks(buf.len())?;
                match key.len() {
                    16 => cbc_decrypt(cbc_cipher::<Decryptor<Aes128>>(key, iv)?, buf),
                    32 => cbc_decrypt(cbc_cipher::<Decryptor<Aes256>>(key, iv)?, buf),
                    n => return Err(bad_key(16, n)),
                }
                Ok(())
            }
            CipherAlgorithm::AesCtr => ctr_apply(key, iv, buf),
        }
    }
}

/// Integrity algorithm of a cipher + auth SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthAlgorithm {
    /// No integrity protection
    Null,
    /// HMAC-SHA-256-128
    HmacSha256,
    /// HMAC-SHA-384-192
    HmacSha384,
    /// HMAC-SHA-512-256
    HmacSha512,
    /// AES-GMAC (integrity only, NULL cipher)
    AesGmac,
}

impl AuthAlgorithm {
    /// Accepted key lengths
    pub fn key_lens(self) -> &'static [usize] {
        match self {
            AuthAlgorithm::Null => &[0],
            AuthAlgorithm::HmacSha256 => &[32],
            AuthAlgorithm::HmacSha384 => &[48],
            AuthAlgorithm::HmacSha512 => &[64],
            AuthAlgorithm::AesGmac => &[16, 32],
        }
    }

    /// Digest length used when none is configured
    pub fn default_digest_len(self) -> usize {
        match self {
            AuthAlgorithm::Null => 0,
            AuthAlgorithm::HmacSha256 => 16,
            AuthAlgorithm::HmacSha384 => 24,
            AuthAlgorithm::HmacSha512 => 32,
            AuthAlgorithm::AesGmac => 16,
        }
    }

    /// Untruncated digest length
    pub fn max_digest_len(self) -> usize {
        match self {
            AuthAlgorithm::Null => 0,
            AuthAlgorithm::HmacSha256 => 32,
            AuthAlgorithm::HmacSha384 => 48,
            AuthAlgorithm::HmacSha512 => 64,
            AuthAlgorithm::AesGmac => 16,
        }
    }

    /// Compute the digest of `data` into `out`, truncated to `out.len()`
    ///
    /// `nonce` is only used by GMAC (salt followed by the explicit IV).
    pub fn sign(self, key: &[u8], nonce: &[u8], data: &[u8], out: &mut [u8]) -> Result<()> {
        match self {
            AuthAlgorithm::Null => Ok(()),
            AuthAlgorithm::HmacSha256 => hmac_sha256_sign(key, data, out),
            AuthAlgorithm::HmacSha384 => hmac_sha384_sign(key, data, out),
            AuthAlgorithm::HmacSha512 => hmac_sha512_sign(key, data, out),
            AuthAlgorithm::AesGmac => {
                check_len("GMAC digest", 16, out.len())?;
                let tag = AeadAlgorithm::AesGcm.seal_in_place(key, nonce, data, &mut [])?;
                out.copy_from_slice(&tag);
                Ok(())
            }
        }
    }

    /// Verify `expected` against the digest of `data` in constant time
    pub fn verify(self, key: &[u8], nonce: &[u8], data: &[u8], expected: &[u8]) -> Result<()> {
        match self {
            AuthAlgorithm::Null => Ok(()),
            AuthAlgorithm::HmacSha256 => hmac_sha256_verify(key, data, expected),
            AuthAlgorithm::HmacSha384 => hmac_sha384_verify(key, data, expected),
            AuthAlgorithm::HmacSha512 => hmac_sha512_verify(key, data, expected),
            AuthAlgorithm::AesGmac => {
                AeadAlgorithm::AesGcm.open_in_place(key, nonce, data, &mut [], expected)
            }
        }
    }
}

fn aes128_gcm(key: &[u8]) -> Result<Aes128Gcm> {
    <Aes128Gcm as KeyInit>::new_from_slice(key).map_err(|_| bad_key(16, key.len()))
}

fn aes256_gcm(key: &[u8]) -> Result<Aes256Gcm> {
    <Aes256Gcm as KeyInit>::new_from_slice(key).map_err(|_| bad_key(32, key.len()))
}

fn chacha(key: &[u8]) -> Result<ChaCha20Poly1305> {
    <ChaCha20Poly1305 as KeyInit>::new_from_slice(key).map_err(|_| bad_key(32, key.len()))
}

fn cbc_cipher<C: KeyIvInit>(key: &[u8], iv: &[u8]) -> Result<C> {
    check_len("IV", AES_BLOCK_LEN, iv.len())?;
    C::new_from_slices(key, iv).map_err(|_| bad_key(16, key.len()))
}

fn cbc_encrypt<C: BlockEncryptMut>(mut enc: C, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(AES_BLOCK_LEN) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn cbc_decrypt<C: BlockDecryptMut>(mut dec: C, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(AES_BLOCK_LEN) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

fn ctr_apply(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    check_len("counter block", AES_BLOCK_LEN, iv.len())?;
    match key.len() {
        16 => {
            let mut ctr = <Ctr128BE<Aes128> as KeyIvInit>::new_from_slices(key, iv)
                .map_err(|_| bad_key(16, key.len()))?;
            ctr.apply_keystream(buf);
        }
        32 => {
            let mut ctr = <Ctr128BE<Aes256> as KeyIvInit>::new_from_slices(key, iv)
                .map_err(|_| bad_key(32, key.len()))?;
            ctr.apply_keystream(buf);
        }
        n => return Err(bad_key(16, n)),
    }
    Ok(())
}

macro_rules! hmac_digest {
    ($sign:ident, $verify:ident, $digest:ty) => {
        fn $sign(key: &[u8], data: &[u8], out: &mut [u8]) -> Result<()> {
            let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key)
                .map_err(|_| Error::CryptoError("invalid HMAC key".into()))?;
            mac.update(data);
            copy_truncated(&mac.finalize().into_bytes(), out)
        }

        fn $verify(key: &[u8], data: &[u8], expected: &[u8]) -> Result<()> {
            let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key)
                .map_err(|_| Error::CryptoError("invalid HMAC key".into()))?;
            mac.update(data);
            mac.verify_truncated_left(expected)
                .map_err(|_| Error::CryptoError("ICV mismatch".into()))
        }
    };
}

hmac_digest!(hmac_sha256_sign, hmac_sha256_verify, Sha256);
hmac_digest!(hmac_sha384_sign, hmac_sha384_verify, Sha384);
hmac_digest!(hmac_sha512_sign, hmac_sha512_verify, Sha512);

fn copy_truncated(digest: &[u8], out: &mut [u8]) -> Result<()> {
    if out.len() > digest.len() {
        return Err(Error::InvalidLength {
            expected: digest.len(),
            actual: out.len(),
        });
    }
    out.copy_from_slice(&digest[..out.len()]);
    Ok(())
}

fn check_blocks(len: usize) -> Result<()> {
    if len % AES_BLOCK_LEN != 0 {
        return Err(Error::InvalidLength {
            expected: AES_BLOCK_LEN,
            actual: len,
        });
    }
    Ok(())
}

fn check_len(what: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::CryptoError(format!(
            "{} must be {} bytes, got {}",
            what, expected, actual
        )));
    }
    Ok(())
}

fn bad_key(expected: usize, actual: usize) -> Error {
    Error::InvalidKeyLength { expected, actual }
}
