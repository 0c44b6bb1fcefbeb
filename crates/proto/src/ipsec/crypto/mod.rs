//! IPSec cryptographic operations
//!
//! This module provides:
//! - Transform descriptions with zeroizing keys (`xform`)
//! - In-place cipher, AEAD and integrity primitives (`cipher`)
//! - Crypto operation filling for prepared packets (`adapter`)
//! - A software crypto device running ops with the RustCrypto stack (`soft`)

pub(crate) mod adapter;
pub mod cipher;
pub mod soft;
pub mod xform;

pub use cipher::{AeadAlgorithm, AuthAlgorithm, CipherAlgorithm};
pub use soft::SoftCryptoDevice;
pub use xform::{
    AeadXform, AuthXform, CipherXform, CryptoDirection, CryptoKey, CryptoXform, MAX_OP_IV_LEN,
};
