//! ESP (Encapsulating Security Payload) wire layout
//!
//! Implements the RFC 4303 header, trailer and padding rules used by the
//! in-place transforms.
//!
//! # ESP Packet Format (RFC 4303)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ ----
//! |               Security Parameters Index (SPI)                 | ^Auth
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |Cov-
//! |                      Sequence Number                          | |erage
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ | ----
//! |                    Payload Data (variable)                    | |  ^
//! ~                                                               ~ |  |
//! |                                                               | |Conf.
//! +               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |Cov-
//! |               |     Padding (0-255 bytes)                     | |erage
//! +-+-+-+-+-+-+-+-+               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |  |
//! |                               |  Pad Length   | Next Header   | v  v
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ ----
//! |         Integrity Check Value-ICV   (variable)                |
//! ~                                                               ~
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The payload starts with the explicit IV. With ESN and a separate
//! integrity algorithm, the high 32 sequence bits are placed between the
//! trailer and the ICV while the ICV is computed, then removed before
//! transmission.

use crate::ipsec::{Error, Result};

/// SPI + sequence number
pub const ESP_HDR_LEN: usize = 8;

/// Pad length + next header
pub const ESP_TAIL_LEN: usize = 2;

/// High half of an extended sequence number
pub const SQH_LEN: usize = 4;

/// Largest pad length representable in the trailer
pub const MAX_PAD_LEN: usize = 255;

/// ESP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EspHeader {
    /// Security Parameters Index
    pub spi: u32,
    /// Low 32 bits of the sequence number
    pub seq: u32,
}

impl EspHeader {
    /// Parse from the first [`ESP_HDR_LEN`] bytes of `data`
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferTooShort`] if `data` is shorter than the header
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < ESP_HDR_LEN {
            return Err(Error::BufferTooShort {
                required: ESP_HDR_LEN,
                available: data.len(),
            });
        }

        Ok(EspHeader {
            spi: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        })
    }

    /// Serialize
    pub fn to_bytes(&self) -> [u8; ESP_HDR_LEN] {
        let mut out = [0u8; ESP_HDR_LEN];
        out[..4].copy_from_slice(&self.spi.to_be_bytes());
        out[4..].copy_from_slice(&self.seq.to_be_bytes());
        out
    }
}

/// ESP trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EspTrailer {
    /// Number of pad bytes before the trailer
    pub pad_len: u8,
    /// Protocol of the protected payload
    pub next_header: u8,
}

impl EspTrailer {
    /// Parse the two trailer bytes
    pub fn parse(bytes: [u8; ESP_TAIL_LEN]) -> Self {
        EspTrailer {
            pad_len: bytes[0],
            next_header: bytes[1],
        }
    }

    /// Serialize
    pub fn to_bytes(&self) -> [u8; ESP_TAIL_LEN] {
        [self.pad_len, self.next_header]
    }
}

/// Round `len` up to a multiple of `align` (a power of two)
pub fn align_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

/// Encrypted length of a payload of `plen` bytes: payload, padding and trailer
pub fn padded_len(plen: usize, pad_align: usize) -> usize {
    align_up(plen + ESP_TAIL_LEN, pad_align)
}

/// Fill `pad` with the RFC 4303 default pattern 1, 2, 3, ...
pub fn fill_padding(pad: &mut [u8]) {
    for (i, b) in pad.iter_mut().enumerate() {
        *b = (i + 1) as u8;
    }
}

/// Verify the default padding pattern
///
/// # Errors
///
/// Returns [`Error::InvalidPadding`] with the index of the first bad byte
pub fn check_padding(pad: &[u8]) -> Result<()> {
    match pad.iter().enumerate().position(|(i, &b)| b != (i + 1) as u8) {
        Some(index) => Err(Error::InvalidPadding { index }),
        None => Ok(()),
    }
}

/// Explicit IV written into the packet: the big-endian sequence number
pub fn wire_iv(sqn: u64) -> [u8; 8] {
    sqn.to_be_bytes()
}

/// Write AEAD associated data (`SPI || [seq_hi] || seq_lo`), returning its length
pub fn fill_aad(out: &mut [u8], spi: u32, sqn: u64, esn: bool) -> usize {
    out[..4].copy_from_slice(&spi.to_be_bytes());
    if esn {
        out[4..8].copy_from_slice(&((sqn >> 32) as u32).to_be_bytes());
        out[8..12].copy_from_slice(&(sqn as u32).to_be_bytes());
        12
    } else {
        out[4..8].copy_from_slice(&(sqn as u32).to_be_bytes());
        8
    }
}

/// High 32 bits of `sqn` as carried in the ESN slot
pub fn sqn_hi_bytes(sqn: u64) -> [u8; SQH_LEN] {
    ((sqn >> 32) as u32).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_parse() {
        let hdr = EspHeader {
            spi: 0x11223344,
            seq: 0x00000001,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(bytes, [0x11, 0x22, 0x33, 0x44, 0, 0, 0, 1]);
        assert_eq!(EspHeader::parse(&bytes).unwrap(), hdr);

        assert!(matches!(
            EspHeader::parse(&bytes[..5]),
            Err(Error::BufferTooShort {
                required: 8,
                available: 5
            })
        ));
    }

    #[test]
    fn test_padded_len() {
        // 100 + 2 rounded to 4
        assert_eq!(padded_len(100, 4), 104);
        // 14 + 2 already aligned to 16
        assert_eq!(padded_len(14, 16), 16);
        assert_eq!(padded_len(15, 16), 32);
        assert_eq!(padded_len(0, 4), 4);
    }

    #[test]
    fn test_padding_pattern() {
        let mut pad = [0u8; 6];
        fill_padding(&mut pad);
        assert_eq!(pad, [1, 2, 3, 4, 5, 6]);
        assert!(check_padding(&pad).is_ok());

        pad[3] = 0xFF;
        assert_eq!(check_padding(&pad), Err(Error::InvalidPadding { index: 3 }));
        assert!(check_padding(&[]).is_ok());
    }

    #[test]
    fn test_aad_layout() {
        let mut aad = [0u8; 12];
        assert_eq!(fill_aad(&mut aad, 0xAABBCCDD, 0x0000_0002_0000_0003, false), 8);
        assert_eq!(&aad[..8], &[0xAA, 0xBB, 0xCC, 0xDD, 0, 0, 0, 3]);

        assert_eq!(fill_aad(&mut aad, 0xAABBCCDD, 0x0000_0002_0000_0003, true), 12);
        assert_eq!(
            aad,
            [0xAA, 0xBB, 0xCC, 0xDD, 0, 0, 0, 2, 0, 0, 0, 3]
        );
    }

    #[test]
    fn test_trailer_round_trip() {
        let tr = EspTrailer {
            pad_len: 2,
            next_header: 4,
        };
        assert_eq!(EspTrailer::parse(tr.to_bytes()), tr);
        assert_eq!(wire_iv(0x0102), [0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(sqn_hi_bytes(0x0000_0005_FFFF_FFFF), [0, 0, 0, 5]);
    }
}
