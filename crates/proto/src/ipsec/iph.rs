//! IP header rewrites done around ESP encapsulation
//!
//! Only length, identification and protocol fields are touched. IPv4 header
//! checksums are left to transmit checksum offload.

use super::config::IpVersion;
use super::{Error, Result};

/// IPv4-in-IP
pub const IPPROTO_IPIP: u8 = 4;
/// IPv6-in-IP
pub const IPPROTO_IPV6: u8 = 41;
/// ESP
pub const IPPROTO_ESP: u8 = 50;
/// AH
pub const IPPROTO_AH: u8 = 51;

const IPPROTO_HOPOPTS: u8 = 0;
const IPPROTO_ROUTING: u8 = 43;
const IPPROTO_FRAGMENT: u8 = 44;
const IPPROTO_DSTOPTS: u8 = 60;

/// IPv4 header length without options
pub const IPV4_HDR_LEN: usize = 20;
/// IPv6 fixed header length
pub const IPV6_HDR_LEN: usize = 40;

const IPV4_TOTAL_LEN: usize = 2;
const IPV4_PACKET_ID: usize = 4;
const IPV4_PROTO: usize = 9;
const IPV6_PAYLOAD_LEN: usize = 4;
const IPV6_NEXT_HDR: usize = 6;

/// Offset of the field holding the upper-layer protocol inside an L3 header
///
/// For IPv6 the extension header chain is walked within `l3_len` and the
/// offset of the last next-header field is returned.
///
/// # Errors
///
/// Returns [`Error::MalformedHeader`] if the header is shorter than its
/// fixed part or an extension header runs past `l3_len`.
pub fn next_proto_offset(l3: &[u8], version: IpVersion, l3_len: usize) -> Result<usize> {
    match version {
        IpVersion::V4 => {
            if l3.len() < IPV4_HDR_LEN || l3_len < IPV4_HDR_LEN {
                return Err(Error::MalformedHeader("IPv4 header truncated"));
            }
            Ok(IPV4_PROTO)
        }
        IpVersion::V6 => {
            let limit = l3_len.min(l3.len());
            if limit < IPV6_HDR_LEN {
                return Err(Error::MalformedHeader("IPv6 header truncated"));
            }

            let mut field = IPV6_NEXT_HDR;
            let mut pos = IPV6_HDR_LEN;
            while pos < limit {
                let ext_len = match l3[field] {
                    IPPROTO_FRAGMENT => 8,
                    IPPROTO_AH => match l3.get(pos + 1) {
                        Some(&n) => (n as usize + 2) * 4,
                        None => return Err(Error::MalformedHeader("IPv6 AH header truncated")),
                    },
                    IPPROTO_HOPOPTS | IPPROTO_ROUTING | IPPROTO_DSTOPTS => {
                        match l3.get(pos + 1) {
                            Some(&n) => (n as usize + 1) * 8,
                            None => {
                                return Err(Error::MalformedHeader(
                                    "IPv6 extension header truncated",
                                ))
                            }
                        }
                    }
                    _ => break,
                };
                field = pos;
                pos += ext_len;
            }

            if pos > limit {
                return Err(Error::MalformedHeader(
                    "IPv6 extension header exceeds L3 length",
                ));
            }
            Ok(field)
        }
    }
}

/// Stamp length and identification into an outer tunnel header
///
/// `l3` starts at the outer IP header and `len` counts from there to the end
/// of the packet.
pub fn update_tunnel_header(l3: &mut [u8], version: IpVersion, len: usize, packet_id: u16) {
    match version {
        IpVersion::V4 => {
            l3[IPV4_TOTAL_LEN..IPV4_TOTAL_LEN + 2].copy_from_slice(&(len as u16).to_be_bytes());
            l3[IPV4_PACKET_ID..IPV4_PACKET_ID + 2].copy_from_slice(&packet_id.to_be_bytes());
        }
        IpVersion::V6 => {
            let payload = len.saturating_sub(IPV6_HDR_LEN) as u16;
            l3[IPV6_PAYLOAD_LEN..IPV6_PAYLOAD_LEN + 2].copy_from_slice(&payload.to_be_bytes());
        }
    }
}

/// Rewrite length and upper-layer protocol of a transport-mode L3 header
///
/// `len` counts from the start of the L3 header to the end of the packet.
/// Returns the protocol that was replaced.
pub fn update_transport_header(
    l3: &mut [u8],
    version: IpVersion,
    proto_ofs: usize,
    len: usize,
    proto: u8,
) -> u8 {
    match version {
        IpVersion::V4 => {
            l3[IPV4_TOTAL_LEN..IPV4_TOTAL_LEN + 2].copy_from_slice(&(len as u16).to_be_bytes());
        }
        IpVersion::V6 => {
            let payload = len.saturating_sub(IPV6_HDR_LEN) as u16;
            l3[IPV6_PAYLOAD_LEN..IPV6_PAYLOAD_LEN + 2].copy_from_slice(&payload.to_be_bytes());
        }
    }

    std::mem::replace(&mut l3[proto_ofs], proto)
}
