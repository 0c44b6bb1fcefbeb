//! Outbound ESP transform (encapsulation)
//!
//! Tunnel mode prepends the SA's outer header template. Transport mode
//! slides the L2/L3 headers towards the front of the buffer and inserts the
//! ESP header behind them. Both append padding, the trailer, the optional
//! ESN high-bits slot and room for the ICV.
//!
//! ```text
//! tunnel:    | tpl (L2 + outer L3) | ESP | IV | payload | pad | trailer | [sqh] | ICV |
//! transport: | L2 | L3 |            ESP | IV | payload | pad | trailer | [sqh] | ICV |
//! ```

use corvid_platform::{CryptoOp, Mbuf, OffloadFlags, SessionAttach};

use super::batch::{BatchOutcome, Rejects};
use super::crypto::adapter::{fill_op, OpLayout};
use super::esp::{
    fill_padding, padded_len, sqn_hi_bytes, wire_iv, EspHeader, EspTrailer, ESP_HDR_LEN,
    ESP_TAIL_LEN,
};
use super::iph::{next_proto_offset, update_transport_header, update_tunnel_header, IPPROTO_ESP};
use super::logging;
use super::sa::Sa;
use super::session::Offload;
use super::sqn::SqnReservation;
use super::{Error, Result};

/// Packet layout after encapsulation, offsets from the packet start
#[derive(Debug, Clone, Copy)]
struct Encap {
    esp_ofs: usize,
    clen: usize,
    icv_ofs: usize,
    iv: [u8; 16],
}

/// Encapsulate and fill crypto ops for a lookaside batch
///
/// `ops[..k]` are filled for the `k` accepted packets, which end up at the
/// front of `mbufs` in their original order.
pub(crate) fn prepare(
    sa: &Sa,
    session: SessionAttach,
    mbufs: &mut [Mbuf],
    ops: &mut [CryptoOp],
    tunnel: bool,
) -> Result<BatchOutcome> {
    let mut rejects = Rejects::new();
    let granted = reserve(sa, mbufs.len(), &mut rejects)?;
    let mut k = 0;

    for (i, mb) in mbufs.iter_mut().enumerate() {
        let Some(sqn) = granted.sqn(i) else {
            continue;
        };

        let res = encap(sa, mb, sqn, sa.sqh_len, sa.aad_len, tunnel).and_then(|e| {
            let layout = OpLayout::outbound(sa, e.esp_ofs, e.clen, e.icv_ofs);
            fill_op(sa, &mut ops[k], mb, session, &layout, &e.iv[..sa.iv_len], sqn)
        });

        match res {
            Ok(()) => k += 1,
            Err(err) => {
                logging::log_packet_rejected("outbound_prepare", sa.spi, i, &err);
                sa.stats.record_errors(1);
                rejects.push(i, err);
            }
        }
    }

    Ok(rejects.finish(mbufs))
}

/// Post-crypto step: drop the ESN high-bits slot and check completion flags
pub(crate) fn process(sa: &Sa, mbufs: &mut [Mbuf], remove_sqh: bool) -> BatchOutcome {
    let mut rejects = Rejects::new();
    let mut bytes = 0;

    for (i, mb) in mbufs.iter_mut().enumerate() {
        let res = if mb.ol_flags.contains(OffloadFlags::RX_SEC_OFFLOAD_FAILED) {
            sa.stats.record_auth_failed(1);
            Err(Error::OffloadFailed)
        } else if remove_sqh {
            remove_sqh_slot(sa, mb)
        } else {
            Ok(())
        };

        match res {
            Ok(()) => bytes += mb.pkt_len(),
            Err(err) => {
                logging::log_packet_rejected("outbound_process", sa.spi, i, &err);
                rejects.push(i, err);
            }
        }
    }

    sa.stats.record_accepted(mbufs.len() - rejects.len(), bytes);
    rejects.finish(mbufs)
}

/// Inline crypto: rewrite headers here, let the NIC encrypt on transmit
pub(crate) fn process_inline(
    sa: &Sa,
    offload: &Offload<'_>,
    mbufs: &mut [Mbuf],
    tunnel: bool,
) -> BatchOutcome {
    let mut rejects = Rejects::new();
    let granted = match reserve(sa, mbufs.len(), &mut rejects) {
        Ok(granted) => granted,
        Err(err) => return reject_all(sa, mbufs, err),
    };
    let mut bytes = 0;

    for (i, mb) in mbufs.iter_mut().enumerate() {
        let Some(sqn) = granted.sqn(i) else {
            continue;
        };

        // the NIC writes the ICV itself, no ESN slot or AAD needed
        match encap(sa, mb, sqn, 0, 0, tunnel) {
            Ok(_) => {
                offload.mark(mb);
                bytes += mb.pkt_len();
            }
            Err(err) => {
                logging::log_packet_rejected("inline_outbound", sa.spi, i, &err);
                sa.stats.record_errors(1);
                rejects.push(i, err);
            }
        }
    }

    sa.stats.record_accepted(mbufs.len() - rejects.len(), bytes);
    rejects.finish(mbufs)
}

/// Inline protocol: the NIC does everything, only sequence space is accounted
pub(crate) fn process_inline_protocol(
    sa: &Sa,
    offload: &Offload<'_>,
    mbufs: &mut [Mbuf],
) -> BatchOutcome {
    let mut rejects = Rejects::new();
    let granted = match reserve(sa, mbufs.len(), &mut rejects) {
        Ok(granted) => granted,
        Err(err) => return reject_all(sa, mbufs, err),
    };
    let mut bytes = 0;

    for (i, mb) in mbufs.iter_mut().enumerate() {
        if granted.sqn(i).is_some() {
            offload.mark(mb);
            bytes += mb.pkt_len();
        }
    }

    sa.stats.record_accepted(mbufs.len() - rejects.len(), bytes);
    rejects.finish(mbufs)
}

/// Sequence numbers granted to one batch
struct Granted(SqnReservation);

impl Granted {
    fn sqn(&self, i: usize) -> Option<u64> {
        if i < self.0.granted {
            self.0.nth(i)
        } else {
            None
        }
    }
}

/// Reserve one sequence number per packet, rejecting packets past the limit
fn reserve(sa: &Sa, n: usize, rejects: &mut Rejects) -> Result<Granted> {
    let counter = sa
        .outbound
        .as_ref()
        .ok_or_else(|| Error::InvalidState("SA has no outbound sequence counter".into()))?;

    let res = counter.reserve(n);
    if res.granted < n {
        // denied numbers that do not fit in 64 bits report the limit
        let denied = |i: usize| res.nth(i).unwrap_or(counter.mask());
        let first = denied(res.granted);
        logging::log_sqn_overflow(sa.spi, n, res.granted);
        sa.stats.record_sqn_overflow(n - res.granted);

        rejects.note(Error::SequenceOverflow(first));
        for i in res.granted..n {
            rejects.push(i, Error::SequenceOverflow(denied(i)));
        }
    }

    Ok(Granted(res))
}

fn reject_all(sa: &Sa, mbufs: &mut [Mbuf], err: Error) -> BatchOutcome {
    let mut rejects = Rejects::new();
    for i in 0..mbufs.len() {
        logging::log_packet_rejected("outbound", sa.spi, i, &err);
        rejects.push(i, err.clone());
    }
    rejects.finish(mbufs)
}

/// Encapsulate one packet with sequence number `sqn`
///
/// Length and room checks run before the buffer is touched.
fn encap(
    sa: &Sa,
    mb: &mut Mbuf,
    sqn: u64,
    sqh_len: usize,
    aad_len: usize,
    tunnel: bool,
) -> Result<Encap> {
    if tunnel {
        encap_tunnel(sa, mb, sqn, sqh_len, aad_len)
    } else {
        encap_transport(sa, mb, sqn, sqh_len, aad_len)
    }
}

fn encap_tunnel(
    sa: &Sa,
    mb: &mut Mbuf,
    sqn: u64,
    sqh_len: usize,
    aad_len: usize,
) -> Result<Encap> {
    let tpl = sa
        .tunnel
        .as_ref()
        .ok_or_else(|| Error::InvalidState("tunnel SA has no header template".into()))?;

    let l2 = mb.l2_len;
    let esp_ofs = tpl.len();
    let hlen = esp_ofs + ESP_HDR_LEN + sa.iv_len;

    // the inner packet starts at L3
    let plen = payload_len(mb, l2)?;
    let clen = padded_len(plen, sa.pad_align);
    let pdlen = clen - plen;
    let tlen = pdlen + sa.icv_len + sqh_len;
    check_room(mb, hlen.saturating_sub(l2), tlen + aad_len)?;

    if hlen >= l2 {
        mb.prepend(hlen - l2)?;
    } else {
        mb.adj(l2 - hlen)?;
    }
    let pdofs = mb.pkt_len();
    mb.append(tlen)?;

    let iv = packet_iv(sqn);
    let total = mb.pkt_len();
    let l3_ofs = tpl.l3_offset();

    let head = mb.head_mut(hlen)?;
    head[..esp_ofs].copy_from_slice(tpl.as_bytes());
    update_tunnel_header(
        &mut head[l3_ofs..esp_ofs],
        tpl.version(),
        total - sqh_len - l3_ofs,
        sqn as u16,
    );
    write_esp_header(sa, &mut head[esp_ofs..], sqn, &iv);

    let icv_ofs = write_trailer(mb, pdofs, pdlen, sa.proto, sqn, sqh_len)?;

    mb.l2_len = l3_ofs;
    mb.l3_len = esp_ofs - l3_ofs;

    Ok(Encap {
        esp_ofs,
        clen,
        icv_ofs,
        iv,
    })
}

fn encap_transport(
    sa: &Sa,
    mb: &mut Mbuf,
    sqn: u64,
    sqh_len: usize,
    aad_len: usize,
) -> Result<Encap> {
    let l2 = mb.l2_len;
    let uhlen = l2 + mb.l3_len;
    let hlen = ESP_HDR_LEN + sa.iv_len;

    let plen = payload_len(mb, uhlen)?;
    let clen = padded_len(plen, sa.pad_align);
    let pdlen = clen - plen;
    let tlen = pdlen + sa.icv_len + sqh_len;
    check_room(mb, hlen, tlen + aad_len)?;

    let proto_ofs = {
        let head = mb.head(uhlen)?;
        next_proto_offset(&head[l2..], sa.ip_version, mb.l3_len)?
    };

    mb.prepend(hlen)?;
    let pdofs = mb.pkt_len();
    mb.append(tlen)?;

    // open a gap for ESP + IV behind the original headers
    mb.shift_head(hlen..hlen + uhlen, -(hlen as isize))?;

    let iv = packet_iv(sqn);
    let total = mb.pkt_len();

    let head = mb.head_mut(uhlen + hlen)?;
    let inner = update_transport_header(
        &mut head[l2..uhlen],
        sa.ip_version,
        proto_ofs,
        total - l2 - sqh_len,
        IPPROTO_ESP,
    );
    write_esp_header(sa, &mut head[uhlen..], sqn, &iv);

    let icv_ofs = write_trailer(mb, pdofs, pdlen, inner, sqn, sqh_len)?;

    Ok(Encap {
        esp_ofs: uhlen,
        clen,
        icv_ofs,
        iv,
    })
}

fn payload_len(mb: &Mbuf, hdr_len: usize) -> Result<usize> {
    mb.pkt_len()
        .checked_sub(hdr_len)
        .ok_or(Error::InvalidLength {
            expected: hdr_len,
            actual: mb.pkt_len(),
        })
}

fn check_room(mb: &Mbuf, head: usize, tail: usize) -> Result<()> {
    if tail > mb.tailroom() {
        return Err(Error::BufferTooShort {
            required: tail,
            available: mb.tailroom(),
        });
    }
    if head > mb.headroom() {
        return Err(Error::BufferTooShort {
            required: head,
            available: mb.headroom(),
        });
    }
    Ok(())
}

/// Explicit IV for `sqn`; CBC uses the first 16 bytes, the others 8
fn packet_iv(sqn: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&wire_iv(sqn));
    iv
}

fn write_esp_header(sa: &Sa, out: &mut [u8], sqn: u64, iv: &[u8; 16]) {
    let hdr = EspHeader {
        spi: sa.spi,
        seq: sqn as u32,
    };
    out[..ESP_HDR_LEN].copy_from_slice(&hdr.to_bytes());
    out[ESP_HDR_LEN..ESP_HDR_LEN + sa.iv_len].copy_from_slice(&iv[..sa.iv_len]);
}

/// Write padding, trailer and the ESN slot at `pdofs`, returning the ICV offset
fn write_trailer(
    mb: &mut Mbuf,
    pdofs: usize,
    pdlen: usize,
    next_header: u8,
    sqn: u64,
    sqh_len: usize,
) -> Result<usize> {
    let pad_len = pdlen - ESP_TAIL_LEN;
    let mut tail = vec![0u8; pdlen + sqh_len];
    fill_padding(&mut tail[..pad_len]);

    let trailer = EspTrailer {
        pad_len: pad_len as u8,
        next_header,
    };
    tail[pad_len..pdlen].copy_from_slice(&trailer.to_bytes());
    if sqh_len > 0 {
        tail[pdlen..].copy_from_slice(&sqn_hi_bytes(sqn));
    }

    mb.copy_in(pdofs, &tail)?;
    Ok(pdofs + pdlen + sqh_len)
}

/// Move the ICV over the ESN slot and cut the slot off
fn remove_sqh_slot(sa: &Sa, mb: &mut Mbuf) -> Result<()> {
    let len = mb.pkt_len();
    let icv_ofs = len
        .checked_sub(sa.icv_len + sa.sqh_len)
        .ok_or(Error::InvalidLength {
            expected: sa.icv_len + sa.sqh_len,
            actual: len,
        })?;

    let mut icv = vec![0u8; sa.icv_len];
    mb.copy_out(icv_ofs + sa.sqh_len, &mut icv)?;
    mb.copy_in(icv_ofs, &icv)?;
    mb.trim(sa.sqh_len)?;
    Ok(())
}
