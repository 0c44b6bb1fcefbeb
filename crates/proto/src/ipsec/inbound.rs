//! Inbound ESP transform (decapsulation)
//!
//! Prepare reconstructs the sequence number, runs a read-only replay check
//! and fills the crypto op. Process runs after the crypto device: it checks
//! the completion flag, validates padding and trailer, strips the ESP
//! framing and finally records the batch in the replay window in packet
//! order.

use corvid_platform::{CryptoOp, Mbuf, OffloadFlags, PacketType, SessionAttach};

use super::batch::{BatchOutcome, Rejects};
use super::crypto::adapter::{fill_op, OpLayout};
use super::esp::{check_padding, sqn_hi_bytes, EspHeader, EspTrailer, ESP_HDR_LEN, ESP_TAIL_LEN};
use super::iph::{next_proto_offset, update_transport_header};
use super::logging;
use super::replay::ReplayWindow;
use super::sa::Sa;
use super::{Error, Result};

/// Validate packets and fill crypto ops for a lookaside batch
///
/// `ops[..k]` are filled for the `k` accepted packets, which end up at the
/// front of `mbufs` in their original order.
pub(crate) fn prepare(
    sa: &Sa,
    session: SessionAttach,
    mbufs: &mut [Mbuf],
    ops: &mut [CryptoOp],
) -> BatchOutcome {
    let mut rejects = Rejects::new();
    let window = sa.replay.as_ref().map(|r| r.snapshot());
    let mut k = 0;

    for (i, mb) in mbufs.iter_mut().enumerate() {
        let res = prepare_one(sa, window.as_ref(), mb).and_then(|(layout, iv, sqn)| {
            fill_op(sa, &mut ops[k], mb, session, &layout, &iv[..sa.iv_len], sqn)
        });

        match res {
            Ok(()) => k += 1,
            Err(err) => {
                logging::log_packet_rejected("inbound_prepare", sa.spi, i, &err);
                record_error(sa, &err);
                rejects.push(i, err);
            }
        }
    }

    rejects.finish(mbufs)
}

/// Decapsulate packets the crypto device (or NIC) has verified
///
/// `inline` packets were decrypted on the wire and carry no ESN slot.
pub(crate) fn process(sa: &Sa, mbufs: &mut [Mbuf], tunnel: bool, inline: bool) -> BatchOutcome {
    let sqh_len = if inline { 0 } else { sa.sqh_len };
    let mut rejects = Rejects::new();
    let mut seqs = Vec::with_capacity(mbufs.len());

    for (i, mb) in mbufs.iter_mut().enumerate() {
        let res = if mb.ol_flags.contains(OffloadFlags::RX_SEC_OFFLOAD_FAILED) {
            Err(Error::OffloadFailed)
        } else if tunnel {
            decap_tunnel(sa, mb, sqh_len)
        } else {
            decap_transport(sa, mb, sqh_len)
        };

        match res {
            Ok(low) => seqs.push((i, low)),
            Err(err) => {
                logging::log_packet_rejected("inbound_process", sa.spi, i, &err);
                record_error(sa, &err);
                rejects.push(i, err);
            }
        }
    }

    if let Some(replay) = &sa.replay {
        let mut window = replay.begin_update();
        for &(i, low) in &seqs {
            let sqn = sa.inbound_sqn(window.high(), low);
            if let Err(err) = window.update(sqn) {
                logging::log_replay_detected(sa.spi, sqn, &err);
                sa.stats.record_replay_rejected(1);
                rejects.push(i, err);
            }
        }
    }

    let bytes = seqs
        .iter()
        .filter(|(i, _)| !rejects.contains(*i))
        .map(|&(i, _)| mbufs[i].pkt_len())
        .sum::<usize>();
    sa.stats.record_accepted(mbufs.len() - rejects.len(), bytes);

    rejects.finish(mbufs)
}

fn record_error(sa: &Sa, err: &Error) {
    match err {
        Error::OffloadFailed => sa.stats.record_auth_failed(1),
        Error::ReplayDetected(_) | Error::StaleSequence(_) => sa.stats.record_replay_rejected(1),
        _ => sa.stats.record_errors(1),
    }
}

fn prepare_one(
    sa: &Sa,
    window: Option<&ReplayWindow>,
    mb: &mut Mbuf,
) -> Result<(OpLayout, [u8; 16], u64)> {
    let hl = mb.l2_len + mb.l3_len;
    let hlen = ESP_HDR_LEN + sa.iv_len;

    let mut hdr = [0u8; ESP_HDR_LEN + 16];
    mb.copy_out(hl, &mut hdr[..hlen])?;
    let esp = EspHeader::parse(&hdr)?;

    let sqn = sa.inbound_sqn(window.map_or(0, ReplayWindow::high), esp.seq);
    if let Some(window) = window {
        if let Err(err) = window.check(sqn) {
            logging::log_replay_detected(sa.spi, sqn, &err);
            return Err(err);
        }
    }

    let plen = mb.pkt_len().checked_sub(hl).ok_or(Error::InvalidLength {
        expected: hl,
        actual: mb.pkt_len(),
    })?;
    let clen = plen
        .checked_sub(sa.ctp.cipher.length as usize)
        .ok_or(Error::InvalidLength {
            expected: hl + sa.ctp.cipher.length as usize,
            actual: mb.pkt_len(),
        })?;
    if clen % sa.pad_align != 0 {
        return Err(Error::InvalidLength {
            expected: sa.pad_align,
            actual: clen,
        });
    }

    let room = sa.aad_len + sa.sqh_len;
    if room > mb.tailroom() {
        return Err(Error::BufferTooShort {
            required: room,
            available: mb.tailroom(),
        });
    }

    // authenticate the ESN high bits in the slot where the ICV was
    let icv_ofs = mb.pkt_len() - sa.icv_len;
    if sa.sqh_len > 0 {
        let mut icv = vec![0u8; sa.icv_len];
        mb.copy_out(icv_ofs, &mut icv)?;
        mb.append(sa.sqh_len)?;
        mb.copy_in(icv_ofs + sa.sqh_len, &icv)?;
        mb.copy_in(icv_ofs, &sqn_hi_bytes(sqn))?;
    }

    let layout = OpLayout::inbound(sa, hl, plen, icv_ofs + sa.sqh_len);
    let mut iv = [0u8; 16];
    iv[..sa.iv_len].copy_from_slice(&hdr[ESP_HDR_LEN..hlen]);

    Ok((layout, iv, sqn))
}

/// Trailer fields and lengths shared by both modes
struct Tail {
    trailer: EspTrailer,
    /// Bytes trimmed from the end: padding, trailer, ESN slot, ICV
    len: usize,
    /// Low 32 bits of the sequence number
    seq: u32,
}

/// Validate padding and trailer without touching the packet
fn read_tail(sa: &Sa, mb: &Mbuf, hl: usize, sqh_len: usize) -> Result<Tail> {
    let pkt_len = mb.pkt_len();
    let tlen = sa.icv_len + ESP_TAIL_LEN + sqh_len;
    let adj = hl + ESP_HDR_LEN + sa.iv_len;

    // decap strips or slides these bytes inside the first segment
    let head_len = mb.first_segment().data_len();
    if adj > head_len {
        return Err(Error::BufferTooShort {
            required: adj,
            available: head_len,
        });
    }

    if tlen + adj > pkt_len {
        return Err(Error::InvalidLength {
            expected: tlen + adj,
            actual: pkt_len,
        });
    }

    let mut bytes = [0u8; ESP_TAIL_LEN];
    mb.copy_out(pkt_len - tlen, &mut bytes)?;
    let trailer = EspTrailer::parse(bytes);

    let len = tlen + trailer.pad_len as usize;
    if len + adj > pkt_len {
        return Err(Error::InvalidLength {
            expected: len + adj,
            actual: pkt_len,
        });
    }

    let mut pad = vec![0u8; trailer.pad_len as usize];
    mb.copy_out(pkt_len - len, &mut pad)?;
    check_padding(&pad)?;

    let mut seq = [0u8; 4];
    mb.copy_out(hl + 4, &mut seq)?;

    Ok(Tail {
        trailer,
        len,
        seq: u32::from_be_bytes(seq),
    })
}

fn decap_tunnel(sa: &Sa, mb: &mut Mbuf, sqh_len: usize) -> Result<u32> {
    let hl = mb.l2_len + mb.l3_len;
    let tail = read_tail(sa, mb, hl, sqh_len)?;

    if tail.trailer.next_header != sa.proto {
        return Err(Error::InvalidNextHeader {
            expected: sa.proto,
            actual: tail.trailer.next_header,
        });
    }

    mb.trim(tail.len)?;
    mb.adj(hl + ESP_HDR_LEN + sa.iv_len)?;

    mb.l2_len = 0;
    mb.l3_len = 0;
    mb.packet_type = PacketType::UNKNOWN;
    mb.ol_flags
        .remove(OffloadFlags::RX_SEC_OFFLOAD | OffloadFlags::RX_SEC_OFFLOAD_FAILED);

    Ok(tail.seq)
}

fn decap_transport(sa: &Sa, mb: &mut Mbuf, sqh_len: usize) -> Result<u32> {
    let l2 = mb.l2_len;
    let hl = l2 + mb.l3_len;
    let tail = read_tail(sa, mb, hl, sqh_len)?;

    let proto_ofs = {
        let head = mb.head(hl)?;
        next_proto_offset(&head[l2..], sa.ip_version, mb.l3_len)?
    };

    let cofs = ESP_HDR_LEN + sa.iv_len;
    mb.trim(tail.len)?;
    // close the ESP gap by sliding L2/L3 towards the payload
    mb.shift_head(0..hl, cofs as isize)?;
    mb.adj(cofs)?;

    let len = mb.pkt_len() - l2;
    let head = mb.head_mut(hl)?;
    update_transport_header(
        &mut head[l2..],
        sa.ip_version,
        proto_ofs,
        len,
        tail.trailer.next_header,
    );

    mb.packet_type = mb
        .packet_type
        .masked(PacketType::L2_MASK | PacketType::L3_MASK);
    mb.ol_flags.remove(OffloadFlags::RX_SEC_OFFLOAD);

    Ok(tail.seq)
}
