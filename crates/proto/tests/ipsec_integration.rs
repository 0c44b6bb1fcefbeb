//! IPsec ESP Integration Tests
//!
//! End-to-end tests for complete outbound + inbound batch flows.
//! Packets are encrypted and decrypted by the software crypto device
//! through `Session::run`, exactly as a datapath would drive the engine.

#![cfg(feature = "ipsec")]

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Once;

use corvid_platform::{
    CryptoDevice, CryptoOp, CryptoSessionHandle, Mbuf, OffloadFlags, OpStatus, SecurityContext,
    SecuritySessionHandle, Segment,
};
use corvid_proto::ipsec::{
    crypto::{
        AeadAlgorithm, AuthAlgorithm, CipherAlgorithm, CryptoDirection, CryptoXform,
        SoftCryptoDevice,
    },
    esp::EspHeader,
    ActionType, BatchOutcome, Direction, Error, ErrorClass, IpVersion, Mode, Sa, SaParams,
    SaParamsBuilder, Session, SessionBinding, TunnelHeader,
};
use proptest::prelude::*;

static TRACING: Once = Once::new();

/// Route engine logs to the test writer, honouring `RUST_LOG`
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Helper function to create every supported algorithm suite
fn suites(esn: bool) -> Vec<(&'static str, CryptoXform)> {
    let mut suites = vec![
        (
            "aes-gcm-128",
            CryptoXform::aead(AeadAlgorithm::AesGcm, &[0x11; 16], esn),
        ),
        (
            "aes-gcm-256",
            CryptoXform::aead(AeadAlgorithm::AesGcm, &[0x12; 32], esn),
        ),
        (
            "chacha20-poly1305",
            CryptoXform::aead(AeadAlgorithm::ChaCha20Poly1305, &[0x13; 32], esn),
        ),
        (
            "aes-cbc-128/hmac-sha256",
            CryptoXform::cipher_auth(
                CipherAlgorithm::AesCbc,
                &[0x21; 16],
                AuthAlgorithm::HmacSha256,
                &[0x22; 32],
            ),
        ),
        (
            "aes-cbc-256/hmac-sha256",
            CryptoXform::cipher_auth(
                CipherAlgorithm::AesCbc,
                &[0x23; 32],
                AuthAlgorithm::HmacSha256,
                &[0x24; 32],
            ),
        ),
        (
            "aes-ctr-128/hmac-sha384",
            CryptoXform::cipher_auth(
                CipherAlgorithm::AesCtr,
                &[0x31; 16],
                AuthAlgorithm::HmacSha384,
                &[0x32; 48],
            ),
        ),
        (
            "null/aes-gmac-128",
            CryptoXform::cipher_auth(
                CipherAlgorithm::Null,
                &[],
                AuthAlgorithm::AesGmac,
                &[0x41; 16],
            ),
        ),
        (
            "null/hmac-sha512",
            CryptoXform::cipher_auth(
                CipherAlgorithm::Null,
                &[],
                AuthAlgorithm::HmacSha512,
                &[0x51; 64],
            ),
        ),
    ];

    // ESN needs an ICV to carry the high bits
    if !esn {
        suites.push((
            "null/null",
            CryptoXform::cipher_auth(CipherAlgorithm::Null, &[], AuthAlgorithm::Null, &[]),
        ));
    }

    suites
}

fn null_null() -> CryptoXform {
    CryptoXform::cipher_auth(CipherAlgorithm::Null, &[], AuthAlgorithm::Null, &[])
}

fn gcm() -> CryptoXform {
    CryptoXform::aead(AeadAlgorithm::AesGcm, &[0x77; 16], false)
}

/// Matching outbound and inbound SAs with their crypto sessions
struct Link {
    out_sa: Sa,
    in_sa: Sa,
    dev: SoftCryptoDevice,
    enc: CryptoSessionHandle,
    dec: CryptoSessionHandle,
}

impl Link {
    fn new(xform: &CryptoXform, mode: Mode, inner: IpVersion) -> Link {
        Link::with(xform, mode, inner, |b, _| b)
    }

    /// Build both directions; `tune` adjusts each builder
    fn with(
        xform: &CryptoXform,
        mode: Mode,
        inner: IpVersion,
        tune: impl Fn(SaParamsBuilder, Direction) -> SaParamsBuilder,
    ) -> Link {
        init_tracing();

        let params = |direction| {
            let mut b = SaParams::builder()
                .with_spi(0x0100_0001)
                .with_direction(direction)
                .with_mode(mode)
                .with_ip_version(inner)
                .with_salt(0xA1B2_C3D4)
                .with_crypto(xform.clone());
            if direction == Direction::Outbound {
                match mode {
                    Mode::Tunnel(IpVersion::V4) => {
                        b = b.with_tunnel_header(TunnelHeader::ipv4(
                            Ipv4Addr::new(192, 0, 2, 1),
                            Ipv4Addr::new(198, 51, 100, 1),
                            64,
                        ));
                    }
                    Mode::Tunnel(IpVersion::V6) => {
                        b = b.with_tunnel_header(TunnelHeader::ipv6(
                            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1),
                            Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2),
                            64,
                        ));
                    }
                    Mode::Transport => {}
                }
            }
            tune(b, direction).build().unwrap()
        };

        let out_sa = Sa::new(&params(Direction::Outbound)).unwrap();
        let in_sa = Sa::new(&params(Direction::Inbound)).unwrap();

        let dev = SoftCryptoDevice::new();
        let enc = dev
            .create_session(xform, CryptoDirection::Encrypt)
            .unwrap();
        let dec = dev
            .create_session(xform, CryptoDirection::Decrypt)
            .unwrap();

        Link {
            out_sa,
            in_sa,
            dev,
            enc,
            dec,
        }
    }

    fn encrypt(&self, mbufs: &mut [Mbuf]) -> BatchOutcome {
        let session = Session::new(&self.out_sa, SessionBinding::Crypto(self.enc)).unwrap();
        let mut ops = CryptoOp::batch(mbufs.len(), 0x10_0000);
        session.run(&self.dev, mbufs, &mut ops).unwrap()
    }

    fn decrypt(&self, mbufs: &mut [Mbuf]) -> BatchOutcome {
        let session = Session::new(&self.in_sa, SessionBinding::Crypto(self.dec)).unwrap();
        let mut ops = CryptoOp::batch(mbufs.len(), 0x20_0000);
        session.run(&self.dev, mbufs, &mut ops).unwrap()
    }
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7) ^ seed).collect()
}

/// Helper function to create an IPv4 packet carrying `data` as `proto`
fn ipv4_packet(data: &[u8], proto: u8) -> Vec<u8> {
    let mut pkt = vec![0u8; 20];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&((20 + data.len()) as u16).to_be_bytes());
    pkt[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = proto;
    pkt[10..12].copy_from_slice(&0xBEEFu16.to_be_bytes());
    pkt[12..16].copy_from_slice(&[10, 0, 0, 1]);
    pkt[16..20].copy_from_slice(&[10, 0, 0, 2]);
    pkt.extend_from_slice(data);
    pkt
}

/// Helper function to create an IPv6 packet, optionally behind a hop-by-hop header
fn ipv6_packet(data: &[u8], proto: u8, hop_by_hop: bool) -> Vec<u8> {
    let ext_len = if hop_by_hop { 8 } else { 0 };
    let mut pkt = vec![0u8; 40];
    pkt[0] = 0x60;
    pkt[4..6].copy_from_slice(&((ext_len + data.len()) as u16).to_be_bytes());
    pkt[6] = if hop_by_hop { 0 } else { proto };
    pkt[7] = 64;
    pkt[8..24].copy_from_slice(&Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1).octets());
    pkt[24..40].copy_from_slice(&Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2).octets());
    if hop_by_hop {
        // next header, length 0, PadN filling the remaining six bytes
        pkt.extend_from_slice(&[proto, 0, 1, 4, 0, 0, 0, 0]);
    }
    pkt.extend_from_slice(data);
    pkt
}

fn with_ethernet(pkt: &[u8], ethertype: u16) -> Vec<u8> {
    let mut frame = vec![0x02, 0, 0, 0, 0, 1, 0x02, 0, 0, 0, 0, 2];
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(pkt);
    frame
}

fn mbuf(bytes: &[u8], l2: usize, l3: usize) -> Mbuf {
    Mbuf::from_bytes(bytes, 128, 128).with_header_lens(l2, l3)
}

fn flip_byte(mb: &mut Mbuf, offset: usize) {
    let mut b = [0u8; 1];
    mb.copy_out(offset, &mut b).unwrap();
    b[0] ^= 0x5A;
    mb.copy_in(offset, &b).unwrap();
}

fn esp_seq(mb: &Mbuf, esp_offset: usize) -> u32 {
    let mut hdr = [0u8; 8];
    mb.copy_out(esp_offset, &mut hdr).unwrap();
    EspHeader::parse(&hdr).unwrap().seq
}

//
// Test Cases - Round Trips
//

/// Encrypt then decrypt a batch of `packets` and expect them back unchanged
fn assert_round_trip(link: &Link, packets: &[Vec<u8>], l2: usize, l3: usize, name: &str) {
    let mut mbufs: Vec<Mbuf> = packets.iter().map(|p| mbuf(p, l2, l3)).collect();

    let out = link.encrypt(&mut mbufs);
    assert_eq!(out.accepted, packets.len(), "{}: outbound {:?}", name, out.error);
    assert!(out.error.is_none(), "{}", name);

    for (mb, orig) in mbufs.iter().zip(packets) {
        assert_ne!(&mb.to_vec(), orig, "{}: packet left in clear", name);
    }

    let inb = link.decrypt(&mut mbufs);
    assert_eq!(inb.accepted, packets.len(), "{}: inbound {:?}", name, inb.error);

    for (mb, orig) in mbufs.iter().zip(packets) {
        assert_eq!(&mb.to_vec(), orig, "{}", name);
    }

    let stats = link.in_sa.stats().snapshot();
    assert_eq!(stats.packets, packets.len() as u64, "{}", name);
    assert_eq!(stats.errors, 0, "{}", name);
}

fn mixed_ipv4_batch() -> Vec<Vec<u8>> {
    [0usize, 1, 17, 64, 255, 1400]
        .iter()
        .enumerate()
        .map(|(i, &len)| ipv4_packet(&payload(len, i as u8), 17))
        .collect()
}

fn mixed_ipv6_batch(hop_by_hop: bool) -> Vec<Vec<u8>> {
    [0usize, 3, 48, 333, 1200]
        .iter()
        .enumerate()
        .map(|(i, &len)| ipv6_packet(&payload(len, i as u8), 6, hop_by_hop))
        .collect()
}

#[test]
fn test_tunnel_ipv4_round_trip_all_suites() {
    for (name, xform) in suites(false) {
        let link = Link::new(&xform, Mode::Tunnel(IpVersion::V4), IpVersion::V4);
        assert_round_trip(&link, &mixed_ipv4_batch(), 0, 20, name);
    }
}

#[test]
fn test_tunnel_ipv6_round_trip_all_suites() {
    for (name, xform) in suites(false) {
        let link = Link::new(&xform, Mode::Tunnel(IpVersion::V6), IpVersion::V6);
        assert_round_trip(&link, &mixed_ipv6_batch(false), 0, 40, name);
    }
}

#[test]
fn test_tunnel_ipv6_in_ipv4_round_trip() {
    let link = Link::new(&gcm(), Mode::Tunnel(IpVersion::V4), IpVersion::V6);
    assert_round_trip(&link, &mixed_ipv6_batch(false), 0, 40, "6in4");
}

#[test]
fn test_transport_ipv4_round_trip_all_suites() {
    let frames: Vec<Vec<u8>> = mixed_ipv4_batch()
        .iter()
        .map(|p| with_ethernet(p, 0x0800))
        .collect();

    for (name, xform) in suites(false) {
        let link = Link::new(&xform, Mode::Transport, IpVersion::V4);
        assert_round_trip(&link, &frames, 14, 20, name);
    }
}

#[test]
fn test_transport_ipv6_round_trip_all_suites() {
    let frames: Vec<Vec<u8>> = mixed_ipv6_batch(false)
        .iter()
        .map(|p| with_ethernet(p, 0x86DD))
        .collect();

    for (name, xform) in suites(false) {
        let link = Link::new(&xform, Mode::Transport, IpVersion::V6);
        assert_round_trip(&link, &frames, 14, 40, name);
    }
}

#[test]
fn test_transport_ipv6_extension_header_round_trip() {
    let frames: Vec<Vec<u8>> = mixed_ipv6_batch(true)
        .iter()
        .map(|p| with_ethernet(p, 0x86DD))
        .collect();

    let link = Link::new(&gcm(), Mode::Transport, IpVersion::V6);
    let mut mbufs: Vec<Mbuf> = frames.iter().map(|f| mbuf(f, 14, 48)).collect();

    assert_eq!(link.encrypt(&mut mbufs).accepted, frames.len());

    // ESP lands after the extension header, which now points at it
    let wire = mbufs[0].to_vec();
    assert_eq!(wire[14 + 6], 0);
    assert_eq!(wire[14 + 40], 50);
    assert_eq!(esp_seq(&mbufs[0], 14 + 48), 1);

    assert_eq!(link.decrypt(&mut mbufs).accepted, frames.len());
    for (mb, orig) in mbufs.iter().zip(&frames) {
        assert_eq!(&mb.to_vec(), orig);
    }
}

#[test]
fn test_transport_length_fields_on_the_wire() {
    let link = Link::new(&gcm(), Mode::Transport, IpVersion::V4);
    let pkt = ipv4_packet(&payload(30, 1), 17);
    let frame = with_ethernet(&pkt, 0x0800);
    let mut mbufs = vec![mbuf(&frame, 14, 20)];

    assert_eq!(link.encrypt(&mut mbufs).accepted, 1);

    let wire = mbufs[0].to_vec();
    let total = u16::from_be_bytes([wire[14 + 2], wire[14 + 3]]) as usize;
    assert_eq!(total, wire.len() - 14);
    assert_eq!(wire[14 + 9], 50);
    // checksum is left for the transmit path
    assert_eq!(&wire[14 + 10..14 + 12], &[0xBE, 0xEF]);
}

#[test]
fn test_multi_segment_round_trip() {
    let link = Link::new(&gcm(), Mode::Tunnel(IpVersion::V4), IpVersion::V4);
    let pkt = ipv4_packet(&payload(300, 9), 17);

    let segs = vec![
        Segment::with_data(&pkt[..100], 128, 0),
        Segment::with_data(&pkt[100..220], 0, 0),
        Segment::with_data(&pkt[220..], 0, 128),
    ];
    let mut mbufs = vec![Mbuf::from_segments(segs)
        .unwrap()
        .with_header_lens(0, 20)];

    assert_eq!(link.encrypt(&mut mbufs).accepted, 1);
    assert_eq!(mbufs[0].nb_segs(), 3);

    assert_eq!(link.decrypt(&mut mbufs).accepted, 1);
    assert_eq!(mbufs[0].to_vec(), pkt);
}

#[test]
fn test_esn_round_trip_across_32bit_boundary() {
    for (name, xform) in suites(true) {
        let link = Link::with(&xform, Mode::Tunnel(IpVersion::V4), IpVersion::V4, |b, dir| {
            let b = b.with_esn(true);
            match dir {
                Direction::Outbound => b.with_initial_sqn(0xFFFF_FFFE),
                Direction::Inbound => b.with_initial_sqn(0xFFFF_FFF0),
            }
        });

        let packets: Vec<Vec<u8>> = (0..4u8)
            .map(|i| ipv4_packet(&payload(40 + i as usize, i), 17))
            .collect();
        let mut mbufs: Vec<Mbuf> = packets.iter().map(|p| mbuf(p, 0, 20)).collect();

        assert_eq!(link.encrypt(&mut mbufs).accepted, 4, "{}", name);

        // only the low half travels in the header
        let lows: Vec<u32> = mbufs.iter().map(|mb| esp_seq(mb, 20)).collect();
        assert_eq!(lows, vec![0xFFFF_FFFE, 0xFFFF_FFFF, 0, 1], "{}", name);
        assert_eq!(link.out_sa.next_sqn(), Some(0x1_0000_0002), "{}", name);

        let inb = link.decrypt(&mut mbufs);
        assert_eq!(inb.accepted, 4, "{}: {:?}", name, inb.error);
        for (mb, orig) in mbufs.iter().zip(&packets) {
            assert_eq!(&mb.to_vec(), orig, "{}", name);
        }
        assert_eq!(link.in_sa.replay_high(), Some(0x1_0000_0001), "{}", name);
    }
}

#[test]
fn test_esn_wrong_high_bits_fail_authentication() {
    let xform = CryptoXform::cipher_auth(
        CipherAlgorithm::AesCbc,
        &[1; 16],
        AuthAlgorithm::HmacSha256,
        &[2; 32],
    );
    // receiver believes it is one epoch ahead, outside the window
    let link = Link::with(&xform, Mode::Transport, IpVersion::V4, |b, dir| {
        let b = b.with_esn(true);
        match dir {
            Direction::Outbound => b.with_initial_sqn(5),
            Direction::Inbound => b.with_initial_sqn(0x1_0000_0100),
        }
    });

    let pkt = ipv4_packet(&payload(20, 0), 17);
    let mut mbufs = vec![mbuf(&pkt, 0, 20)];
    assert_eq!(link.encrypt(&mut mbufs).accepted, 1);

    let inb = link.decrypt(&mut mbufs);
    assert_eq!(inb.accepted, 0);
    assert_eq!(inb.error, Some(Error::OffloadFailed));
    assert_eq!(link.in_sa.stats().snapshot().auth_failed, 1);
    assert_eq!(link.in_sa.replay_high(), Some(0x1_0000_0100));
}

//
// Test Cases - Anti-Replay
//

fn encrypted_batch(link: &Link, n: usize) -> Vec<Mbuf> {
    let mut mbufs: Vec<Mbuf> = (0..n)
        .map(|i| mbuf(&ipv4_packet(&payload(24, i as u8), 17), 0, 20))
        .collect();
    assert_eq!(link.encrypt(&mut mbufs).accepted, n);
    mbufs
}

#[test]
fn test_replayed_packet_rejected() {
    let link = Link::new(&gcm(), Mode::Tunnel(IpVersion::V4), IpVersion::V4);
    let wire = encrypted_batch(&link, 1);

    let mut first = wire.clone();
    assert_eq!(link.decrypt(&mut first).accepted, 1);

    let mut again = wire.clone();
    let inb = link.decrypt(&mut again);
    assert_eq!(inb.accepted, 0);
    assert_eq!(inb.error, Some(Error::ReplayDetected(1)));
    assert_eq!(inb.error_class(), Some(ErrorClass::BadMessage));
    assert_eq!(again[0].to_vec(), wire[0].to_vec());

    let stats = link.in_sa.stats().snapshot();
    assert_eq!(stats.packets, 1);
    assert_eq!(stats.replay_rejected, 1);
}

#[test]
fn test_duplicate_within_one_batch() {
    let link = Link::new(&gcm(), Mode::Tunnel(IpVersion::V4), IpVersion::V4);
    let wire = encrypted_batch(&link, 2);

    let mut batch = vec![wire[0].clone(), wire[1].clone(), wire[0].clone()];
    let inb = link.decrypt(&mut batch);

    assert_eq!(inb.accepted, 2);
    assert_eq!(inb.error, Some(Error::ReplayDetected(1)));
    assert_eq!(link.in_sa.replay_high(), Some(2));
}

#[test]
fn test_reordered_delivery_inside_window() {
    let link = Link::new(&gcm(), Mode::Tunnel(IpVersion::V4), IpVersion::V4);
    let wire = encrypted_batch(&link, 6);

    // 6 first, then 2..=5, then 1
    let mut late: Vec<Mbuf> = vec![wire[5].clone()];
    assert_eq!(link.decrypt(&mut late).accepted, 1);

    let mut middle: Vec<Mbuf> = wire[1..5].to_vec();
    assert_eq!(link.decrypt(&mut middle).accepted, 4);

    let mut oldest = vec![wire[0].clone()];
    assert_eq!(link.decrypt(&mut oldest).accepted, 1);
    assert_eq!(link.in_sa.replay_high(), Some(6));

    let mut replay: Vec<Mbuf> = wire.clone();
    let inb = link.decrypt(&mut replay);
    assert_eq!(inb.accepted, 0);
    assert_eq!(link.in_sa.stats().snapshot().replay_rejected, 6);
}

#[test]
fn test_stale_packet_behind_window() {
    let link = Link::new(&gcm(), Mode::Tunnel(IpVersion::V4), IpVersion::V4);
    let wire = encrypted_batch(&link, 70);

    let mut newest = vec![wire[69].clone()];
    assert_eq!(link.decrypt(&mut newest).accepted, 1);

    let mut oldest = vec![wire[0].clone()];
    let inb = link.decrypt(&mut oldest);
    assert_eq!(inb.accepted, 0);
    assert_eq!(inb.error, Some(Error::StaleSequence(1)));

    // 70 - 64 + 1 = 7 is the oldest number still inside
    let mut edge = vec![wire[6].clone()];
    assert_eq!(link.decrypt(&mut edge).accepted, 1);
}

#[test]
fn test_replay_window_disabled_accepts_duplicates() {
    let link = Link::with(&gcm(), Mode::Tunnel(IpVersion::V4), IpVersion::V4, |b, _| {
        b.with_replay_window(0)
    });
    let wire = encrypted_batch(&link, 1);

    for _ in 0..3 {
        let mut copy = wire.clone();
        assert_eq!(link.decrypt(&mut copy).accepted, 1);
    }
    assert_eq!(link.in_sa.replay_high(), None);
}

//
// Test Cases - Integrity And Partial Failure
//

#[test]
fn test_corrupted_padding_leaves_window_untouched() {
    let link = Link::new(&null_null(), Mode::Tunnel(IpVersion::V4), IpVersion::V4);

    // 21 + 2 trailer bytes -> one pad byte at 4-byte alignment
    let pkt = ipv4_packet(&payload(1, 0), 17);
    let mut mbufs = vec![mbuf(&pkt, 0, 20)];
    assert_eq!(link.encrypt(&mut mbufs).accepted, 1);

    let len = mbufs[0].pkt_len();
    let mut tail = [0u8; 3];
    mbufs[0].copy_out(len - 3, &mut tail).unwrap();
    assert_eq!(tail, [1, 1, 4]);

    flip_byte(&mut mbufs[0], len - 3);
    let inb = link.decrypt(&mut mbufs);

    assert_eq!(inb.accepted, 0);
    assert!(matches!(inb.error, Some(Error::InvalidPadding { index: 0 })));
    assert_eq!(link.in_sa.replay_high(), Some(0));

    // the intact retransmission is still welcome
    let mut fresh = vec![mbuf(&pkt, 0, 20)];
    let link2 = Link::new(&null_null(), Mode::Tunnel(IpVersion::V4), IpVersion::V4);
    assert_eq!(link2.encrypt(&mut fresh).accepted, 1);
    assert_eq!(link2.decrypt(&mut fresh).accepted, 1);
    assert_eq!(fresh[0].to_vec(), pkt);
}

#[test]
fn test_wrong_inner_protocol_in_tunnel() {
    // sender claims IPv6 inside, receiver expects IPv4
    let xform = null_null();
    let sender = Link::new(&xform, Mode::Tunnel(IpVersion::V4), IpVersion::V6);
    let receiver = Link::new(&xform, Mode::Tunnel(IpVersion::V4), IpVersion::V4);

    let mut mbufs = vec![mbuf(&ipv6_packet(&payload(8, 0), 17, false), 0, 40)];
    assert_eq!(sender.encrypt(&mut mbufs).accepted, 1);

    let inb = receiver.decrypt(&mut mbufs);
    assert_eq!(inb.accepted, 0);
    assert_eq!(
        inb.error,
        Some(Error::InvalidNextHeader {
            expected: 4,
            actual: 41
        })
    );
}

#[test]
fn test_partial_batch_failure_moves_bad_packet_to_tail() {
    let link = Link::new(&gcm(), Mode::Tunnel(IpVersion::V4), IpVersion::V4);
    let packets: Vec<Vec<u8>> = (0..5u8)
        .map(|i| ipv4_packet(&payload(32, i), 17))
        .collect();
    let mut mbufs: Vec<Mbuf> = packets.iter().map(|p| mbuf(p, 0, 20)).collect();
    assert_eq!(link.encrypt(&mut mbufs).accepted, 5);

    // first ciphertext byte after outer header, ESP header and IV
    flip_byte(&mut mbufs[2], 20 + 8 + 8);
    let corrupted = mbufs[2].to_vec();

    let inb = link.decrypt(&mut mbufs);
    assert_eq!(inb.accepted, 4);
    assert_eq!(inb.error, Some(Error::OffloadFailed));

    let expected = [&packets[0], &packets[1], &packets[3], &packets[4]];
    for (mb, orig) in mbufs.iter().zip(expected) {
        assert_eq!(&mb.to_vec(), orig);
    }
    assert_eq!(mbufs[4].to_vec(), corrupted);
    assert!(mbufs[4]
        .ol_flags
        .contains(OffloadFlags::RX_SEC_OFFLOAD_FAILED));

    let stats = link.in_sa.stats().snapshot();
    assert_eq!(stats.packets, 4);
    assert_eq!(stats.auth_failed, 1);
    // sequence 3 never made it into the window
    assert_eq!(link.in_sa.replay_high(), Some(5));
}

#[test]
fn test_sequence_exhaustion_fails_rest_of_batch() {
    let link = Link::with(&gcm(), Mode::Tunnel(IpVersion::V4), IpVersion::V4, |b, dir| {
        match dir {
            Direction::Outbound => b.with_initial_sqn(u32::MAX as u64 - 1),
            Direction::Inbound => b,
        }
    });

    let packets: Vec<Vec<u8>> = (0..3u8)
        .map(|i| ipv4_packet(&payload(10, i), 17))
        .collect();
    let mut mbufs: Vec<Mbuf> = packets.iter().map(|p| mbuf(p, 0, 20)).collect();

    let out = link.encrypt(&mut mbufs);
    assert_eq!(out.accepted, 1);
    assert_eq!(out.error, Some(Error::SequenceOverflow(u32::MAX as u64)));
    assert_eq!(out.error_class().map(ErrorClass::errno), Some(75));

    assert_eq!(esp_seq(&mbufs[0], 20), u32::MAX - 1);
    assert_eq!(mbufs[1].to_vec(), packets[1]);
    assert_eq!(mbufs[2].to_vec(), packets[2]);

    // nothing more can be sent on this SA
    let mut more = vec![mbuf(&packets[0], 0, 20)];
    assert_eq!(link.encrypt(&mut more).accepted, 0);
    assert_eq!(link.out_sa.stats().snapshot().sqn_overflow, 3);
}

#[test]
fn test_tailroom_shortage_rejects_single_packet() {
    let link = Link::new(&gcm(), Mode::Tunnel(IpVersion::V4), IpVersion::V4);
    let pkt = ipv4_packet(&payload(40, 0), 17);

    let mut mbufs = vec![
        mbuf(&pkt, 0, 20),
        Mbuf::from_bytes(&pkt, 128, 4).with_header_lens(0, 20),
        mbuf(&pkt, 0, 20),
    ];

    let out = link.encrypt(&mut mbufs);
    assert_eq!(out.accepted, 2);
    assert_eq!(out.error_class(), Some(ErrorClass::NoSpace));
    assert_eq!(mbufs[2].to_vec(), pkt);

    assert_eq!(link.decrypt(&mut mbufs[..2]).accepted, 2);
    assert_eq!(mbufs[0].to_vec(), pkt);
    assert_eq!(mbufs[1].to_vec(), pkt);
}

//
// Test Cases - Offload Strategies
//

/// NIC security context that records nothing beyond the default metadata
struct Nic;

impl SecurityContext for Nic {}

/// Protocol offload device that completes every op with `status`
struct ProtocolOffload {
    status: OpStatus,
}

impl CryptoDevice for ProtocolOffload {
    fn name(&self) -> &'static str {
        "protocol_offload"
    }

    fn process(&self, ops: &mut [CryptoOp], mbufs: &mut [Mbuf]) -> usize {
        let n = ops.len().min(mbufs.len());
        for op in &mut ops[..n] {
            op.status = self.status;
        }
        if self.status == OpStatus::Success {
            n
        } else {
            0
        }
    }
}

fn offload_sa(action: ActionType, direction: Direction) -> Sa {
    let params = SaParams::builder()
        .with_spi(0x0200_0002)
        .with_direction(direction)
        .with_mode(Mode::Transport)
        .with_action(action)
        .with_crypto(gcm())
        .build()
        .unwrap();
    Sa::new(&params).unwrap()
}

fn inline_session<'a>(sa: &'a Sa, nic: &'a dyn SecurityContext, handle: u64) -> Session<'a> {
    let binding = SessionBinding::Security {
        session: SecuritySessionHandle(handle),
        ctx: Some(nic),
    };
    Session::new(sa, binding).unwrap()
}

#[test]
fn test_lookaside_protocol_batch() {
    init_tracing();
    let sa = offload_sa(ActionType::LookasideProtocol, Direction::Inbound);
    let binding = SessionBinding::Security {
        session: SecuritySessionHandle(9),
        ctx: None,
    };
    let session = Session::new(&sa, binding).unwrap();

    let pkt = ipv4_packet(&payload(64, 0), 50);
    let mut mbufs = vec![mbuf(&pkt, 0, 20), mbuf(&pkt, 0, 20)];
    let mut ops = CryptoOp::batch(2, 0);

    let ok = ProtocolOffload {
        status: OpStatus::Success,
    };
    let out = session.run(&ok, &mut mbufs, &mut ops).unwrap();
    assert_eq!(out.accepted, 2);
    assert_eq!(mbufs[0].to_vec(), pkt);

    let failing = ProtocolOffload {
        status: OpStatus::AuthFailed,
    };
    let out = session.run(&failing, &mut mbufs, &mut ops).unwrap();
    assert_eq!(out.accepted, 0);
    assert_eq!(out.error, Some(Error::OffloadFailed));
    assert_eq!(sa.stats().snapshot().auth_failed, 2);
}

#[test]
fn test_inline_crypto_round_trip() {
    init_tracing();
    let nic = Nic;
    let out_sa = offload_sa(ActionType::InlineCrypto, Direction::Outbound);
    let in_sa = offload_sa(ActionType::InlineCrypto, Direction::Inbound);

    let pkt = ipv4_packet(&payload(45, 3), 17);
    let mut mbufs = vec![mbuf(&pkt, 0, 20), mbuf(&pkt, 0, 20)];
    let mut ops = CryptoOp::batch(2, 0);
    let dev = SoftCryptoDevice::new();

    let out = inline_session(&out_sa, &nic, 3).run(&dev, &mut mbufs, &mut ops).unwrap();
    assert_eq!(out.accepted, 2);
    for (i, mb) in mbufs.iter().enumerate() {
        assert!(mb.ol_flags.contains(OffloadFlags::TX_SEC_OFFLOAD));
        assert_eq!(mb.sec_session, Some(SecuritySessionHandle(3)));
        assert_eq!(esp_seq(mb, 20), i as u32 + 1);
    }

    // the NIC decrypts in place and hands the packets up flagged
    for mb in &mut mbufs {
        mb.ol_flags = OffloadFlags::RX_SEC_OFFLOAD;
    }
    let inb = inline_session(&in_sa, &nic, 3).run(&dev, &mut mbufs, &mut ops).unwrap();
    assert_eq!(inb.accepted, 2);
    for mb in &mbufs {
        assert_eq!(mb.to_vec(), pkt);
        assert!(!mb.ol_flags.contains(OffloadFlags::RX_SEC_OFFLOAD));
    }
    assert_eq!(in_sa.replay_high(), Some(2));
}

#[test]
fn test_inline_crypto_offload_failure() {
    init_tracing();
    let nic = Nic;
    let in_sa = offload_sa(ActionType::InlineCrypto, Direction::Inbound);
    let session = inline_session(&in_sa, &nic, 4);

    let pkt = ipv4_packet(&payload(45, 3), 50);
    let mut mbufs = vec![mbuf(&pkt, 0, 20)];
    mbufs[0].ol_flags = OffloadFlags::RX_SEC_OFFLOAD | OffloadFlags::RX_SEC_OFFLOAD_FAILED;

    let inb = session.process(&mut mbufs);
    assert_eq!(inb.accepted, 0);
    assert_eq!(inb.error, Some(Error::OffloadFailed));
    assert_eq!(in_sa.replay_high(), Some(0));
}

//
// Test Cases - Concurrency
//

#[test]
fn test_concurrent_outbound_reservations_are_unique() {
    let link = Link::with(&gcm(), Mode::Tunnel(IpVersion::V4), IpVersion::V4, |b, _| {
        b.with_atomic_sqn(true)
    });
    let pkt = ipv4_packet(&payload(16, 0), 17);
    let (link, pkt) = (&link, &pkt);

    let mut seen: Vec<u32> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(move || {
                    let mut seqs = Vec::new();
                    for _ in 0..25 {
                        let mut mbufs: Vec<Mbuf> = (0..8).map(|_| mbuf(pkt, 0, 20)).collect();
                        assert_eq!(link.encrypt(&mut mbufs).accepted, 8);
                        seqs.extend(mbufs.iter().map(|mb| esp_seq(mb, 20)));
                    }
                    seqs
                })
            })
            .collect();

        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    seen.sort_unstable();
    let expected: Vec<u32> = (1..=800).collect();
    assert_eq!(seen, expected);
    assert_eq!(link.out_sa.next_sqn(), Some(801));
}

#[test]
fn test_concurrent_inbound_batches_share_window() {
    let link = Link::with(&gcm(), Mode::Tunnel(IpVersion::V4), IpVersion::V4, |b, _| {
        b.with_atomic_sqn(true).with_replay_window(256)
    });
    let wire = encrypted_batch(&link, 200);

    let accepted: usize = std::thread::scope(|s| {
        let workers: Vec<_> = wire
            .chunks(50)
            .map(|chunk| {
                let link = &link;
                s.spawn(move || {
                    chunk
                        .chunks(10)
                        .map(|batch| link.decrypt(&mut batch.to_vec()).accepted)
                        .sum::<usize>()
                })
            })
            .collect();

        workers.into_iter().map(|w| w.join().unwrap()).sum()
    });

    assert_eq!(accepted, 200);
    assert_eq!(link.in_sa.replay_high(), Some(200));

    let mut replay = wire[..10].to_vec();
    assert_eq!(link.decrypt(&mut replay).accepted, 0);
}

//
// Property Tests
//

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_round_trip_any_length(
        suite in 0usize..9,
        len in 0usize..600,
        seed in any::<u8>(),
        transport in any::<bool>(),
    ) {
        let (name, xform) = suites(false).swap_remove(suite);
        let pkt = ipv4_packet(&payload(len, seed), 17);

        let (link, bytes, l2) = if transport {
            let link = Link::new(&xform, Mode::Transport, IpVersion::V4);
            (link, with_ethernet(&pkt, 0x0800), 14)
        } else {
            let link = Link::new(&xform, Mode::Tunnel(IpVersion::V4), IpVersion::V4);
            (link, pkt, 0)
        };

        let mut mbufs = vec![mbuf(&bytes, l2, 20)];
        prop_assert_eq!(link.encrypt(&mut mbufs).accepted, 1, "{}", name);
        prop_assert_eq!(link.decrypt(&mut mbufs).accepted, 1, "{}", name);
        prop_assert_eq!(mbufs[0].to_vec(), bytes);
    }

    #[test]
    fn prop_any_delivery_order_accepts_each_once(
        order in Just((0usize..32).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let link = Link::new(&null_null(), Mode::Tunnel(IpVersion::V4), IpVersion::V4);
        let wire = encrypted_batch(&link, 32);

        let mut shuffled: Vec<Mbuf> = order.iter().map(|&i| wire[i].clone()).collect();
        prop_assert_eq!(link.decrypt(&mut shuffled).accepted, 32);
        prop_assert_eq!(link.in_sa.replay_high(), Some(32));

        let mut again: Vec<Mbuf> = order.iter().map(|&i| wire[i].clone()).collect();
        prop_assert_eq!(link.decrypt(&mut again).accepted, 0);
    }
}
