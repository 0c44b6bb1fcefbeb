//! Fuzz target for outbound transport encapsulation.
//!
//! Transport mode walks the caller's L3 header (IPv6 extension headers
//! included) to find the protocol field it rewrites. This fuzzer feeds
//! arbitrary headers and header lengths and checks that every accepted
//! packet decapsulates back to the original bytes.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run esp_outbound -- -max_total_time=300
//! ```

#![no_main]
use corvid_platform::{CryptoOp, Mbuf};
use corvid_proto::ipsec::{
    crypto::{AuthAlgorithm, CipherAlgorithm, CryptoDirection, CryptoXform, SoftCryptoDevice},
    Direction, IpVersion, Mode, Sa, SaParams, Session, SessionBinding,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&shape, pkt)) = data.split_first() else {
        return;
    };

    let version = if shape & 1 == 0 { IpVersion::V4 } else { IpVersion::V6 };
    let l3_len = usize::from(shape >> 1);

    let xform = CryptoXform::cipher_auth(
        CipherAlgorithm::AesCbc,
        &[3; 16],
        AuthAlgorithm::HmacSha256,
        &[4; 32],
    );
    let params = |direction| {
        SaParams::builder()
            .with_spi(0x200)
            .with_direction(direction)
            .with_mode(Mode::Transport)
            .with_ip_version(version)
            .with_crypto(xform.clone())
            .build()
    };
    let (Ok(out_params), Ok(in_params)) = (params(Direction::Outbound), params(Direction::Inbound))
    else {
        return;
    };
    let (Ok(out_sa), Ok(in_sa)) = (Sa::new(&out_params), Sa::new(&in_params)) else {
        return;
    };

    let dev = SoftCryptoDevice::new();
    let (Ok(enc), Ok(dec)) = (
        dev.create_session(&xform, CryptoDirection::Encrypt),
        dev.create_session(&xform, CryptoDirection::Decrypt),
    ) else {
        return;
    };
    let (Ok(outbound), Ok(inbound)) = (
        Session::new(&out_sa, SessionBinding::Crypto(enc)),
        Session::new(&in_sa, SessionBinding::Crypto(dec)),
    ) else {
        return;
    };

    let mut mbufs = vec![Mbuf::from_bytes(pkt, 256, 128).with_header_lens(0, l3_len)];
    let mut ops = CryptoOp::batch(1, 0);

    let Ok(out) = outbound.run(&dev, &mut mbufs, &mut ops) else {
        return;
    };
    if out.accepted == 0 {
        assert_eq!(mbufs[0].to_vec(), pkt, "rejected packet was modified");
        return;
    }

    let Ok(inb) = inbound.run(&dev, &mut mbufs, &mut ops) else {
        return;
    };
    assert_eq!(inb.accepted, 1, "own packet rejected: {:?}", inb.error);
});
