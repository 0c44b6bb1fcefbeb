//! Fuzz target for the inbound ESP path.
//!
//! Arbitrary bytes are handed to an inbound SA as a received packet and
//! run through prepare, the software crypto device and process. This
//! fuzzer looks for:
//! - Panics on truncated or inconsistent headers and trailers
//! - Out-of-bounds packet offsets
//! - Replay window corruption
//!
//! The first input byte picks the SA shape, the rest is the packet.
//! NULL/NULL SAs let the fuzzer reach trailer and decap checks without
//! forging an ICV.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run esp_inbound -- -max_total_time=300
//! ```

#![no_main]
use corvid_platform::{CryptoOp, Mbuf};
use corvid_proto::ipsec::{
    crypto::{
        AeadAlgorithm, AuthAlgorithm, CipherAlgorithm, CryptoDirection, CryptoXform,
        SoftCryptoDevice,
    },
    Direction, IpVersion, Mode, Sa, SaParams, Session, SessionBinding,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&shape, pkt)) = data.split_first() else {
        return;
    };

    let xform = if shape & 1 == 0 {
        CryptoXform::cipher_auth(CipherAlgorithm::Null, &[], AuthAlgorithm::Null, &[])
    } else {
        CryptoXform::aead(AeadAlgorithm::AesGcm, &[7; 16], false)
    };
    let mode = if shape & 2 == 0 {
        Mode::Transport
    } else {
        Mode::Tunnel(IpVersion::V4)
    };
    let version = if shape & 4 == 0 { IpVersion::V4 } else { IpVersion::V6 };
    let l3_len = if version == IpVersion::V4 { 20 } else { 40 };
    let l2_len = usize::from(shape >> 4);

    let Ok(params) = SaParams::builder()
        .with_spi(0x100)
        .with_direction(Direction::Inbound)
        .with_mode(mode)
        .with_ip_version(version)
        .with_crypto(xform.clone())
        .build()
    else {
        return;
    };
    let Ok(sa) = Sa::new(&params) else {
        return;
    };

    let dev = SoftCryptoDevice::new();
    let Ok(handle) = dev.create_session(&xform, CryptoDirection::Decrypt) else {
        return;
    };
    let Ok(session) = Session::new(&sa, SessionBinding::Crypto(handle)) else {
        return;
    };

    let mut mbufs = vec![
        Mbuf::from_bytes(pkt, 64, 64).with_header_lens(l2_len, l3_len),
        Mbuf::from_bytes(pkt, 64, 64).with_header_lens(l2_len, l3_len),
    ];
    let mut ops = CryptoOp::batch(mbufs.len(), 0);

    if let Ok(out) = session.run(&dev, &mut mbufs, &mut ops) {
        assert!(out.accepted <= 1, "identical packets accepted twice");
        if out.accepted < mbufs.len() {
            assert!(out.error.is_some());
        }
    }
});
