//! Fuzz target for SSH packet and message parsing.
//!
//! Feeds arbitrary bytes to the unprotected packet decoder and every
//! message parser the client applies to server input. None of them may
//! panic, and a packet that parses must re-encode to the same payload.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use skiff_proto::ssh::auth::{AuthFailure, InfoRequest};
use skiff_proto::ssh::connection::{ChannelMessage, GlobalReply, GlobalRequest};
use skiff_proto::ssh::kex::KexInit;
use skiff_proto::ssh::kex_dh::{KexFlavor, KexReply};
use skiff_proto::ssh::packet::{Packet, PacketDecoder};
use skiff_proto::ssh::transport::Disconnect;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        let serialized = packet.to_bytes();
        let reparsed = Packet::from_bytes(&serialized).expect("Round-trip parsing should never fail");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    let mut decoder = PacketDecoder::new();
    decoder.feed(data);
    while let Ok(Some(_)) = decoder.decode() {}

    let _ = KexInit::from_bytes(data);
    let _ = KexReply::parse(KexFlavor::Ecdh, data);
    let _ = KexReply::parse(KexFlavor::FixedGroup, data);
    let _ = Disconnect::from_bytes(data);
    let _ = AuthFailure::from_bytes(data);
    let _ = InfoRequest::from_bytes(data);
    let _ = GlobalRequest::from_bytes(data);
    let _ = GlobalReply::from_bytes(data);
    let _ = ChannelMessage::parse(data);
});
