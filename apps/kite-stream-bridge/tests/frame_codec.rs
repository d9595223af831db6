//! Frame Codec Property Tests
//!
//! A frame carrying several packets must decode to the same ticks, in the
//! same order, as the packets sent one per frame.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use kite_stream_bridge::FrameCodec;
use kite_stream_bridge::infrastructure::kite::{CodecError, FeedMessage};
use proptest::prelude::*;

use common::{frame, full_packet, ltp_packet, quote_packet};

fn packet_strategy() -> impl Strategy<Value = Vec<u8>> {
    (1u32..u32::MAX, 1_000u32..10_000_000, 0u8..3).prop_map(|(token, price, kind)| match kind {
        0 => ltp_packet(token, price),
        1 => quote_packet(token, price),
        _ => full_packet(token, price),
    })
}

proptest! {
    #[test]
    fn multi_packet_frame_matches_single_packet_frames(
        packets in prop::collection::vec(packet_strategy(), 1..12)
    ) {
        let codec = FrameCodec::new();

        let combined = codec.decode(&frame(&packets)).unwrap();
        let separate: Vec<FeedMessage> = packets
            .iter()
            .flat_map(|packet| codec.decode(&frame(std::slice::from_ref(packet))).unwrap())
            .collect();

        prop_assert_eq!(combined.len(), packets.len());
        prop_assert_eq!(combined, separate);
    }

    #[test]
    fn truncation_never_panics(
        packets in prop::collection::vec(packet_strategy(), 1..6),
        cut in 2usize..400
    ) {
        let codec = FrameCodec::new();
        let mut bytes = frame(&packets);
        let full_len = bytes.len();
        if cut < full_len {
            bytes.truncate(cut);
            let decoded = codec.decode(&bytes);
            prop_assert!(matches!(decoded, Err(CodecError::MalformedFrame(_))));
        }
    }
}

#[test]
fn truncated_depth_fails_and_next_frame_still_decodes() {
    let codec = FrameCodec::new();

    let mut truncated = frame(&[full_packet(256_265, 2_450_010)]);
    truncated.truncate(2 + 2 + 100);
    assert!(matches!(
        codec.decode(&truncated),
        Err(CodecError::MalformedFrame(_))
    ));

    let next = codec
        .decode(&frame(&[ltp_packet(256_265, 2_450_020)]))
        .unwrap();
    assert_eq!(next.len(), 1);
    match &next[0] {
        FeedMessage::Tick(tick) => assert_eq!(tick.last_price.to_string(), "24500.20"),
        other => panic!("expected a tick, got {other:?}"),
    }
}
