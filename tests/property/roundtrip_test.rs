// tests/property/roundtrip_test.rs

//! Codec round-trip properties: `decode(encode(x)) == x` for arbitrary
//! frames, segments and wire primitives.

use bytes::{Bytes, BytesMut};
use lazulite::core::protocol::segment::{Segment, SegmentCodec, segment_payloads};
use lazulite::core::protocol::types;
use lazulite::core::protocol::{Compression, Frame, FrameCodec, Opcode, ProtocolVersion};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn arb_opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![
        Just(Opcode::Error),
        Just(Opcode::Ready),
        Just(Opcode::Query),
        Just(Opcode::Result),
        Just(Opcode::Prepare),
        Just(Opcode::Execute),
        Just(Opcode::Register),
        Just(Opcode::Event),
        Just(Opcode::Batch),
        Just(Opcode::Supported),
        Just(Opcode::AuthChallenge),
        Just(Opcode::AuthSuccess),
    ]
}

fn arb_compression() -> impl Strategy<Value = Compression> {
    prop_oneof![
        Just(Compression::None),
        Just(Compression::Lz4),
        Just(Compression::Snappy),
    ]
}

proptest! {
    #[test]
    fn frame_roundtrip(
        opcode in arb_opcode(),
        compression in arb_compression(),
        stream_id in 0i16..=i16::MAX,
        body in proptest::collection::vec(any::<u8>(), 0..4096),
    ) {
        let mut codec = FrameCodec::new(ProtocolVersion::V4, compression, 64 * 1024 * 1024);
        let body = Bytes::from(body);
        let frame = Frame::request(ProtocolVersion::V4, stream_id, opcode, body.clone());

        let mut wire = BytesMut::new();
        codec.encode(frame, &mut wire).unwrap();
        wire[0] |= 0x80; // flip to the response direction

        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        prop_assert_eq!(decoded.stream_id, stream_id);
        prop_assert_eq!(decoded.opcode, opcode);
        prop_assert_eq!(decoded.body, body);
        prop_assert!(wire.is_empty());
    }

    #[test]
    fn segment_roundtrip(
        compress in any::<bool>(),
        self_contained in any::<bool>(),
        payload in proptest::collection::vec(any::<u8>(), 1..8192),
    ) {
        let mut codec = SegmentCodec::new(compress);
        let payload = Bytes::from(payload);
        let segment = Segment { payload: payload.clone(), self_contained };

        let mut wire = BytesMut::new();
        codec.encode(segment, &mut wire).unwrap();
        let decoded = codec.decode(&mut wire).unwrap().unwrap();
        prop_assert_eq!(decoded.payload, payload);
        prop_assert_eq!(decoded.self_contained, self_contained);
    }

    #[test]
    fn segmentation_preserves_bytes(total in 1usize..400_000) {
        let original: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let segments = segment_payloads(Bytes::from(original.clone()));
        let rejoined: Vec<u8> = segments
            .iter()
            .flat_map(|s| s.payload.iter().copied())
            .collect();
        prop_assert_eq!(rejoined, original);
    }

    #[test]
    fn string_roundtrip(text in "\\PC{0,200}") {
        let mut buf = BytesMut::new();
        types::write_string(&mut buf, &text);
        let mut bytes = buf.freeze();
        prop_assert_eq!(types::read_string(&mut bytes).unwrap(), text);
    }

    #[test]
    fn bytes_roundtrip(value in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..1024))) {
        let mut buf = BytesMut::new();
        types::write_bytes(&mut buf, value.as_deref());
        let mut bytes = buf.freeze();
        let decoded = types::read_bytes(&mut bytes).unwrap();
        prop_assert_eq!(decoded.as_deref(), value.as_deref());
    }

    #[test]
    fn long_roundtrip(v in any::<i64>()) {
        let mut buf = BytesMut::new();
        types::write_long(&mut buf, v);
        let mut bytes = buf.freeze();
        prop_assert_eq!(types::read_long(&mut bytes).unwrap(), v);
    }
}
