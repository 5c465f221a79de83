// benches/codec_bench.rs

//! Frame and segment codec throughput.

use bytes::{Bytes, BytesMut};
use criterion::{Criterion, criterion_group, criterion_main};
use lazulite::core::protocol::segment::{Segment, SegmentCodec};
use lazulite::core::protocol::{Compression, Frame, FrameCodec, Opcode, ProtocolVersion};
use std::hint::black_box;
use tokio_util::codec::{Decoder, Encoder};

fn bench_frame_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    for (label, compression) in [
        ("plain", Compression::None),
        ("lz4", Compression::Lz4),
        ("snappy", Compression::Snappy),
    ] {
        group.bench_function(label, |b| {
            let mut codec = FrameCodec::new(ProtocolVersion::V4, compression, 256 * 1024 * 1024);
            let body = Bytes::from(vec![0x42u8; 16 * 1024]);
            b.iter(|| {
                let frame = Frame::request(ProtocolVersion::V4, 1, Opcode::Query, body.clone());
                let mut buf = BytesMut::with_capacity(32 * 1024);
                codec.encode(frame, &mut buf).unwrap();
                black_box(buf);
            });
        });
    }
    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let mut codec = FrameCodec::new(ProtocolVersion::V4, Compression::None, 256 * 1024 * 1024);
    let body = Bytes::from(vec![0x42u8; 16 * 1024]);
    let frame = Frame::request(ProtocolVersion::V4, 1, Opcode::Result, body);
    let mut encoded = BytesMut::new();
    codec.encode(frame, &mut encoded).unwrap();
    encoded[0] |= 0x80;
    let encoded = encoded.freeze();

    c.bench_function("frame_decode", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(encoded.as_ref());
            black_box(codec.decode(&mut buf).unwrap().unwrap());
        });
    });
}

fn bench_segment_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment");
    for (label, compress) in [("plain", false), ("lz4", true)] {
        group.bench_function(label, |b| {
            let mut codec = SegmentCodec::new(compress);
            let payload = Bytes::from(vec![0x42u8; 32 * 1024]);
            b.iter(|| {
                let mut wire = BytesMut::new();
                codec
                    .encode(
                        Segment {
                            payload: payload.clone(),
                            self_contained: true,
                        },
                        &mut wire,
                    )
                    .unwrap();
                black_box(codec.decode(&mut wire).unwrap().unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_segment_roundtrip
);
criterion_main!(benches);
