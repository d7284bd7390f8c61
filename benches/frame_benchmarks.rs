//! Frame codec and header compression throughput.
//!
//! Run with: cargo bench

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use h2mux::{Frame, HeaderCodec, HpackCodec, Header};
use rand::Rng;

fn random_payload(size: usize) -> Bytes {
    let mut payload = vec![0u8; size];
    rand::rng().fill(&mut payload[..]);
    Bytes::from(payload)
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [64, 1024, 16_384] {
        let frame = Frame::data(1, random_payload(size), false);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("data", size), &frame, |b, frame| {
            let mut buf = BytesMut::with_capacity(size + 9);
            b.iter(|| {
                buf.clear();
                frame.encode_into(black_box(&mut buf)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");

    for size in [64, 1024, 16_384] {
        let wire = Frame::data(1, random_payload(size), true).serialize().unwrap();
        group.throughput(Throughput::Bytes(wire.len() as u64));

        group.bench_with_input(BenchmarkId::new("data", size), &wire, |b, wire| {
            b.iter(|| Frame::parse(black_box(wire)).unwrap());
        });
    }

    group.finish();
}

fn bench_header_block(c: &mut Criterion) {
    let headers = vec![
        Header::new(":method", "GET"),
        Header::new(":scheme", "https"),
        Header::new(":authority", "example.com"),
        Header::new(":path", "/assets/app.js"),
        Header::new("accept", "*/*"),
        Header::new("user-agent", "h2mux-bench"),
    ];

    c.bench_function("hpack_encode_request", |b| {
        let mut codec = HpackCodec::new(4_096);
        b.iter(|| codec.encode(black_box(&headers)).unwrap());
    });

    c.bench_function("header_block_split", |b| {
        let block = random_payload(40_000);
        b.iter(|| Frame::header_block(1, black_box(block.clone()), true, 16_384));
    });
}

criterion_group!(benches, bench_encode, bench_parse, bench_header_block);
criterion_main!(benches);
