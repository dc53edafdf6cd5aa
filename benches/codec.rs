//! Codec benchmarks
//!
//! Benchmarks STUN message encode/decode, hole-punch negotiation framing and
//! punch packet validation.
//!
//! Run with: `cargo bench --bench codec`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use natpunch_core::nat::{StunAttribute, StunMessage};
use natpunch_core::punch::{
    HolePunchMessage, MAX_ADDRESSES, NONCE_LEN, PacketKind, build_packet, validate_packet,
};
use std::net::SocketAddr;

fn stun_response() -> StunMessage {
    let mapped: SocketAddr = "203.0.113.5:40000".parse().unwrap();
    let origin: SocketAddr = "198.51.100.7:3478".parse().unwrap();
    let other: SocketAddr = "198.51.100.8:3479".parse().unwrap();
    StunMessage::binding_response([7; 12])
        .with_attribute(StunAttribute::XorMappedAddress(mapped))
        .with_attribute(StunAttribute::ResponseOrigin(origin))
        .with_attribute(StunAttribute::OtherAddress(other))
        .with_attribute(StunAttribute::Software("natpunch".into()))
}

/// Benchmark STUN encode and decode
fn bench_stun(c: &mut Criterion) {
    let mut group = c.benchmark_group("stun");
    let msg = stun_response();
    let encoded = msg.encode();
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode_request", |b| {
        b.iter(|| black_box(StunMessage::binding_request().encode()));
    });

    group.bench_function("encode_response", |b| {
        b.iter(|| black_box(msg.encode()));
    });

    group.bench_function("decode_response", |b| {
        b.iter(|| {
            let decoded = StunMessage::decode(black_box(&encoded)).unwrap();
            black_box(decoded.mapped_address())
        });
    });

    group.finish();
}

/// Benchmark Connect framing at different address list sizes
fn bench_holepunch(c: &mut Criterion) {
    let mut group = c.benchmark_group("holepunch_connect");

    for count in [1, 4, MAX_ADDRESSES] {
        let addrs: Vec<String> = (0..count)
            .map(|i| format!("203.0.113.{}:{}", i + 1, 40000 + i))
            .collect();
        let msg = HolePunchMessage::Connect {
            initiator_addrs: addrs.clone(),
            responder_addrs: addrs,
            nonce: vec![0x42; NONCE_LEN],
        };
        let encoded = msg.encode().unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", count), &msg, |b, msg| {
            b.iter(|| black_box(msg.encode().unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("decode", count), &encoded, |b, bytes| {
            b.iter(|| black_box(HolePunchMessage::decode(bytes).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark punch packet build and validation
fn bench_punch_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("punch_packet");
    let nonce = [0x5A; NONCE_LEN];

    for size in [20, 64, 512] {
        let packet = build_packet(PacketKind::Punch, &nonce, size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("build", size), &size, |b, &size| {
            b.iter(|| black_box(build_packet(PacketKind::Reply, &nonce, size)));
        });

        group.bench_with_input(BenchmarkId::new("validate", size), &packet, |b, packet| {
            b.iter(|| black_box(validate_packet(packet, &nonce)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_stun, bench_holepunch, bench_punch_packet);
criterion_main!(benches);
