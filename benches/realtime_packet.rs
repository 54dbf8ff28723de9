//! Criterion benchmarks for realtime packet construction and the credential
//! cipher.
//!
//! Run with:
//! ```bash
//! cargo bench --bench realtime_packet
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use xled::crypto;
use xled::messages::{Frame, Rgb, Token};
use xled::stream::build_packet;

fn gradient(leds: usize) -> Frame {
    Frame::new(
        (0..leds)
            .map(|i| Rgb::new(i as u8, (i * 2) as u8, 255 - i as u8))
            .collect(),
    )
}

fn bench_build_packet(c: &mut Criterion) {
    let token = Token::new([0x5a; 8]);
    let mut group = c.benchmark_group("build_packet");
    for leds in [105usize, 250] {
        let frame = gradient(leds);
        group.bench_with_input(BenchmarkId::from_parameter(leds), &frame, |b, frame| {
            b.iter(|| build_packet(black_box(&token), black_box(frame)))
        });
    }
    group.finish();
}

fn bench_frame_from_bytes(c: &mut Criterion) {
    let bytes = gradient(250).to_bytes();
    c.bench_function("frame_from_bytes_250", |b| {
        b.iter(|| Frame::from_bytes(black_box(&bytes)))
    });
}

fn bench_challenge_digest(c: &mut Criterion) {
    let challenge: [u8; 32] = core::array::from_fn(|i| i as u8);
    let mac = [0x5c, 0xcf, 0x7f, 0x33, 0xaa, 0xff];
    c.bench_function("challenge_digest", |b| {
        b.iter(|| crypto::compute_challenge_digest(black_box(&challenge), black_box(&mac)))
    });
}

criterion_group!(
    benches,
    bench_build_packet,
    bench_frame_from_bytes,
    bench_challenge_digest
);
criterion_main!(benches);
