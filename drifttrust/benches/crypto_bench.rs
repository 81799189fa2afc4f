// DriftTrust cryptographic benchmarks using criterion.
//
// Measures:
//   - RC4 keystream throughput at header and segment sizes
//   - Keyed sequence source output rate
//   - Header key derivation
//   - Full reference handshake latency

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use drifttrust::handshake::protocol::{Initiator, Responder};
use drifttrust::{derive_header_keys, KeyStream, Rc4, SequenceSource, SessionRole};

// ---------------------------------------------------------------------------
// RC4 keystream
// ---------------------------------------------------------------------------

fn bench_rc4(c: &mut Criterion) {
    let sizes: &[usize] = &[32, 128, 1400];

    let mut group = c.benchmark_group("rc4_apply");
    for &size in sizes {
        let mut rc4 = Rc4::new(b"benchmark key 20 byt").unwrap();
        let mut buf = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{size}B")), &size, |b, _| {
            b.iter(|| {
                rc4.apply(black_box(&mut buf));
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Sequence sources
// ---------------------------------------------------------------------------

fn bench_sequence_source(c: &mut Criterion) {
    let mut keys = derive_header_keys(&[0x11u8; 32], SessionRole::Outgoing).unwrap();
    c.bench_function("keyed_sequence_next_u32", |b| {
        b.iter(|| {
            black_box(keys.sequence_out.next_u32());
        });
    });
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

fn bench_derive(c: &mut Criterion) {
    let secret = [0x22u8; 32];
    c.bench_function("derive_header_keys", |b| {
        b.iter(|| {
            black_box(derive_header_keys(black_box(&secret), SessionRole::Incoming).unwrap());
        });
    });
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

fn bench_handshake(c: &mut Criterion) {
    c.bench_function("reference_handshake", |b| {
        b.iter(|| {
            let mut i = Initiator::new();
            let mut r = Responder::new();
            let hello = i.create_hello(64).unwrap();
            let (reply, _) = r.process_hello(&hello, 0).unwrap();
            black_box(i.process_reply(&reply).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_rc4,
    bench_sequence_source,
    bench_derive,
    bench_handshake
);
criterion_main!(benches);
