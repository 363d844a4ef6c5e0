//! Protocol hot path benchmarks.
//!
//! Measures keypair generation (Elligator2 rejection sampling included),
//! the full ntor handshake, and per-frame encode/decode throughput.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use bytes::BytesMut;
use obfs4::crypto::ntor::{self, Keypair, NodeID};
use obfs4::framing::{Decoder, Encoder, KEY_MATERIAL_LENGTH, MAX_FRAME_PAYLOAD_LENGTH};

fn bench_keypair_generation(c: &mut Criterion) {
    c.bench_function("keypair_identity", |b| {
        b.iter(|| black_box(Keypair::generate(false)))
    });

    // Roughly twice the identity cost: half of all public keys have no
    // representative and are rejected.
    c.bench_function("keypair_representable", |b| {
        b.iter(|| black_box(Keypair::generate(true)))
    });
}

fn bench_ntor_handshake(c: &mut Criterion) {
    let node_id = NodeID::new(&[0x13u8; 20]).unwrap();
    let id_keypair = Keypair::generate(false);

    // Both sides of the agreement; the observed per-endpoint cost is half
    // the reported time.
    c.bench_function("ntor_handshake", |b| {
        b.iter(|| {
            let client = Keypair::generate(true);
            let server = Keypair::generate(true);

            let client_public = client.representative().unwrap().to_public();
            let (server_seed, _) =
                ntor::server_handshake(&client_public, &server, &id_keypair, &node_id).unwrap();

            let server_public = server.representative().unwrap().to_public();
            let (client_seed, _) =
                ntor::client_handshake(&client, &server_public, id_keypair.public(), &node_id)
                    .unwrap();

            assert_eq!(client_seed.as_bytes(), server_seed.as_bytes());
        })
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let key = [0x42u8; KEY_MATERIAL_LENGTH];
    let mut encoder = Encoder::new(&key);
    let payload = vec![0u8; MAX_FRAME_PAYLOAD_LENGTH];

    let mut group = c.benchmark_group("frame_encode");
    group.throughput(Throughput::Bytes(MAX_FRAME_PAYLOAD_LENGTH as u64));
    group.bench_function("max_payload", |b| {
        b.iter(|| black_box(encoder.encode(&payload).unwrap()))
    });
    group.finish();
}

fn bench_frame_decode(c: &mut Criterion) {
    let key = [0x42u8; KEY_MATERIAL_LENGTH];
    let payload = vec![0u8; MAX_FRAME_PAYLOAD_LENGTH];

    let mut group = c.benchmark_group("frame_decode");
    group.throughput(Throughput::Bytes(MAX_FRAME_PAYLOAD_LENGTH as u64));
    group.bench_function("max_payload", |b| {
        b.iter_batched(
            || {
                // Fresh codec state per iteration keeps the nonce counters
                // aligned.
                let mut encoder = Encoder::new(&key);
                let frame = encoder.encode(&payload).unwrap();
                (Decoder::new(&key), BytesMut::from(&frame[..]))
            },
            |(mut decoder, mut buffer)| black_box(decoder.decode(&mut buffer).unwrap()),
            criterion::BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_keypair_generation,
    bench_ntor_handshake,
    bench_frame_encode,
    bench_frame_decode,
);
criterion_main!(benches);
