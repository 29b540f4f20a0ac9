use ascii_chat_core::protocol::{Packet, PacketDecoder, PacketKind};
use criterion::{criterion_group, criterion_main, Criterion};

fn bench_wire_codec(c: &mut Criterion) {
    let payload: Vec<u8> = (0..60_000u32).map(|i| (i % 251) as u8).collect();
    let packet = Packet::new(PacketKind::ImageFrame, 1, 0, payload);

    c.bench_function("encode_60k_packet", |b| {
        b.iter(|| packet.encode())
    });

    let bytes = packet.encode();
    c.bench_function("decode_60k_packet", |b| {
        b.iter(|| Packet::decode(&bytes).expect("decode"))
    });

    c.bench_function("stream_decode_60k_packet", |b| {
        b.iter(|| {
            let mut decoder = PacketDecoder::new();
            decoder.extend(&bytes);
            decoder.next_packet().expect("wire").expect("complete")
        })
    });
}

criterion_group!(benches, bench_wire_codec);
criterion_main!(benches);
