use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use packet_relay::core::codec::{Frame, FrameCodec};
use packet_relay::core::packet::{ChunkPos, LevelChunk, Packet, Text};
use packet_relay::core::pool::PacketPool;
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || Frame::new(0x3a, vec![0u8; size]),
                |frame| {
                    let mut buf = BytesMut::with_capacity(size + 8);
                    FrameCodec::new().encode(frame, &mut buf).unwrap();
                    buf
                },
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("decode_{size}b"), |b| {
            let mut wire = BytesMut::new();
            FrameCodec::new()
                .encode(Frame::new(0x3a, vec![0u8; size]), &mut wire)
                .unwrap();
            b.iter_batched(
                || wire.clone(),
                |mut buf| FrameCodec::new().decode(&mut buf).unwrap().unwrap(),
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_packet_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_pool");
    let pool = PacketPool::standard();

    let text = Packet::Text(Text {
        message: "hello from the relay".into(),
        ..Default::default()
    });
    let chunk = Packet::LevelChunk(LevelChunk {
        position: ChunkPos { x: 12, z: -40 },
        sub_chunk_count: 8,
        cache_enabled: true,
        blob_hashes: (0..9).collect(),
        raw_payload: vec![7u8; 2048],
        ..Default::default()
    });

    for (name, packet) in [("text", text), ("level_chunk", chunk)] {
        let frame = pool.encode(&packet).unwrap();
        group.bench_function(format!("encode_{name}"), |b| {
            b.iter(|| pool.encode(&packet).unwrap())
        });
        group.bench_function(format!("decode_{name}"), |b| {
            b.iter(|| pool.decode(&frame).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_frame_codec, bench_packet_pool);
criterion_main!(benches);
