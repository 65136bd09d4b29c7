#![allow(clippy::unwrap_used)]

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use packet_relay::utils::compression::{compress, decompress, zstd_reader, zstd_writer};
use std::io::{Read, Write};

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression");
    let sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &sizes {
        // Chunk payloads are mostly repetitive with some noise
        let data: Vec<u8> = (0..size).map(|i| ((i / 7) % 13) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("lz4_compress_{size}b"), |b| {
            b.iter_batched(|| data.clone(), |d| compress(&d), BatchSize::SmallInput)
        });
        group.bench_function(format!("lz4_decompress_{size}b"), |b| {
            let compressed = compress(&data);
            b.iter(|| {
                let out = decompress(&compressed).unwrap();
                assert_eq!(out.len(), data.len());
            })
        });

        // Version 4 captures run the whole record stream through zstd
        group.bench_function(format!("zstd_stream_compress_{size}b"), |b| {
            b.iter(|| {
                let mut enc = zstd_writer(Vec::new()).unwrap();
                enc.write_all(&data).unwrap();
                enc.finish().unwrap()
            })
        });
        group.bench_function(format!("zstd_stream_decompress_{size}b"), |b| {
            let mut enc = zstd_writer(Vec::new()).unwrap();
            enc.write_all(&data).unwrap();
            let compressed = enc.finish().unwrap();
            b.iter(|| {
                let mut out = Vec::with_capacity(data.len());
                zstd_reader(compressed.as_slice())
                    .unwrap()
                    .read_to_end(&mut out)
                    .unwrap();
                assert_eq!(out.len(), data.len());
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compression);
criterion_main!(benches);
