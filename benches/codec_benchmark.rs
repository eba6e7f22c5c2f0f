//! Benchmarks for gcif encoding and decoding across image shapes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};

use gcif::{decode, encode, GcifOptions};

/// Sprite-like corpus: transparent background, a few solid shapes.
fn generate_sprite(size: usize) -> Vec<u8> {
    let mut rgba = vec![0u8; size * size * 4];
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..8 {
        let w = rng.gen_range(4..size / 2);
        let h = rng.gen_range(4..size / 2);
        let x0 = rng.gen_range(0..size - w);
        let y0 = rng.gen_range(0..size - h);
        let color = [rng.gen::<u8>(), rng.gen(), rng.gen(), 255];
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                let idx = (y * size + x) * 4;
                rgba[idx..idx + 4].copy_from_slice(&color);
            }
        }
    }
    rgba
}

fn generate_gradient(size: usize) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(size * size * 4);
    for y in 0..size {
        for x in 0..size {
            rgba.extend_from_slice(&[x as u8, y as u8, (x ^ y) as u8, 255]);
        }
    }
    rgba
}

fn encode_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [64usize, 128, 256].iter() {
        let bytes = (*size as u64) * (*size as u64) * 4;
        group.throughput(Throughput::Bytes(bytes));

        for (name, pixels) in [
            ("sprite", generate_sprite(*size)),
            ("gradient", generate_gradient(*size)),
        ] {
            group.bench_with_input(
                BenchmarkId::new(name, format!("{size}x{size}")),
                &pixels,
                |b, pixels| {
                    b.iter(|| {
                        encode(
                            black_box(pixels),
                            *size as u32,
                            *size as u32,
                            &GcifOptions::fast(),
                        )
                        .unwrap()
                    });
                },
            );
        }
    }

    group.finish();
}

fn decode_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for size in [64usize, 128, 256].iter() {
        let pixels = generate_sprite(*size);
        let encoded = encode(&pixels, *size as u32, *size as u32, &GcifOptions::fast()).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(
            BenchmarkId::new("sprite", format!("{size}x{size}")),
            &encoded,
            |b, encoded| {
                b.iter(|| decode(black_box(encoded)).unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(benches, encode_benchmark, decode_benchmark);
criterion_main!(benches);
