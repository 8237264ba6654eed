use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pyramid_export::codec::{get_codec, Compression};
use pyramid_export::downsample::{downsample, DownsamplingMethod};
use pyramid_export::export::ExportJob;
use pyramid_export::plan::LevelPlan;
use pyramid_export::progress::NoProgress;
use pyramid_export::source::InMemoryImage;
use pyramid_export::N5Writer;
use std::sync::Arc;
use zarrs::storage::store::MemoryStore;

fn bench_downsample(c: &mut Criterion) {
    let dims = [64u64, 64, 64];
    let block: Vec<u16> = (0..64 * 64 * 64).map(|i| (i % 4093) as u16).collect();

    c.bench_function("average_64cube_by_2", |b| {
        b.iter(|| downsample(DownsamplingMethod::Average, black_box(&block), &dims, &[2, 2, 2], &[32, 32, 32]).unwrap())
    });
    c.bench_function("nearest_64cube_by_2", |b| {
        b.iter(|| downsample(DownsamplingMethod::Nearest, black_box(&block), &dims, &[2, 2, 2], &[32, 32, 32]).unwrap())
    });
}

fn bench_block_codecs(c: &mut Criterion) {
    let data: Vec<u8> = (0..64 * 64 * 64 * 2).map(|i| ((i / 7) % 251) as u8).collect();

    for compression in [Compression::Gzip { level: 6 }, Compression::Zstd { level: 3 }, Compression::Xz] {
        let codec = get_codec(compression);
        c.bench_function(&format!("{}_compress_512k_block", compression.name()), |b| {
            b.iter(|| codec.compress(black_box(&data)).unwrap())
        });
    }
}

fn bench_export(c: &mut Criterion) {
    let dims = vec![128u64, 128, 64];
    let img = InMemoryImage::from_fn(dims.clone(), |p| (p[0] + 3 * p[1] + 5 * p[2]) as u16).unwrap();
    let plan = LevelPlan::from_arrays(
        &dims,
        &[vec![1, 1, 1], vec![2, 2, 2], vec![4, 4, 4]],
        &vec![vec![64, 64, 32]; 3],
    )
    .unwrap();

    let mut group = c.benchmark_group("export_128x128x64");
    group.sample_size(10);
    for workers in [1, 4] {
        group.bench_function(format!("zstd_{workers}_workers"), |b| {
            b.iter(|| {
                let store = Arc::new(MemoryStore::new());
                ExportJob::new(&img, plan.clone())
                    .unwrap()
                    .with_compression(Compression::Zstd { level: 3 })
                    .with_workers(workers)
                    .run(&mut N5Writer::new(store), &mut NoProgress)
                    .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_downsample, bench_block_codecs, bench_export);
criterion_main!(benches);
