//! Benchmarks for sutura operations.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

use sutura::{
    accept_all, bsdiff, compute_signature, ApplyBuilder, ArchivePool, BsdiffPolicy, Container,
    DiffBuilder, MemoryArchive, NoProgress, NullWritablePool, PatchReader, RollingChecksum,
    Signature, StrongHash, BLOCK_SIZE,
};

fn data(len: usize, seed: u32) -> Vec<u8> {
    (0..len as u32)
        .map(|i| (i.wrapping_mul(2_654_435_761).wrapping_add(seed) >> 11) as u8)
        .collect()
}

/// A single-file tree held in memory.
fn tree(contents: Vec<u8>) -> (Container, ArchivePool) {
    let archive = MemoryArchive::new().with_file("payload.bin", 0o644, contents);
    let container = Container::walk_archive(&archive, &accept_all).unwrap();
    let pool = ArchivePool::new(&container, Arc::new(archive)).unwrap();
    (container, pool)
}

fn sign(contents: Vec<u8>) -> (Signature, ArchivePool) {
    let (container, mut pool) = tree(contents);
    let signature = compute_signature(&container, &mut pool, &NoProgress).unwrap();
    (signature, pool)
}

fn patch_between(old: &[u8], new: &[u8], policy: BsdiffPolicy) -> Vec<u8> {
    let (signature, mut old_pool) = sign(old.to_vec());
    let (container, mut new_pool) = tree(new.to_vec());
    let mut patch = Vec::new();
    DiffBuilder::new()
        .bsdiff(policy)
        .build()
        .unwrap()
        .write_patch(
            &signature,
            &container,
            &mut new_pool,
            Some(&mut old_pool),
            &mut patch,
            &NoProgress,
        )
        .unwrap();
    patch
}

/// `old` with a short run overwritten every 256 KiB.
fn edited(old: &[u8]) -> Vec<u8> {
    let mut new = old.to_vec();
    for start in (1000..new.len()).step_by(256 * 1024) {
        let end = (start + 100).min(new.len());
        new[start..end].fill(0xa5);
    }
    new
}

fn bench_rolling_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("rolling_checksum");

    for size in [512, 8192, BLOCK_SIZE].iter() {
        let block = data(*size, 1);

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("new", size), &block, |b, block| {
            b.iter(|| RollingChecksum::new(black_box(block)));
        });
    }

    let block = data(BLOCK_SIZE, 2);
    let mut checksum = RollingChecksum::new(&block);
    group.bench_function("roll", |b| {
        b.iter(|| checksum.roll(black_box(0x42), black_box(0x69)));
    });

    group.finish();
}

fn bench_strong_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("strong_hash");

    for size in [4096, BLOCK_SIZE, 4 * 1024 * 1024].iter() {
        let block = data(*size, 3);

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("blake3", size), &block, |b, block| {
            b.iter(|| StrongHash::compute(black_box(block)));
        });
    }

    group.finish();
}

fn bench_signature(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature");
    group.sample_size(20);

    for size in [1024 * 1024, 16 * 1024 * 1024].iter() {
        let (container, mut pool) = tree(data(*size, 4));

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_function(BenchmarkId::new("compute", size), |b| {
            b.iter(|| compute_signature(&container, &mut pool, &NoProgress).unwrap());
        });
    }

    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");
    group.sample_size(10);

    for size in [1024 * 1024, 8 * 1024 * 1024].iter() {
        let old = data(*size, 5);
        let new = edited(&old);

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("rsync", size), &new, |b, new| {
            b.iter(|| patch_between(&old, black_box(new), BsdiffPolicy::disabled()));
        });
        group.bench_with_input(BenchmarkId::new("bsdiff", size), &new, |b, new| {
            b.iter(|| patch_between(&old, black_box(new), BsdiffPolicy::default()));
        });
    }

    group.finish();
}

fn bench_bsdiff(c: &mut Criterion) {
    let mut group = c.benchmark_group("bsdiff");
    group.sample_size(10);

    for size in [256 * 1024, 2 * 1024 * 1024].iter() {
        let old = data(*size, 6);
        let new = edited(&old);

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("controls", size), &new, |b, new| {
            b.iter(|| {
                let mut controls = 0usize;
                bsdiff(&old, black_box(new), &mut |_| {
                    controls += 1;
                    Ok(())
                })
                .unwrap();
                controls
            });
        });
    }

    group.finish();
}

fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply");
    group.sample_size(20);

    for size in [1024 * 1024, 8 * 1024 * 1024].iter() {
        let old = data(*size, 7);
        let new = edited(&old);
        let patch = patch_between(&old, &new, BsdiffPolicy::disabled());
        let (_, mut old_pool) = tree(old);

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("dry_run", size), &patch, |b, patch| {
            b.iter(|| {
                let mut reader = PatchReader::open(patch.as_slice()).unwrap();
                ApplyBuilder::new()
                    .dry_run()
                    .build()
                    .unwrap()
                    .apply_with_pools(&mut reader, &mut old_pool, &mut NullWritablePool, &NoProgress)
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_rolling_checksum,
    bench_strong_hash,
    bench_signature,
    bench_diff,
    bench_bsdiff,
    bench_apply,
);

criterion_main!(benches);
