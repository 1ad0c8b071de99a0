//! Performance benchmarks for Fileson
//!
//! Tracks scan time with and without checksum reuse, log replay, and the
//! throughput of the crypto stream and integrity tags.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fileson::crypto::{encrypt_stream, CryptoKey};
use fileson::integrity::IntegrityTag;
use fileson::{Catalog, ChecksumAlgorithm, ScannerBuilder, VersionedLog};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::hint::black_box;
use std::io::{self, Cursor};
use std::time::Duration;
use tempfile::TempDir;

fn populate(file_count: usize) -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    for i in 0..file_count {
        let dir = temp_dir.path().join(format!("dir_{}", i % 10));
        fs::create_dir_all(&dir).unwrap();
        let size = rng.random_range(100..4000);
        let content: Vec<u8> = (0..size).map(|_| rng.random()).collect();
        fs::write(dir.join(format!("file_{}.bin", i)), content).unwrap();
    }
    temp_dir
}

/// Full scan from an empty catalog versus a rescan that reuses every checksum
fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    group.measurement_time(Duration::from_secs(3));
    group.sample_size(20);

    for file_count in [100, 1000] {
        let tree = populate(file_count);
        let scanner = ScannerBuilder::new(tree.path())
            .checksum(Some(ChecksumAlgorithm::Sha1))
            .build()
            .unwrap();

        group.bench_with_input(BenchmarkId::new("fresh", file_count), &file_count, |b, _| {
            b.iter(|| {
                let mut catalog = Catalog::new();
                black_box(scanner.scan(&mut catalog).unwrap());
            });
        });

        let mut warmed = Catalog::new();
        scanner.scan(&mut warmed).unwrap();
        group.bench_with_input(BenchmarkId::new("rescan", file_count), &file_count, |b, _| {
            b.iter(|| {
                let mut catalog = VersionedLog::from_records(warmed.records().iter().cloned());
                black_box(scanner.scan(&mut catalog).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_log_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_replay");

    for records in [1_000u32, 20_000] {
        let mut log: VersionedLog<u32> = VersionedLog::new();
        for i in 0..records {
            log.set(format!("dir_{}/file_{}", i % 50, i % 5000), i).unwrap();
        }
        let bytes = log.to_bytes().unwrap();

        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(records), &bytes, |b, bytes| {
            b.iter(|| {
                let parsed: VersionedLog<u32> =
                    VersionedLog::read_from(Cursor::new(bytes), std::path::Path::new("bench")).unwrap();
                black_box(parsed.len())
            });
        });
    }
    group.finish();
}

fn bench_streams(c: &mut Criterion) {
    let mut group = c.benchmark_group("streams");
    let key = CryptoKey::generate();
    let tagger = IntegrityTag::default();
    let mut rng = StdRng::seed_from_u64(7);
    let data: Vec<u8> = (0..4 * 1024 * 1024).map(|_| rng.random()).collect();
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("encrypt", |b| {
        b.iter(|| encrypt_stream(Cursor::new(&data), &mut io::sink(), &key, None).unwrap());
    });
    group.bench_function("etag", |b| {
        b.iter(|| tagger.compute(Cursor::new(&data)).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_scan, bench_log_replay, bench_streams);
criterion_main!(benches);
