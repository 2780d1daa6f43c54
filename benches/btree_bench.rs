use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;
use std::sync::Arc;

use kestreldb::common::types::Rid;
use kestreldb::index::btree::BTreeIndex;
use kestreldb::storage::buffer::BufferPoolManager;

// Create a buffer pool over a throwaway database file
fn create_test_environment(buffer_pool_size: usize) -> Arc<BufferPoolManager> {
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    let path = temp_file.path().to_str().unwrap().to_string();
    let buffer_pool = Arc::new(BufferPoolManager::new(buffer_pool_size, 2, path).unwrap());

    // Keep the temp file alive for the whole process
    std::mem::forget(temp_file);

    buffer_pool
}

fn btree_benchmark(c: &mut Criterion) {
    let buffer_pool_size = 1000;

    let mut group = c.benchmark_group("BTreeIndex");

    for size in [100, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("insert", size), size, |b, &size| {
            let buffer_pool = create_test_environment(buffer_pool_size);
            let btree = BTreeIndex::<i32>::new("bench_insert", buffer_pool, 64, 64).unwrap();

            let mut rng = rand::thread_rng();
            let keys: Vec<i32> = (0..size).map(|_| rng.gen::<i32>()).collect();
            let mut idx = 0;

            b.iter(|| {
                if idx >= keys.len() {
                    idx = 0;
                }
                let key = keys[idx];
                let _ = btree.insert(key, Rid::new(0, 1000)).unwrap();
                idx += 1;
            });
        });

        group.bench_with_input(BenchmarkId::new("lookup", size), size, |b, &size| {
            let buffer_pool = create_test_environment(buffer_pool_size);
            let btree = BTreeIndex::<i32>::new("bench_lookup", buffer_pool, 64, 64).unwrap();

            let mut keys = Vec::with_capacity(size as usize);
            for i in 0..size {
                let key = i as i32;
                btree.insert(key, Rid::new(0, (key as u32) + 1000)).unwrap();
                keys.push(key);
            }

            let mut rng = rand::thread_rng();
            keys.shuffle(&mut rng);
            let mut idx = 0;

            b.iter(|| {
                if idx >= keys.len() {
                    idx = 0;
                }
                let key = keys[idx];
                let _ = btree.get_value(&key).unwrap();
                idx += 1;
            });
        });

        group.bench_with_input(BenchmarkId::new("range_scan", size), size, |b, &size| {
            let buffer_pool = create_test_environment(buffer_pool_size);
            let btree = BTreeIndex::<i32>::new("bench_scan", buffer_pool, 64, 64).unwrap();

            for i in 0..size {
                let key = i as i32;
                btree.insert(key, Rid::new(0, (key as u32) + 1000)).unwrap();
            }

            // Scan windows covering 10% of the data each
            let range_size = (size as i32) / 10;
            let ranges: Vec<(i32, i32)> = (0..9)
                .map(|i| (i * range_size, (i + 1) * range_size - 1))
                .collect();
            let mut idx = 0;

            b.iter(|| {
                if idx >= ranges.len() {
                    idx = 0;
                }
                let (start, end) = ranges[idx];
                let _ = btree.range_scan(&start, &end).unwrap();
                idx += 1;
            });
        });
    }

    group.finish();
}

criterion_group!(benches, btree_benchmark);
criterion_main!(benches);
