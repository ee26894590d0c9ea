#![forbid(unsafe_code)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use penumbra::cache::{Interest, InterestHandleFlavor, ObjectCache, SimpleFlavor};
use penumbra::{Blob, ObjectId};

const ENTRIES: usize = 4096;

fn object_id(index: usize) -> ObjectId {
    let mut raw = [0u8; 20];
    raw[..8].copy_from_slice(&(index as u64).to_be_bytes());
    ObjectId::from_bytes(raw.to_vec())
}

fn blob(index: usize) -> Arc<Blob> {
    Arc::new(Blob::new(object_id(index), vec![0u8; 256]))
}

fn micro_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/object_cache");

    for shards in [1usize, 16] {
        let cache: ObjectCache<Blob, SimpleFlavor> =
            ObjectCache::new(ENTRIES * 512, ENTRIES, shards);
        for index in 0..ENTRIES {
            cache.insert(object_id(index), blob(index));
        }

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("hit", shards), &shards, |b, _| {
            let mut index = 0usize;
            b.iter(|| {
                index = (index + 1) % ENTRIES;
                cache.get(&object_id(index))
            });
        });
    }

    let cache: ObjectCache<Blob, InterestHandleFlavor> =
        ObjectCache::new(ENTRIES * 512, ENTRIES, 16);
    group.throughput(Throughput::Elements(1));
    group.bench_function("insert_with_handle", |b| {
        let mut index = 0usize;
        b.iter(|| {
            index += 1;
            cache.insert_with_interest(object_id(index % ENTRIES), blob(index % ENTRIES), Interest::WantHandle)
        });
    });

    group.finish();
}

criterion_group!(benches, micro_cache);
criterion_main!(benches);
