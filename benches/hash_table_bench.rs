use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use pool_hashmap::HashTable;
use std::thread;
use std::time::Duration;

fn lcg(mut s: u64) -> impl Iterator<Item = u32> {
    std::iter::from_fn(move || {
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
        Some((s >> 32) as u32)
    })
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("hash_table_insert_10k", |b| {
        b.iter_batched(
            HashTable::<u64>::new,
            |t| {
                for (i, k) in lcg(1).take(10_000).enumerate() {
                    t.insert(k, i as u64).unwrap();
                }
                black_box(t)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_find_hit(c: &mut Criterion) {
    c.bench_function("hash_table_find_hit", |b| {
        let t = HashTable::new();
        let keys: Vec<u32> = lcg(7).take(2_000).collect();
        for (i, &k) in keys.iter().enumerate() {
            t.insert(k, i as u64).unwrap();
        }
        let mut it = keys.iter().cycle();
        b.iter(|| {
            let k = *it.next().unwrap();
            black_box(t.get(k));
        })
    });
}

fn bench_find_miss(c: &mut Criterion) {
    c.bench_function("hash_table_find_miss", |b| {
        let t = HashTable::new();
        for (i, k) in lcg(11).take(2_000).enumerate() {
            t.insert(k, i as u64).unwrap();
        }
        let mut miss = lcg(0xdead_beef);
        b.iter(|| {
            black_box(t.contains_key(miss.next().unwrap()));
        })
    });
}

fn bench_insert_remove(c: &mut Criterion) {
    c.bench_function("hash_table_insert_remove", |b| {
        let t = HashTable::new();
        for k in 0..4_096u32 {
            t.insert(k, k).unwrap();
        }
        let mut keys = lcg(3);
        b.iter(|| {
            let k = keys.next().unwrap();
            t.insert(k, k).unwrap();
            black_box(t.remove(k));
        })
    });
}

fn bench_concurrent_insert(c: &mut Criterion) {
    c.bench_function("hash_table_concurrent_insert_4x5k", |b| {
        b.iter_batched(
            HashTable::<u32>::new,
            |t| {
                thread::scope(|s| {
                    for tid in 0..4u32 {
                        let t = &t;
                        s.spawn(move || {
                            for i in 0..5_000u32 {
                                let k = i * 4 + tid;
                                t.insert(k, k).unwrap();
                            }
                        });
                    }
                });
                black_box(t)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_config() -> Criterion {
    Criterion::default()
        .sample_size(50)
        .measurement_time(Duration::from_secs(8))
        .warm_up_time(Duration::from_secs(2))
}

criterion_group! {
    name = benches;
    config = bench_config();
    targets = bench_insert, bench_find_hit, bench_find_miss, bench_insert_remove, bench_concurrent_insert
}
criterion_main!(benches);
