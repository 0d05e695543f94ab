use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use flightcache_core::{
    Args, CacheEngine, CacheKey, CacheOptions, CacheStore, KeyCodec, LocalFlights, LocalStore,
    NeverDieScheduler, SingleFlight,
};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(serde::Serialize)]
struct Query {
    user: u64,
    tags: Vec<&'static str>,
    limit: Option<u32>,
}

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_derivation");

    group.bench_function("positional", |b| {
        b.iter(|| {
            let args = Args::from_value(&(black_box(42u64), "name", 3.5f64)).unwrap();
            KeyCodec::derive("bench::positional", &args).unwrap()
        });
    });

    group.bench_function("struct", |b| {
        let query = Query {
            user: 7,
            tags: vec!["a", "b", "c"],
            limit: Some(10),
        };
        b.iter(|| {
            let args = Args::from_value(black_box(&query)).unwrap();
            KeyCodec::derive("bench::struct", &args).unwrap()
        });
    });

    group.finish();
}

fn bench_local_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_store");

    for size in [10, 100, 1000].iter() {
        let store = LocalStore::new();
        let keys: Vec<CacheKey> = (0..*size)
            .map(|i| CacheKey::from_raw(format!("bench::get:{}", i)))
            .collect();
        for (i, key) in keys.iter().enumerate() {
            CacheStore::set(&store, key, &(i as i32), Some(Duration::from_secs(60))).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("get", size), &keys, |b, keys| {
            b.iter(|| {
                for key in keys {
                    black_box(CacheStore::get(&store, key).unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_cached_hit(c: &mut Criterion) {
    let engine = CacheEngine::local().with_scheduler(Arc::new(NeverDieScheduler::new()));
    let square = engine
        .wrap(
            "bench::square",
            CacheOptions::new(Duration::from_secs(60)),
            |(x,): &(u64,)| Ok::<_, std::io::Error>(x * x),
        )
        .unwrap();
    square.call(&(12,)).unwrap();

    c.bench_function("cached_hit", |b| {
        b.iter(|| square.call(black_box(&(12,))).unwrap());
    });
}

fn bench_concurrent_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_hits");

    for threads in [2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            threads,
            |b, &threads| {
                let engine =
                    CacheEngine::local().with_scheduler(Arc::new(NeverDieScheduler::new()));
                let double = engine
                    .wrap(
                        "bench::double",
                        CacheOptions::new(Duration::from_secs(60)),
                        |(x,): &(u64,)| Ok::<_, std::io::Error>(x * 2),
                    )
                    .unwrap();

                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|t| {
                            let double = double.clone();
                            thread::spawn(move || {
                                for i in 0..100u64 {
                                    black_box(double.call(&(i % 10 + t as u64,)).unwrap());
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_single_flight(c: &mut Criterion) {
    let flights = LocalFlights::new();
    let key = CacheKey::from_raw("bench::lock:0");

    c.bench_function("single_flight_acquire", |b| {
        b.iter(|| {
            let guard = SingleFlight::acquire(&flights, black_box(&key)).unwrap();
            drop(guard);
        });
    });
}

criterion_group!(
    benches,
    bench_key_derivation,
    bench_local_store,
    bench_cached_hit,
    bench_concurrent_hits,
    bench_single_flight
);
criterion_main!(benches);
