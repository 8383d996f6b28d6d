use criterion::{Criterion, criterion_group, criterion_main};

#[cfg(feature = "redis")]
mod enabled {
    use std::{env, hint::black_box, sync::Arc};

    use criterion::Criterion;

    use bitswarm::{
        BitIndex, BitStore, BitswarmRedisClient, CapacityCap, RateLimitWindows, RateLimiter,
        RedisBitStore, RedisBitStoreOptions, RedisKey, RedisTicketLedger, TotalBits,
    };

    fn redis_url() -> String {
        env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
    }

    pub fn bench_store(c: &mut Criterion) {
        let mut group = c.benchmark_group("redis_toggle");
        group.sample_size(50);

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .build()
            .unwrap();

        let prefix = RedisKey::try_from("bench".to_string()).unwrap();
        let total_bits = TotalBits::default();

        let (store, limiter) = rt.block_on(async {
            let primary = BitswarmRedisClient::open(&redis_url(), 4).await.unwrap();

            let store = RedisBitStore::connect(RedisBitStoreOptions {
                primary: primary.clone(),
                replica: None,
                prefix: Some(prefix.clone()),
                total_bits,
                capacity: CapacityCap::from(total_bits),
                subscription_capacity: 1024,
            })
            .await
            .unwrap();

            let limiter = RateLimiter::new(
                Arc::new(RedisTicketLedger::new(primary, Some(prefix.clone()))),
                RateLimitWindows::default(),
            );

            (store, limiter)
        });

        let index = BitIndex::new(42, total_bits).unwrap();

        // Ensure connection is warm.
        rt.block_on(async {
            store.toggle(index).await.unwrap();
        });

        group.bench_function("toggle/hot_index", |b| {
            b.iter(|| black_box(rt.block_on(store.toggle(black_box(index))).unwrap()));
        });

        group.bench_function("snapshot/1m_bits", |b| {
            b.iter(|| black_box(rt.block_on(store.snapshot()).unwrap()));
        });

        group.bench_function("count", |b| {
            b.iter(|| black_box(rt.block_on(store.count()).unwrap()));
        });

        group.bench_function("is_allowed/hot_key", |b| {
            b.iter(|| black_box(rt.block_on(limiter.is_allowed(black_box("user_1"))).unwrap()));
        });

        group.finish();
    }
}

#[cfg(feature = "redis")]
fn bench_store(c: &mut Criterion) {
    enabled::bench_store(c)
}

#[cfg(not(feature = "redis"))]
fn bench_store(_: &mut Criterion) {}

criterion_group!(benches, bench_store);
criterion_main!(benches);
