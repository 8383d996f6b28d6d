use std::{
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use hdrhistogram::Histogram;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use bitswarm::{
    AbuseGuardOptions, BackendOptions, Bitswarm, BitswarmOptions, Broadcast, CapacityCap,
    ClientKey, RateLimitWindows, ToggleDecision, TotalBits,
};

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Backend {
    Local,
    Redis,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OriginDist {
    Hot,
    Uniform,
    Skewed,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum IndexDist {
    Hot,
    Uniform,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Mode {
    Max,
    TargetQps,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bitswarm-stress",
    about = "Load test / benchmark harness for bitswarm toggles"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = Backend::Local)]
    backend: Backend,

    #[arg(long, value_enum, default_value_t = OriginDist::Uniform)]
    origin_dist: OriginDist,

    #[arg(long, value_enum, default_value_t = IndexDist::Uniform)]
    index_dist: IndexDist,

    #[arg(long, value_enum, default_value_t = Mode::Max)]
    mode: Mode,

    #[arg(long, default_value_t = 8)]
    tasks: usize,

    #[arg(long, default_value_t = 30)]
    duration_s: u64,

    #[arg(long, default_value_t = 1_000_000)]
    total_bits: u64,

    /// Defaults to `--total-bits`.
    #[arg(long)]
    capacity: Option<u64>,

    #[arg(long, default_value = "7/1,80/15,240/60")]
    windows: String,

    #[arg(long, default_value_t = 10_000)]
    origin_space: u32,

    #[arg(long, default_value_t = 0.8)]
    hot_fraction: f64,

    #[arg(long, default_value_t = 100)]
    sample_every: u64,

    /// Keep the abuse guard active; off by default so the limiter sees the full load.
    #[arg(long, default_value_t = false)]
    abuse_guard: bool,

    #[arg(long)]
    target_qps: Option<u64>,

    #[arg(long)]
    burst_qps: Option<u64>,

    #[arg(long, default_value_t = 30_000)]
    burst_period_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    burst_duration_ms: u64,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:16379/")]
    redis_url: String,

    #[arg(long, default_value = "stress")]
    redis_prefix: String,

    #[arg(long, default_value_t = 4)]
    redis_pool_size: usize,
}

#[derive(Default)]
struct Counts {
    applied: AtomicU64,
    capacity_reached: AtomicU64,
    rate_limited: AtomicU64,
    suppressed: AtomicU64,
    errors: AtomicU64,
    batches: AtomicU64,
    batched_events: AtomicU64,
    snapshots: AtomicU64,
}

fn should_sample(iter: u64, sample_every: u64) -> bool {
    if sample_every <= 1 {
        return true;
    }

    iter.is_multiple_of(sample_every)
}

fn qps_for_now(args: &Args, started: Instant) -> Option<u64> {
    if args.mode == Mode::Max {
        return None;
    }

    let base = args.target_qps?;

    if let Some(burst_qps) = args.burst_qps {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let in_period = elapsed_ms % args.burst_period_ms.max(1);
        if in_period < args.burst_duration_ms {
            return Some(burst_qps);
        }
    }

    Some(base)
}

fn build_origins(args: &Args) -> Vec<ClientKey> {
    let n = match args.origin_dist {
        OriginDist::Hot => 1,
        _ => args.origin_space.max(1),
    };

    // 198.18.0.0/15 is reserved for benchmarking
    (0..n)
        .map(|i| {
            let ip = Ipv4Addr::from(0xC612_0000u32.wrapping_add(i));
            ClientKey::from_ip(IpAddr::V4(ip))
        })
        .collect()
}

fn pick_origin<'a>(
    args: &Args,
    origins: &'a [ClientKey],
    rng: &mut impl FnMut() -> u64,
) -> &'a ClientKey {
    match args.origin_dist {
        OriginDist::Hot => &origins[0],
        OriginDist::Uniform => &origins[(rng() as usize) % origins.len()],
        OriginDist::Skewed => {
            let r = (rng() % 10_000) as f64 / 10_000.0;
            if r < args.hot_fraction {
                &origins[0]
            } else {
                let tail = origins.len().saturating_sub(1).max(1);
                &origins[(1 + (rng() as usize) % tail) % origins.len()]
            }
        }
    }
}

fn pick_index(args: &Args, rng: &mut impl FnMut() -> u64) -> i64 {
    match args.index_dist {
        IndexDist::Hot => 0,
        IndexDist::Uniform => (rng() % args.total_bits.max(1)) as i64,
    }
}

fn print_results(
    args: &Args,
    elapsed: Duration,
    ops: u64,
    hist: &Histogram<u64>,
    counts: &Counts,
) {
    let ops_s = ops as f64 / elapsed.as_secs_f64();

    println!(
        "backend={:?} mode={:?} origin_dist={:?} index_dist={:?}",
        args.backend, args.mode, args.origin_dist, args.index_dist
    );
    println!(
        "tasks={} duration_s={} total_bits={} windows={} origin_space={}",
        args.tasks, args.duration_s, args.total_bits, args.windows, args.origin_space
    );
    println!(
        "elapsed_s={:.3} ops={} ops_per_s={:.0}",
        elapsed.as_secs_f64(),
        ops,
        ops_s
    );
    println!(
        "applied={} capacity_reached={} rate_limited={} suppressed={} errors={}",
        counts.applied.load(Ordering::Relaxed),
        counts.capacity_reached.load(Ordering::Relaxed),
        counts.rate_limited.load(Ordering::Relaxed),
        counts.suppressed.load(Ordering::Relaxed),
        counts.errors.load(Ordering::Relaxed)
    );
    println!(
        "fanout batches={} batched_events={} snapshots={}",
        counts.batches.load(Ordering::Relaxed),
        counts.batched_events.load(Ordering::Relaxed),
        counts.snapshots.load(Ordering::Relaxed)
    );
    if !hist.is_empty() {
        println!(
            "lat_us p50={} p95={} p99={} p999={} max={}",
            hist.value_at_quantile(0.50),
            hist.value_at_quantile(0.95),
            hist.value_at_quantile(0.99),
            hist.value_at_quantile(0.999),
            hist.max()
        );
        println!("sample_every={} samples={}", args.sample_every, hist.len());
    } else {
        println!("no latency samples collected");
    }
}

#[cfg(feature = "redis")]
async fn build_backend(args: &Args) -> BackendOptions {
    use bitswarm::{BitswarmRedisClient, RedisKey};

    match args.backend {
        Backend::Local => BackendOptions::Local,
        Backend::Redis => BackendOptions::Redis {
            primary: BitswarmRedisClient::open(&args.redis_url, args.redis_pool_size)
                .await
                .unwrap(),
            replica: None,
            prefix: Some(RedisKey::try_from(args.redis_prefix.clone()).unwrap()),
        },
    }
}

#[cfg(not(feature = "redis"))]
async fn build_backend(args: &Args) -> BackendOptions {
    if args.backend == Backend::Redis {
        eprintln!("redis backend requires: cargo run -p bitswarm-stress --features redis -- ...");
        std::process::exit(2);
    }

    BackendOptions::Local
}

async fn run(args: Args) {
    let total_bits = TotalBits::try_from(args.total_bits).unwrap();
    let abuse = if args.abuse_guard {
        AbuseGuardOptions::default()
    } else {
        AbuseGuardOptions {
            max_requests: u64::MAX,
            ..Default::default()
        }
    };

    let swarm = Arc::new(
        Bitswarm::new(BitswarmOptions {
            backend: build_backend(&args).await,
            total_bits,
            capacity: args.capacity.map(CapacityCap::from),
            rate_limit: RateLimitWindows::from_str(&args.windows).unwrap(),
            abuse,
            ..Default::default()
        })
        .await
        .unwrap(),
    );
    let handle = swarm.start().await.unwrap();

    let origins = Arc::new(build_origins(&args));
    let stop = Arc::new(AtomicBool::new(false));
    let counts = Arc::new(Counts::default());
    let total_ops = Arc::new(AtomicU64::new(0));

    // a single client watching the feed, to measure what fanout delivers
    let mut feed = swarm.connect_client().await.unwrap();
    let watcher = {
        let counts = Arc::clone(&counts);
        tokio::spawn(async move {
            loop {
                let message = match feed.receiver.recv().await {
                    Ok(message) => message,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };

                match message {
                    Broadcast::BatchedBitToggles(batch) => {
                        counts.batches.fetch_add(1, Ordering::Relaxed);
                        counts.batched_events.fetch_add(
                            (batch.true_indices.len() + batch.false_indices.len()) as u64,
                            Ordering::Relaxed,
                        );
                    }
                    Broadcast::FullState(_) => {
                        counts.snapshots.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
    };

    let started = Instant::now();
    let deadline = started + Duration::from_secs(args.duration_s);

    let mut join = Vec::with_capacity(args.tasks);
    for t in 0..args.tasks {
        let swarm = Arc::clone(&swarm);
        let origins = Arc::clone(&origins);
        let stop = Arc::clone(&stop);
        let counts = Arc::clone(&counts);
        let total_ops = Arc::clone(&total_ops);
        let args = args.clone();

        join.push(tokio::spawn(async move {
            let mut hist = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
            let mut i = 0_u64;
            let mut seed = (t as u64 + 1) * 0x9E37_79B9_7F4A_7C15;
            let mut next_deadline = Instant::now();

            let mut rng_u64 = || {
                // xorshift64*
                seed ^= seed >> 12;
                seed ^= seed << 25;
                seed ^= seed >> 27;
                seed = seed.wrapping_mul(0x2545_F491_4F6C_DD1D);
                seed
            };

            while !stop.load(Ordering::Relaxed) {
                if Instant::now() >= deadline {
                    break;
                }

                if let Some(qps) = qps_for_now(&args, started) {
                    let per_op_ns = 1_000_000_000u64 / qps.max(1);
                    let now = Instant::now();
                    if now < next_deadline {
                        tokio::time::sleep(next_deadline - now).await;
                    }
                    next_deadline += Duration::from_nanos(per_op_ns);
                }

                i = i.wrapping_add(1);
                let origin = pick_origin(&args, &origins, &mut rng_u64);
                let index = pick_index(&args, &mut rng_u64);
                let sample = should_sample(i, args.sample_every);
                let t0 = if sample { Some(Instant::now()) } else { None };

                let res = swarm.toggle(origin, index).await;

                if let Some(t0) = t0 {
                    let us = t0.elapsed().as_micros() as u64;
                    let _ = hist.record(us.max(1));
                }

                total_ops.fetch_add(1, Ordering::Relaxed);
                let counter = match res {
                    Ok(ToggleDecision::Applied(_)) => &counts.applied,
                    Ok(ToggleDecision::CapacityReached { .. }) => &counts.capacity_reached,
                    Ok(ToggleDecision::RateLimited { .. }) => &counts.rate_limited,
                    Ok(ToggleDecision::Suppressed) => &counts.suppressed,
                    Err(err) => {
                        tracing::debug!(error = ?err, "Toggle failed");
                        &counts.errors
                    }
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }

            hist
        }));
    }

    tokio::time::sleep(Duration::from_secs(args.duration_s)).await;
    stop.store(true, Ordering::Relaxed);

    let mut merged = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap();
    for j in join {
        let hist = j.await.unwrap();
        merged.add(&hist).unwrap();
    }

    // let the last drain tick reach the watcher
    tokio::time::sleep(Duration::from_millis(250)).await;
    handle.stop();
    watcher.abort();

    let elapsed = started.elapsed();
    let ops = total_ops.load(Ordering::Relaxed);
    print_results(&args, elapsed, ops, &merged, &counts);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.tasks.clamp(2, 16))
        .build()
        .unwrap();

    rt.block_on(run(args));
}
