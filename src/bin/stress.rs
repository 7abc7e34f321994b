use strand::{Balancer, HashMap, NodeOptions, Pool, RunError, Strategy};

use std::{
    env,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_SECS: u64 = 5;
const SHARDS: [&str; 3] = ["shard-a", "shard-b", "shard-c"];

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(name, value = %raw, "ignoring unparseable setting");

            default
        }),
        Err(_) => default,
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let secs = env_or("STRAND_STRESS_SECS", DEFAULT_SECS);
    let num_threads = env_or(
        "STRAND_STRESS_THREADS",
        thread::available_parallelism().map_or(4, |n| n.get()),
    )
    .max(1);

    info!(secs, threads = num_threads, "starting stress run");

    let map = Arc::new(HashMap::new());
    let keep_running = Arc::new(AtomicBool::new(true));

    let threads: Vec<_> = (0..num_threads)
        .map(|i| {
            let map = map.clone();
            let keep_running = keep_running.clone();

            thread::spawn(move || {
                let mut ops = 0usize;

                while keep_running.load(Ordering::Relaxed) {
                    let key = (ops * num_threads + i) % 4096;

                    map.insert(key, ops);
                    map.get(&key);

                    if ops % 3 == 0 {
                        map.remove(&key);
                    }

                    ops += 1;
                }

                ops
            })
        })
        .collect();

    let pool = Pool::with_max(num_threads, num_threads * 2);
    let balancer = Arc::new(Balancer::new());

    for shard in SHARDS {
        if let Err(e) = balancer.add(shard, AtomicUsize::new(0), NodeOptions::default().max_conns(num_threads)) {
            error!(error = %e, "cannot register shard");

            return;
        }
    }

    let submitted = Arc::new(AtomicUsize::new(0));
    let submitter = {
        let keep_running = keep_running.clone();
        let submitted = submitted.clone();
        let map = map.clone();

        thread::spawn(move || {
            let mut n = 0usize;

            while keep_running.load(Ordering::Relaxed) {
                let balancer = balancer.clone();
                let map = map.clone();

                let result = pool.execute(move || {
                    let outcome: Result<(), RunError<()>> = balancer.run(Strategy::LeastConn, |served| {
                        served.fetch_add(1, Ordering::Relaxed);
                        map.get_or_compute(n % 1024, || Some(n));

                        (true, Ok(()))
                    });

                    if let Err(e) = outcome {
                        warn!(error = ?e, "balanced call failed");
                    }
                });

                if let Err(e) = result {
                    error!(error = %e, "cannot submit task");

                    break;
                }

                submitted.fetch_add(1, Ordering::Relaxed);

                if n % 10_000 == 0 {
                    // alternate between the base size and the ceiling
                    let target = if (n / 10_000) % 2 == 0 { pool.max_size() } else { num_threads };

                    if let Err(e) = pool.adjust_size(target) {
                        error!(error = %e, "cannot resize pool");
                    }
                }

                n += 1;
            }

            pool.close();

            for shard in SHARDS {
                if let Ok(node) = balancer.get(shard) {
                    info!(shard, served = node.value().load(Ordering::Relaxed), "shard load");
                }
            }
        })
    };

    thread::sleep(Duration::from_secs(secs));
    keep_running.store(false, Ordering::Relaxed);

    let mut total_ops = 0;

    for thread in threads {
        match thread.join() {
            Ok(ops) => total_ops += ops,
            Err(_) => error!("map thread panicked"),
        }
    }

    if submitter.join().is_err() {
        error!("submitter thread panicked");
    }

    info!(
        map_ops = total_ops,
        tasks = submitted.load(Ordering::Relaxed),
        len = map.len(),
        capacity = map.capacity(),
        "stress run finished"
    );
}
