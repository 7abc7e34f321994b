use strand::HashMap;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const SIZES: [usize; 5] = [8, 64, 512, 4096, 32768];

fn bench_single_thread_insertion(c: &mut Criterion) {
    let mut group = c.benchmark_group("strand: single threaded insertion");

    for numel in SIZES {
        group.bench_with_input(BenchmarkId::from_parameter(numel), &numel, |b, &numel| {
            let map = HashMap::new();

            for i in 0..numel {
                map.insert(i, i);
            }

            b.iter(|| map.insert(black_box(numel + 1), numel + 1))
        });
    }

    group.finish();
}

fn bench_single_thread_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("strand: single threaded lookup");

    for numel in SIZES {
        group.bench_with_input(BenchmarkId::from_parameter(numel), &numel, |b, &numel| {
            let map = HashMap::new();

            for i in 0..numel {
                map.insert(i, i);
            }

            b.iter(|| map.get(&black_box(numel / 2)))
        });
    }

    group.finish();
}

fn bench_insert_and_remove(c: &mut Criterion) {
    let map = HashMap::new();

    for i in 0..4096usize {
        map.insert(i, i);
    }

    c.bench_function("strand: insert then remove", move |b| {
        b.iter(|| {
            map.insert(black_box(8192), 8192);
            map.remove(&black_box(8192))
        })
    });
}

fn bench_get_or_compute(c: &mut Criterion) {
    let map = HashMap::new();

    c.bench_function("strand: get_or_compute hit", move |b| {
        b.iter(|| map.get_or_compute(black_box(7usize), || Some(7usize)))
    });
}

fn bench_multi_thread_insertion(c: &mut Criterion) {
    let num_threads = num_cpus::get();

    let map = Arc::new(HashMap::new());
    let keep_going = Arc::new(AtomicBool::new(true));

    let threads: Vec<_> = (0..num_threads - 1)
        .map(|i| {
            let map = map.clone();
            let keep_going = keep_going.clone();

            thread::spawn(move || {
                while keep_going.load(Ordering::SeqCst) {
                    map.insert(black_box(i), i);
                }
            })
        })
        .collect();

    c.bench_function("strand: multithreaded insertion", move |b| {
        b.iter(|| map.insert(black_box(num_threads + 1), num_threads + 1))
    });

    keep_going.store(false, Ordering::SeqCst);

    let _: Vec<_> = threads.into_iter().map(|t| t.join()).collect();
}

fn bench_multi_thread_contended_insertion(c: &mut Criterion) {
    let num_threads = num_cpus::get();

    let map = Arc::new(HashMap::new());
    let keep_going = Arc::new(AtomicBool::new(true));

    let threads: Vec<_> = (0..num_threads - 1)
        .map(|_| {
            let map = map.clone();
            let keep_going = keep_going.clone();

            thread::spawn(move || {
                while keep_going.load(Ordering::SeqCst) {
                    map.insert(black_box(0), 0);
                }
            })
        })
        .collect();

    c.bench_function("strand: contended multithreaded insertion", move |b| {
        b.iter(|| map.insert(black_box(0), 0))
    });

    keep_going.store(false, Ordering::SeqCst);

    let _: Vec<_> = threads.into_iter().map(|t| t.join()).collect();
}

criterion_group!(
    benches,
    bench_single_thread_insertion,
    bench_single_thread_lookup,
    bench_insert_and_remove,
    bench_get_or_compute,
    bench_multi_thread_insertion,
    bench_multi_thread_contended_insertion,
);
criterion_main!(benches);
