// MIT License
//
// Copyright (c) 2019 Gregory Meyer
//
// Permission is hereby granted, free of charge, to any person
// obtaining a copy of this software and associated documentation files
// (the "Software"), to deal in the Software without restriction,
// including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software,
// and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
// BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
// ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use super::*;

use crate::error::InjectError;

use std::{
    any,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Barrier,
    },
    time::Duration,
};

fn collecting_pool(size: usize) -> (Pool, Arc<Mutex<Vec<PoolError>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();

    let pool = Pool::builder()
        .size(size)
        .panic_handler(move |e| sink.lock().push(e))
        .build();

    (pool, errors)
}

#[test]
fn closed_pool_rejects() {
    let pool = Pool::new(2);
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let ran = ran.clone();

        assert_eq!(
            pool.execute(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
            Ok(())
        );
    }

    pool.close();

    assert_eq!(pool.execute(|| ()), Err(PoolError::Closed));
    assert_eq!(pool.cap(), 0);
    assert!(pool.is_closed());
    assert_eq!(ran.load(Ordering::SeqCst), 2);

    // closing twice is harmless
    pool.close();
}

#[test]
fn runs_every_task() {
    const NUM_TASKS: usize = 2048;

    let pool = Pool::new(8);
    let ran = Arc::new(AtomicUsize::new(0));

    for _ in 0..NUM_TASKS {
        let ran = ran.clone();

        pool.execute(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }

    drop(pool);

    assert_eq!(ran.load(Ordering::Relaxed), NUM_TASKS);
}

#[test]
fn concurrency_is_bounded_by_size() {
    const SIZE: usize = 4;
    const NUM_TASKS: usize = 64;

    let pool = Arc::new(Pool::new(SIZE));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();

            thread::spawn(move || {
                for _ in 0..NUM_TASKS / 4 {
                    let running = running.clone();
                    let peak = peak.clone();

                    pool.execute(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
            })
        })
        .collect();

    for submitter in submitters {
        submitter.join().unwrap();
    }

    assert!(pool.cap() <= SIZE);
    pool.close();

    assert!(peak.load(Ordering::SeqCst) <= SIZE);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[test]
fn execute_blocks_while_saturated() {
    let pool = Arc::new(Pool::new(1));
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

    pool.execute(move || {
        let _ = release_rx.recv();
    })
    .unwrap();

    let admitted = Arc::new(AtomicBool::new(false));

    let submitter = {
        let pool = pool.clone();
        let admitted = admitted.clone();

        thread::spawn(move || {
            pool.execute(|| ()).unwrap();
            admitted.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!admitted.load(Ordering::SeqCst));
    assert_eq!(pool.cap(), 1);

    release_tx.send(()).unwrap();
    submitter.join().unwrap();

    assert!(admitted.load(Ordering::SeqCst));
}

#[test]
fn panics_reach_the_handler() {
    let (pool, errors) = collecting_pool(1);
    let ran = Arc::new(AtomicBool::new(false));

    pool.execute(|| panic!("boom")).unwrap();

    {
        let ran = ran.clone();

        pool.execute(move || ran.store(true, Ordering::SeqCst)).unwrap();
    }

    pool.close();

    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(
        *errors.lock(),
        vec![PoolError::Panicked {
            worker: 0,
            message: "boom".to_owned()
        }]
    );
}

#[test]
fn panicking_handler_keeps_worker_alive() {
    let pool = Pool::builder()
        .size(1)
        .panic_handler(|_| panic!("handler"))
        .build();
    let ran = Arc::new(AtomicBool::new(false));

    pool.execute(|| panic!("task")).unwrap();

    {
        let ran = ran.clone();

        pool.execute(move || ran.store(true, Ordering::SeqCst)).unwrap();
    }

    pool.close();

    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn pre_init_spawns_target() {
    let pool = Pool::with_max(3, 5);
    assert_eq!(pool.cap(), 0);

    pool.pre_init().unwrap();
    assert_eq!(pool.cap(), 3);
    assert_eq!(pool.target(), 3);
    assert_eq!(pool.max_size(), 5);

    pool.close();
    assert_eq!(pool.pre_init(), Err(PoolError::Closed));
}

#[test]
fn adjust_size_clamps_to_max() {
    let pool = Pool::with_max(1, 4);

    pool.adjust_size(10).unwrap();
    assert_eq!(pool.target(), 4);
    assert_eq!(pool.cap(), 4);

    pool.adjust_size(2).unwrap();
    assert_eq!(pool.target(), 2);
    assert_eq!(pool.cap(), 2);
}

#[test]
fn shrinking_waits_for_busy_workers() {
    let pool = Pool::new(2);
    let finished = Arc::new(AtomicBool::new(false));
    let started = Arc::new(Barrier::new(2));

    {
        let finished = finished.clone();
        let started = started.clone();

        pool.execute(move || {
            started.wait();
            thread::sleep(Duration::from_millis(100));
            finished.store(true, Ordering::SeqCst);
        })
        .unwrap();
    }

    started.wait();
    pool.adjust_size(0).unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(pool.cap(), 0);
}

#[test]
fn pause_and_resume() {
    let pool = Arc::new(Pool::with_max(2, 4));
    pool.pre_init().unwrap();

    pool.pause().unwrap();
    assert_eq!(pool.target(), 0);
    assert_eq!(pool.cap(), 0);

    let ran = Arc::new(AtomicBool::new(false));

    let submitter = {
        let pool = pool.clone();
        let ran = ran.clone();

        thread::spawn(move || {
            pool.execute(move || ran.store(true, Ordering::SeqCst)).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst));

    pool.resume(None).unwrap();
    assert_eq!(pool.target(), 4);

    submitter.join().unwrap();
    pool.close();

    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn close_wakes_blocked_submitters() {
    let pool = Arc::new(Pool::new(1));
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

    pool.execute(move || {
        let _ = release_rx.recv();
    })
    .unwrap();

    let submitter = {
        let pool = pool.clone();

        thread::spawn(move || pool.execute(|| ()))
    };

    thread::sleep(Duration::from_millis(50));

    let closer = {
        let pool = pool.clone();

        thread::spawn(move || pool.close())
    };

    assert_eq!(submitter.join().unwrap(), Err(PoolError::Closed));

    release_tx.send(()).unwrap();
    closer.join().unwrap();

    assert_eq!(pool.cap(), 0);
}

#[test]
fn workers_are_named() {
    let pool = Pool::builder().size(1).thread_name("indexer").build();
    let (name_tx, name_rx) = crossbeam_channel::bounded(1);

    pool.execute(move || {
        let _ = name_tx.send(thread::current().name().map(str::to_owned));
    })
    .unwrap();

    assert_eq!(name_rx.recv().unwrap().as_deref(), Some("indexer-0"));
}

#[test]
fn injected_tasks() {
    let seen = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(Mutex::new(Vec::<PoolError>::new()));

    let mut injector = Injector::new();
    injector.provide(seen.clone()).provide(40usize);

    let pool = {
        let errors = errors.clone();

        Pool::builder()
            .size(2)
            .injector(injector)
            .panic_handler(move |e| errors.lock().push(e))
            .build()
    };

    pool.execute_injected(|seen: Arc<AtomicUsize>, amount: usize| {
        seen.fetch_add(amount, Ordering::SeqCst);
    })
    .unwrap();

    pool.execute_injected(|seen: Arc<AtomicUsize>| -> Result<(), String> {
        seen.fetch_add(2, Ordering::SeqCst);

        Err("partial".to_owned())
    })
    .unwrap();

    pool.execute_injected(|_: u16| ()).unwrap();

    pool.close();

    assert_eq!(seen.load(Ordering::SeqCst), 42);

    let mut errors = errors.lock().clone();
    errors.sort_by_key(|e| e.to_string());

    assert_eq!(
        errors,
        vec![
            PoolError::Inject(InjectError::Missing(any::type_name::<u16>())),
            PoolError::Task("partial".to_owned()),
        ]
    );
}
