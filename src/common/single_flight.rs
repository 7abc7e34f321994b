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

//! Deduplication of concurrent calls sharing a key.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use parking_lot::{Condvar, Mutex};

/// Coalesces concurrent calls with the same key: the first caller runs the
/// closure and everyone who arrives while it is running waits for it to
/// finish.
///
/// Results are not broadcast. Waiters are expected to re-read whatever
/// shared state the leader wrote.
pub(crate) struct Group<K> {
    calls: Mutex<HashMap<K, Arc<Call>>>,
}

pub(crate) enum Flight<R> {
    /// This caller ran the closure.
    Led(R),
    /// Another caller ran the closure while this one waited.
    Followed,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Finished,
    Panicked,
}

struct Call {
    state: Mutex<State>,
    done: Condvar,
}

impl<K: Hash + Eq + Clone> Group<K> {
    pub(crate) fn new() -> Self {
        Group {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` unless a call for `key` is already in flight, in which case
    /// blocks until that call completes.
    ///
    /// # Panics
    ///
    /// If the leading call panics, the panic propagates to the leader and
    /// every waiter panics as well.
    pub(crate) fn run<R, F: FnOnce() -> R>(&self, key: K, f: F) -> Flight<R> {
        let call = {
            let mut calls = self.calls.lock();

            if let Some(call) = calls.get(&key) {
                let call = call.clone();
                drop(calls);

                call.wait();

                return Flight::Followed;
            }

            let call = Arc::new(Call {
                state: Mutex::new(State::Running),
                done: Condvar::new(),
            });
            calls.insert(key.clone(), call.clone());

            call
        };

        let mut completion = Completion {
            group: self,
            key: Some(key),
            call,
            state: State::Panicked,
        };

        let result = f();
        completion.state = State::Finished;

        Flight::Led(result)
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Call {
    fn wait(&self) {
        let mut state = self.state.lock();

        while *state == State::Running {
            self.done.wait(&mut state);
        }

        if *state == State::Panicked {
            panic!("single-flight computation panicked");
        }
    }
}

// Finishes a call on scope exit, including when the closure unwinds.
struct Completion<'a, K: Hash + Eq + Clone> {
    group: &'a Group<K>,
    key: Option<K>,
    call: Arc<Call>,
    state: State,
}

impl<K: Hash + Eq + Clone> Drop for Completion<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.group.calls.lock().remove(&key);
        }

        *self.call.state.lock() = self.state;
        self.call.done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
        time::Duration,
    };

    #[test]
    fn concurrent_callers_share_one_run() {
        const NUM_THREADS: usize = 16;

        let group = Arc::new(Group::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(NUM_THREADS));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let group = group.clone();
                let runs = runs.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();

                    group.run(7u64, || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                    })
                })
            })
            .collect();

        let led = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|f| matches!(f, Flight::Led(())))
            .count();

        assert_eq!(led, runs.load(Ordering::SeqCst));
        assert!(led >= 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[test]
    fn distinct_keys_do_not_wait() {
        let group = Group::new();

        assert!(matches!(group.run(1u64, || 1), Flight::Led(1)));
        assert!(matches!(group.run(2u64, || 2), Flight::Led(2)));
        assert_eq!(group.in_flight(), 0);
    }

    #[test]
    fn leader_panic_is_cleaned_up() {
        let group = Group::new();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            group.run(3u64, || -> u32 { panic!("boom") });
        }));

        assert!(result.is_err());
        assert_eq!(group.in_flight(), 0);
        assert!(matches!(group.run(3u64, || 4), Flight::Led(4)));
    }
}
