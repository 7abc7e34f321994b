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

//! A resizable pool of worker threads.

mod inject;
mod worker;

#[cfg(test)]
mod tests;

pub use inject::{Inject, Injector, TaskOutput};

use worker::{Task, Worker};

use crate::error::PoolError;

use std::{
    collections::HashMap,
    mem,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{error, trace};

type PanicHandler = Arc<dyn Fn(PoolError) + Send + Sync>;

/// A pool of worker threads that run submitted tasks.
///
/// Idle workers wait in a FIFO ready queue. [`execute`] hands a task to the
/// first ready worker, spawns a new worker if fewer than the target number
/// are alive, and otherwise blocks until a worker becomes ready. The target
/// can be changed at any time between zero and the maximum size given at
/// construction; workers above the target are stopped as soon as they are
/// idle.
///
/// A task that panics does not take its worker down. The panic is caught
/// and reported to the pool's panic handler as [`PoolError::Panicked`]; the
/// default handler logs it with `tracing`.
///
/// Dropping the pool closes it.
///
/// [`execute`]: #method.execute
/// [`PoolError::Panicked`]: ../error/enum.PoolError.html#variant.Panicked
pub struct Pool {
    shared: Arc<Shared>,
}

/// Configuration for a [`Pool`].
///
/// [`Pool`]: struct.Pool.html
pub struct PoolBuilder {
    size: usize,
    max_size: Option<usize>,
    panic_handler: Option<PanicHandler>,
    injector: Injector,
    thread_name: String,
}

struct Shared {
    state: Mutex<State>,
    resized: Condvar,
    ready_tx: Sender<Worker>,
    ready_rx: Receiver<Worker>,
    closed_rx: Receiver<()>,
    panic_handler: PanicHandler,
    injector: Arc<Injector>,
    thread_name: String,
    max_size: usize,
}

struct State {
    target: usize,
    alive: usize,
    next_id: usize,
    closed_tx: Option<Sender<()>>,
    threads: HashMap<usize, JoinHandle<()>>,
    exited: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Creates a pool that keeps up to `size` workers.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        Pool::builder().size(size).build()
    }

    /// Creates a pool that keeps up to `size` workers and can later be
    /// resized up to `max_size`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or `max_size` is less than `size`.
    pub fn with_max(size: usize, max_size: usize) -> Self {
        Pool::builder().size(size).max_size(max_size).build()
    }

    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Runs `task` on a worker.
    ///
    /// Returns once a worker has accepted the task, not once the task has
    /// run. Blocks while every live worker is busy and the pool is at its
    /// target size.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool is closed before the task
    /// is handed to a worker, in which case the task is dropped without
    /// running.
    ///
    /// [`PoolError::Closed`]: ../error/enum.PoolError.html#variant.Closed
    pub fn execute<F: FnOnce() + Send + 'static>(&self, task: F) -> Result<(), PoolError> {
        self.shared.dispatch(Box::new(task))
    }

    /// Runs `task` on a worker after resolving its arguments from the pool's
    /// [`Injector`].
    ///
    /// Missing arguments and errors returned by `task` are delivered to the
    /// panic handler once the task runs.
    ///
    /// [`Injector`]: struct.Injector.html
    pub fn execute_injected<Args, F: Inject<Args>>(&self, task: F) -> Result<(), PoolError> {
        let injector = self.shared.injector.clone();
        let panic_handler = self.shared.panic_handler.clone();

        self.execute(move || {
            if let Err(e) = task.invoke(&injector) {
                panic_handler(e);
            }
        })
    }

    /// Spawns workers until the target size is alive, leaving them ready.
    pub fn pre_init(&self) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();

        if state.is_closed() {
            return Err(PoolError::Closed);
        }

        self.shared.grow(&mut state)
    }

    /// Stops dispatching. Running tasks finish, then their workers stop.
    pub fn pause(&self) -> Result<(), PoolError> {
        self.adjust_size(0)
    }

    /// Restores the target size to `size`, or to the maximum size if `None`.
    pub fn resume(&self, size: Option<usize>) -> Result<(), PoolError> {
        self.adjust_size(size.unwrap_or(self.shared.max_size))
    }

    /// Sets the target size, clamped to the maximum size.
    ///
    /// Growing spawns the missing workers straight away. Shrinking waits for
    /// surplus workers to finish their current task and stops them.
    ///
    /// Must not be called from inside a task that runs on this pool.
    pub fn adjust_size(&self, size: usize) -> Result<(), PoolError> {
        let exited = {
            let mut state = self.shared.state.lock();

            if state.is_closed() {
                return Err(PoolError::Closed);
            }

            state.target = size.min(self.shared.max_size);
            trace!(size = state.target, alive = state.alive, "resizing pool");

            self.shared.grow(&mut state)?;
            self.shared.shrink(&mut state);

            mem::take(&mut state.exited)
        };

        join_all(exited);

        Ok(())
    }

    /// Closes the pool: rejects further tasks, waits for running tasks and
    /// joins every worker.
    ///
    /// Tasks blocked in [`execute`] are rejected with
    /// [`PoolError::Closed`]. Closing an already closed pool does nothing.
    ///
    /// Must not be called from inside a task that runs on this pool.
    ///
    /// [`execute`]: #method.execute
    /// [`PoolError::Closed`]: ../error/enum.PoolError.html#variant.Closed
    pub fn close(&self) {
        let threads = {
            let mut state = self.shared.state.lock();

            if let Some(closed_tx) = state.closed_tx.take() {
                drop(closed_tx);
                state.target = 0;

                trace!(alive = state.alive, "closing pool");
            }

            self.shared.shrink(&mut state);

            let mut threads = mem::take(&mut state.exited);
            threads.extend(state.threads.drain().map(|(_, thread)| thread));

            threads
        };

        join_all(threads);
    }

    /// Returns the number of live workers.
    pub fn cap(&self) -> usize {
        self.shared.state.lock().alive
    }

    /// Returns the target number of workers.
    pub fn target(&self) -> usize {
        self.shared.state.lock().target
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().is_closed()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.close();
    }
}

impl PoolBuilder {
    fn new() -> Self {
        PoolBuilder {
            size: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            max_size: None,
            panic_handler: None,
            injector: Injector::new(),
            thread_name: "strand-worker".to_owned(),
        }
    }

    /// Target number of workers. Defaults to the available parallelism.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;

        self
    }

    /// Upper bound for later resizing. Defaults to the target size.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);

        self
    }

    /// Called with every panic caught on a worker and every error from an
    /// injected task.
    pub fn panic_handler<F: Fn(PoolError) + Send + Sync + 'static>(mut self, handler: F) -> Self {
        self.panic_handler = Some(Arc::new(handler));

        self
    }

    pub fn injector(mut self, injector: Injector) -> Self {
        self.injector = injector;

        self
    }

    /// Prefix for worker thread names; workers are named `<prefix>-<id>`.
    pub fn thread_name<S: Into<String>>(mut self, prefix: S) -> Self {
        self.thread_name = prefix.into();

        self
    }

    /// # Panics
    ///
    /// Panics if the size is zero or the maximum size is less than the size.
    pub fn build(self) -> Pool {
        let max_size = self.max_size.unwrap_or(self.size);

        assert!(self.size >= 1, "pool size must be at least 1");
        assert!(
            max_size >= self.size,
            "pool max size {} is less than its size {}",
            max_size,
            self.size
        );

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(max_size);
        let (closed_tx, closed_rx) = crossbeam_channel::bounded(0);

        let panic_handler: PanicHandler = match self.panic_handler {
            Some(handler) => handler,
            None => Arc::new(|e: PoolError| error!(error = %e, "worker pool task failed")),
        };

        Pool {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    target: self.size,
                    alive: 0,
                    next_id: 0,
                    closed_tx: Some(closed_tx),
                    threads: HashMap::new(),
                    exited: Vec::new(),
                }),
                resized: Condvar::new(),
                ready_tx,
                ready_rx,
                closed_rx,
                panic_handler,
                injector: Arc::new(self.injector),
                thread_name: self.thread_name,
                max_size,
            }),
        }
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        PoolBuilder::new()
    }
}

impl Shared {
    fn dispatch(self: &Arc<Self>, mut task: Task) -> Result<(), PoolError> {
        loop {
            let worker = match self.ready_rx.try_recv() {
                Ok(worker) => worker,
                Err(_) => {
                    {
                        let mut state = self.state.lock();

                        if state.is_closed() {
                            return Err(PoolError::Closed);
                        }

                        if state.alive < state.target {
                            let worker = self.spawn(&mut state)?;
                            drop(state);

                            match worker.assign(task) {
                                Ok(()) => return Ok(()),
                                Err(rejected) => {
                                    task = rejected;

                                    continue;
                                }
                            }
                        }
                    }

                    crossbeam_channel::select! {
                        recv(self.ready_rx) -> worker => match worker {
                            Ok(worker) => worker,
                            Err(_) => return Err(PoolError::Closed),
                        },
                        recv(self.closed_rx) -> _ => return Err(PoolError::Closed),
                    }
                }
            };

            {
                let mut state = self.state.lock();

                if state.is_closed() {
                    self.retire(&mut state, worker);

                    return Err(PoolError::Closed);
                }

                if state.alive > state.target {
                    self.retire(&mut state, worker);

                    continue;
                }
            }

            match worker.assign(task) {
                Ok(()) => return Ok(()),
                Err(rejected) => task = rejected,
            }
        }
    }

    fn spawn(self: &Arc<Self>, state: &mut State) -> Result<Worker, PoolError> {
        let id = state.next_id;
        let name = format!("{}-{}", self.thread_name, id);

        let (worker, thread) = Worker::spawn(id, name, self.clone())
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        state.next_id += 1;
        state.alive += 1;
        state.threads.insert(id, thread);

        Ok(worker)
    }

    // Spawns ready workers up to the target.
    fn grow(self: &Arc<Self>, state: &mut State) -> Result<(), PoolError> {
        while state.alive < state.target {
            let worker = self.spawn(state)?;
            self.enqueue(worker);
        }

        Ok(())
    }

    // Stops idle surplus workers, then waits for busy ones to retire
    // themselves.
    fn shrink(&self, state: &mut MutexGuard<'_, State>) {
        while state.alive > state.target {
            match self.ready_rx.try_recv() {
                Ok(worker) => self.retire(state, worker),
                Err(_) => break,
            }
        }

        while state.alive > state.target {
            self.resized.wait(state);
        }
    }

    fn retire(&self, state: &mut State, worker: Worker) {
        state.alive -= 1;

        if let Some(thread) = state.threads.remove(&worker.id()) {
            state.exited.push(thread);
        }

        trace!(worker = worker.id(), alive = state.alive, "retiring worker");

        // dropping the last handle disconnects the worker's mailbox
        drop(worker);
        self.resized.notify_all();
    }

    fn enqueue(&self, worker: Worker) {
        // the queue has room for every worker the pool can have
        let _ = self.ready_tx.send(worker);
    }

    /// Called by a worker that finished a task.
    fn park(&self, worker: Worker) {
        let mut state = self.state.lock();

        if state.alive > state.target {
            self.retire(&mut state, worker);
        } else {
            self.enqueue(worker);
        }
    }

    fn report(&self, error: PoolError) {
        let handler = &self.panic_handler;

        // a panicking handler must not kill the worker
        if panic::catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
            error!("worker pool panic handler panicked");
        }
    }
}

impl State {
    fn is_closed(&self) -> bool {
        self.closed_tx.is_none()
    }
}

fn join_all(threads: Vec<JoinHandle<()>>) {
    for thread in threads {
        // workers catch task panics, so a failed join has nothing to report
        let _ = thread.join();
    }
}
