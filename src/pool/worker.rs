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

use super::Shared;

use crate::error::PoolError;

use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use tracing::trace;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// The pool's handle to one worker thread.
///
/// Exactly one handle exists per worker. While the worker is idle the handle
/// sits in the pool's ready queue; while it is busy the handle travels with
/// the job so the worker can put itself back. Dropping the handle of an idle
/// worker disconnects its mailbox, which is how a worker is told to stop.
pub(crate) struct Worker {
    id: usize,
    mailbox: Sender<Job>,
}

struct Job {
    task: Task,
    worker: Worker,
}

impl Worker {
    pub(crate) fn spawn(id: usize, name: String, shared: Arc<Shared>) -> io::Result<(Worker, JoinHandle<()>)> {
        let (mailbox, jobs) = crossbeam_channel::bounded(1);

        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run(id, jobs, shared))?;

        trace!(worker = id, "spawned worker");

        Ok((Worker { id, mailbox }, thread))
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Hands `task` to this worker, giving it back if the worker thread is
    /// gone.
    pub(crate) fn assign(self, task: Task) -> Result<(), Task> {
        let mailbox = self.mailbox.clone();

        mailbox
            .send(Job { task, worker: self })
            .map_err(|e| e.into_inner().task)
    }
}

fn run(id: usize, jobs: Receiver<Job>, shared: Arc<Shared>) {
    while let Ok(Job { task, worker }) = jobs.recv() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            shared.report(PoolError::Panicked {
                worker: id,
                message: panic_message(payload.as_ref()),
            });
        }

        shared.park(worker);
    }

    trace!(worker = id, "worker stopped");
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}
