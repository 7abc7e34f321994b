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

//! Error types for the worker pool and the load balancer.
//!
//! Map operations cannot fail and have no error type.

use thiserror::Error;

/// Errors returned by [`Pool`] or delivered to its panic handler.
///
/// [`Pool`]: ../pool/struct.Pool.html
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,
    #[error("task panicked on worker {worker}: {message}")]
    Panicked { worker: usize, message: String },
    #[error("task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Inject(#[from] InjectError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Failure to resolve the arguments of an injected task.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InjectError {
    #[error("no value of type `{0}` was provided to the injector")]
    Missing(&'static str),
}

/// Errors from registering or looking up balancer nodes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BalancerError {
    #[error("node key must not be empty")]
    KeyRequired,
    #[error("node `{0}` is already registered")]
    KeyExists(String),
    #[error("node `{0}` is not registered")]
    NotFound(String),
}

/// Outcome of a [`Balancer::run`] that did not succeed.
///
/// [`Balancer::run`]: ../balancer/struct.Balancer.html#method.run
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunError<E> {
    #[error("no nodes are registered")]
    NoNodes,
    #[error("no nodes are available")]
    NoAvailableNodes,
    #[error("operation failed: {0}")]
    Operation(E),
}

impl<E> RunError<E> {
    /// Returns the error produced by the operation, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            RunError::Operation(e) => Some(e),
            _ => None,
        }
    }
}
