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

//! A client-side load balancer with health cooldowns and retries.

mod node;
mod strategy;


pub use node::{Node, NodeOptions};
pub use strategy::Strategy;

use node::Lease;

use crate::{
    common::RetryPolicy,
    error::{BalancerError, RunError},
};

use std::{
    sync::{atomic::AtomicUsize, Arc},
    thread,
    time::Instant,
};

use parking_lot::RwLock;
use tracing::{debug, warn};

/// Spreads calls over a set of keyed nodes.
///
/// Each call to [`run`] picks one *available* node: a node that is not
/// cooling down after an unhealthy result and is below its connection cap.
/// If the operation returns an error, it is retried on nodes that have not
/// been tried yet in the same call, with an exponential delay between
/// attempts.
///
/// The registry is guarded by a read-write lock that is only held while
/// taking a snapshot of the nodes, never while an operation runs.
///
/// [`run`]: #method.run
pub struct Balancer<T> {
    nodes: RwLock<Vec<Arc<Node<T>>>>,
    cursor: AtomicUsize,
    epoch: Instant,
    retry: RetryPolicy,
}

impl<T> Balancer<T> {
    pub fn new() -> Self {
        Balancer {
            nodes: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            epoch: Instant::now(),
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the delay schedule used between retries.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;

        self
    }

    /// Registers `value` under `key`.
    ///
    /// # Errors
    ///
    /// Fails if `key` is empty or already registered.
    pub fn add<S: Into<String>>(&self, key: S, value: T, options: NodeOptions) -> Result<(), BalancerError> {
        let key = key.into();

        if key.is_empty() {
            return Err(BalancerError::KeyRequired);
        }

        let mut nodes = self.nodes.write();

        if nodes.iter().any(|n| n.key() == key) {
            return Err(BalancerError::KeyExists(key));
        }

        nodes.push(Arc::new(Node::new(key, value, options)));

        Ok(())
    }

    /// Takes the node out of rotation. Calls already running on it finish
    /// normally.
    pub fn remove(&self, key: &str) -> Result<Arc<Node<T>>, BalancerError> {
        let mut nodes = self.nodes.write();

        match nodes.iter().position(|n| n.key() == key) {
            Some(i) => Ok(nodes.remove(i)),
            None => Err(BalancerError::NotFound(key.to_owned())),
        }
    }

    pub fn get(&self, key: &str) -> Result<Arc<Node<T>>, BalancerError> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.key() == key)
            .cloned()
            .ok_or_else(|| BalancerError::NotFound(key.to_owned()))
    }

    /// Returns true if `key` could be selected right now.
    pub fn is_available(&self, key: &str) -> Result<bool, BalancerError> {
        let node = self.get(key)?;

        Ok(node.is_available(self.now()))
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Registered keys in registration order.
    pub fn keys(&self) -> Vec<String> {
        self.nodes.read().iter().map(|n| n.key().to_owned()).collect()
    }

    /// Runs `op` against a node chosen by `strategy`.
    ///
    /// `op` returns whether the node looked healthy along with the outcome.
    /// An unhealthy node is skipped until its cooldown has passed, whatever
    /// other calls report in the meantime; a healthy result after that
    /// clears the failure. An `Err` outcome is retried on
    /// another available node that has not been tried in this call, up to
    /// one attempt per node that was available when the call started.
    ///
    /// # Errors
    ///
    /// [`RunError::NoNodes`] if nothing is registered,
    /// [`RunError::NoAvailableNodes`] if no node could be selected, and
    /// otherwise [`RunError::Operation`] with the last error `op` returned.
    ///
    /// [`RunError::NoNodes`]: ../error/enum.RunError.html#variant.NoNodes
    /// [`RunError::NoAvailableNodes`]: ../error/enum.RunError.html#variant.NoAvailableNodes
    /// [`RunError::Operation`]: ../error/enum.RunError.html#variant.Operation
    pub fn run<R, E, F>(&self, strategy: Strategy, mut op: F) -> Result<R, RunError<E>>
    where
        F: FnMut(&T) -> (bool, Result<R, E>),
    {
        if self.is_empty() {
            return Err(RunError::NoNodes);
        }

        let attempts = self.available(&[]).len();
        let mut tried: Vec<Arc<Node<T>>> = Vec::with_capacity(attempts);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.retry.delay(attempt as u32 - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying on another node");

                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }

            let lease = match self.acquire(strategy, &tried) {
                Some(lease) => lease,
                None => break,
            };

            let node = lease.node();
            let (healthy, result) = op(node.value());

            if healthy {
                node.mark_healthy(self.now());
            } else {
                node.mark_failed(self.now());
                warn!(node = node.key(), cooldown_ms = node.cooldown().as_millis() as u64, "node entering cooldown");
            }

            tried.push(Arc::clone(node));
            drop(lease);

            match result {
                Ok(value) => return Ok(value),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.map_or(RunError::NoAvailableNodes, RunError::Operation))
    }

    // Milliseconds since creation, offset so that 0 never names a real
    // instant.
    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis())
            .unwrap_or(u64::MAX - 1)
            .saturating_add(1)
    }

    fn available(&self, excluded: &[Arc<Node<T>>]) -> Vec<Arc<Node<T>>> {
        let now = self.now();

        self.nodes
            .read()
            .iter()
            .filter(|n| n.is_available(now) && !excluded.iter().any(|e| Arc::ptr_eq(e, n)))
            .cloned()
            .collect()
    }

    // Selects and leases a node, re-selecting if the chosen one hit its
    // connection cap in the meantime.
    fn acquire(&self, strategy: Strategy, tried: &[Arc<Node<T>>]) -> Option<Lease<T>> {
        let mut candidates = self.available(tried);

        while !candidates.is_empty() {
            let index = strategy.select(&candidates, &self.cursor);

            match candidates[index].try_acquire() {
                Some(lease) => return Some(lease),
                None => {
                    candidates.remove(index);
                }
            }
        }

        None
    }
}

impl<T> Default for Balancer<T> {
    fn default() -> Self {
        Balancer::new()
    }
}
