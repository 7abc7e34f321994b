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

use std::{
    fmt::{self, Debug, Formatter},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// Per-node settings for [`Balancer::add`].
///
/// [`Balancer::add`]: struct.Balancer.html#method.add
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeOptions {
    /// Most calls the node may serve at once; 0 means unbounded.
    pub max_conns: usize,
    /// Relative share of weighted random and least-connection selection.
    /// Clamped to at least 1.
    pub weight: u32,
    /// How long the node is skipped after an unhealthy result.
    pub cooldown: Duration,
}

impl NodeOptions {
    pub fn max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns;

        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;

        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;

        self
    }
}

impl Default for NodeOptions {
    fn default() -> Self {
        NodeOptions {
            max_conns: 0,
            weight: 1,
            cooldown: Duration::from_millis(1000),
        }
    }
}

/// A registered backend and its load state.
pub struct Node<T> {
    key: String,
    value: T,
    weight: u32,
    max_conns: usize,
    cooldown_ms: u64,
    inflight: AtomicUsize,
    // milliseconds on the balancer's clock, 0 while healthy
    failed_at: AtomicU64,
}

impl<T> Node<T> {
    pub(crate) fn new(key: String, value: T, options: NodeOptions) -> Self {
        Node {
            key,
            value,
            weight: options.weight.max(1),
            max_conns: options.max_conns,
            cooldown_ms: u64::try_from(options.cooldown.as_millis()).unwrap_or(u64::MAX),
            inflight: AtomicUsize::new(0),
            failed_at: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn max_conns(&self) -> usize {
        self.max_conns
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Number of calls currently running against this node.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// True if a call reported the node unhealthy and no healthy result has
    /// cleared that since the cooldown ran out.
    pub fn is_failed(&self) -> bool {
        self.failed_at.load(Ordering::Acquire) != 0
    }

    pub(crate) fn is_available(&self, now: u64) -> bool {
        self.is_cooled(self.failed_at.load(Ordering::Acquire), now)
            && (self.max_conns == 0 || self.inflight() < self.max_conns)
    }

    fn is_cooled(&self, failed_at: u64, now: u64) -> bool {
        failed_at == 0 || now.saturating_sub(failed_at) > self.cooldown_ms
    }

    /// Load score for least-connection selection.
    pub(crate) fn score(&self) -> usize {
        self.inflight() * 100 / self.weight as usize
    }

    pub(crate) fn mark_failed(&self, now: u64) {
        self.failed_at.store(now, Ordering::Release);
    }

    /// Forgets an earlier failure whose cooldown has run out. A failure
    /// still cooling down is kept, even if a call that started before it
    /// finishes healthy.
    pub(crate) fn mark_healthy(&self, now: u64) {
        let failed_at = self.failed_at.load(Ordering::Acquire);

        if failed_at != 0 && self.is_cooled(failed_at, now) {
            // a newer failure wins
            let _ = self.failed_at.compare_exchange(
                failed_at,
                0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// Takes a connection slot, failing if the node is at its cap.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<Lease<T>> {
        let mut current = self.inflight.load(Ordering::Acquire);

        loop {
            if self.max_conns != 0 && current >= self.max_conns {
                return None;
            }

            match self.inflight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Lease {
                        node: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl<T: Debug> Debug for Node<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("weight", &self.weight)
            .field("max_conns", &self.max_conns)
            .field("inflight", &self.inflight())
            .field("failed", &self.is_failed())
            .finish()
    }
}

/// A connection slot on a node, given back on drop.
pub(crate) struct Lease<T> {
    node: Arc<Node<T>>,
}

impl<T> Lease<T> {
    pub(crate) fn node(&self) -> &Arc<Node<T>> {
        &self.node
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        self.node.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}
