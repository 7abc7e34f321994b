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

use super::node::Node;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use rand::Rng;

/// How [`Balancer::run`] picks among the available nodes.
///
/// [`Balancer::run`]: struct.Balancer.html#method.run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Probability proportional to weight.
    #[default]
    Random,
    /// Cycles through the available nodes in registration order.
    RoundRobin,
    /// Lowest `inflight * 100 / weight`, earliest registered on ties.
    LeastConn,
}

impl Strategy {
    /// Returns the index of the chosen node. `nodes` must not be empty.
    pub(crate) fn select<T>(self, nodes: &[Arc<Node<T>>], cursor: &AtomicUsize) -> usize {
        match self {
            Strategy::Random => weighted_random(nodes, &mut rand::thread_rng()),
            Strategy::RoundRobin => cursor.fetch_add(1, Ordering::Relaxed) % nodes.len(),
            Strategy::LeastConn => least_conn(nodes),
        }
    }
}

fn weighted_random<T, R: Rng + ?Sized>(nodes: &[Arc<Node<T>>], rng: &mut R) -> usize {
    let total: u64 = nodes.iter().map(|n| u64::from(n.weight())).sum();
    let mut pick = rng.gen_range(0..total);

    for (i, node) in nodes.iter().enumerate() {
        let weight = u64::from(node.weight());

        if pick < weight {
            return i;
        }

        pick -= weight;
    }

    nodes.len() - 1
}

fn least_conn<T>(nodes: &[Arc<Node<T>>]) -> usize {
    nodes
        .iter()
        .enumerate()
        .min_by_key(|(_, node)| node.score())
        .map_or(0, |(i, _)| i)
}
