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

use super::list::Node;

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{Atomic, Guard, Shared};
use crossbeam_utils::Backoff;

// set on every bucket of a table that has been replaced
const SEALED_TAG: usize = 1;

/// Bucket array over the sorted list, indexed by the top bits of a hash.
///
/// Bucket `b` points at the live node with the smallest hash among those
/// whose hash maps to `b`, or at some node of that bucket if a better one
/// lost a race. Because the index uses the top bits rather than a modulo,
/// buckets stay in hash order and scanning backwards from any bucket always
/// lands on a valid starting point for a list walk.
pub(crate) struct IndexTable<K, V> {
    buckets: Box<[Atomic<Node<K, V>>]>,
    shift: u32,
    count: AtomicUsize,
}

impl<K, V> IndexTable<K, V> {
    pub(crate) fn with_length(length: usize) -> Self {
        assert!(length.is_power_of_two());
        assert!(length >= 2);

        IndexTable {
            buckets: (0..length).map(|_| Atomic::null()).collect(),
            shift: u64::BITS - length.trailing_zeros(),
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Percentage of occupied buckets.
    pub(crate) fn fill_rate(&self) -> usize {
        self.count.load(Ordering::Relaxed) * 100 / self.buckets.len()
    }

    pub(crate) fn index_of(&self, hash: u64) -> usize {
        (hash >> self.shift) as usize
    }
}

impl<'g, K: 'g, V: 'g> IndexTable<K, V> {
    /// Returns a live node whose hash is strictly less than `hash`, suitable
    /// as the starting point of a list walk, or `None` if the walk should
    /// start from the list head.
    ///
    /// Buckets that point at deleted nodes are cleared on the way.
    pub(crate) fn index_element(&self, hash: u64, guard: &'g Guard) -> Option<Shared<'g, Node<K, V>>> {
        for index in (0..=self.index_of(hash)).rev() {
            let node_ptr = self.buckets[index].load(Ordering::Acquire, guard);

            let node = match unsafe { node_ptr.with_tag(0).as_ref() } {
                Some(n) => n,
                None => continue,
            };

            if node.is_deleted(guard) {
                self.scrub(index, node_ptr, guard);

                continue;
            }

            if node.hash < hash {
                return Some(node_ptr.with_tag(0));
            }
        }

        None
    }

    /// Offers `node` to its bucket. Empty buckets take it; occupied buckets
    /// only take it if it has a smaller hash than the current occupant or
    /// the occupant is deleted.
    ///
    /// Returns the new number of occupied buckets if this filled an empty
    /// bucket and 0 otherwise.
    pub(crate) fn add_item_to_index(&self, node: Shared<'g, Node<K, V>>, guard: &'g Guard) -> usize {
        let node_ref = unsafe { node.deref() };
        let index = self.index_of(node_ref.hash);
        let bucket = &self.buckets[index];

        if !Node::acquire(node, guard) {
            return 0;
        }

        let backoff = Backoff::new();
        let mut current = bucket.load(Ordering::Acquire, guard);

        loop {
            if current.tag() == SEALED_TAG || current == node {
                Node::release(node, guard);

                return 0;
            }

            if let Some(current_ref) = unsafe { current.as_ref() } {
                if current_ref.hash <= node_ref.hash && !current_ref.is_deleted(guard) {
                    Node::release(node, guard);

                    return 0;
                }
            }

            match bucket.compare_exchange(current, node, Ordering::AcqRel, Ordering::Acquire, guard) {
                Ok(_) => {
                    let count = if current.is_null() {
                        self.count.fetch_add(1, Ordering::Relaxed) + 1
                    } else {
                        Node::release(current, guard);

                        0
                    };

                    // the node may have been deleted and unlinked while we
                    // were publishing it
                    if node_ref.is_deleted(guard) {
                        self.scrub(index, node, guard);
                    }

                    return count;
                }
                Err(e) => {
                    current = e.current;
                    backoff.snooze();
                }
            }
        }
    }

    /// Clears the bucket for `node` if it still points there.
    pub(crate) fn remove_item_from_index(&self, node: Shared<'g, Node<K, V>>, guard: &'g Guard) {
        let index = self.index_of(unsafe { node.deref() }.hash);

        if self.buckets[index].load(Ordering::Acquire, guard) == node {
            self.scrub(index, node, guard);
        }
    }

    fn scrub(&self, index: usize, expected: Shared<'g, Node<K, V>>, guard: &'g Guard) {
        if expected.tag() == SEALED_TAG {
            return;
        }

        if self.buckets[index]
            .compare_exchange(
                expected,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Relaxed,
                guard,
            )
            .is_ok()
        {
            self.count.fetch_sub(1, Ordering::Relaxed);
            Node::release(expected, guard);
        }
    }

    /// Freezes every bucket and gives up the table's node references.
    ///
    /// Called once the table has been replaced. Readers that loaded the
    /// table earlier may keep using the sealed buckets, but nothing can be
    /// published into them any more.
    pub(crate) fn seal(&self, guard: &'g Guard) {
        for bucket in self.buckets.iter() {
            let mut current = bucket.load(Ordering::Acquire, guard);

            loop {
                if current.tag() == SEALED_TAG {
                    break;
                }

                match bucket.compare_exchange(
                    current,
                    current.with_tag(SEALED_TAG),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => {
                        if !current.is_null() {
                            Node::release(current, guard);
                        }

                        break;
                    }
                    Err(e) => current = e.current,
                }
            }
        }
    }

    /// Frees nodes that only this table still keeps alive. Requires
    /// exclusive access to the map.
    pub(crate) unsafe fn free_orphans(&self, guard: &'g Guard) {
        for bucket in self.buckets.iter() {
            let node = bucket.load(Ordering::Relaxed, guard);

            if node.tag() != SEALED_TAG && !node.is_null() {
                Node::free_if_orphaned(node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_uses_top_bits() {
        let table = IndexTable::<u64, u64>::with_length(8);

        assert_eq!(table.len(), 8);
        assert_eq!(table.index_of(0), 0);
        assert_eq!(table.index_of(u64::MAX - 1), 7);
        assert_eq!(table.index_of(1 << 61), 1);
        assert_eq!(table.index_of((1 << 61) - 1), 0);
    }

    #[test]
    fn best_first_and_backward_scan() {
        let guard = &crossbeam_epoch::pin();
        let table = IndexTable::<u64, u64>::with_length(4);

        let bucket_two_high = (2u64 << 62) + 100;
        let bucket_two_low = (2u64 << 62) + 10;

        let high = Node::new(bucket_two_high, 1, 1).into_shared(guard);
        let low = Node::new(bucket_two_low, 2, 2).into_shared(guard);

        assert_eq!(table.add_item_to_index(high, guard), 1);
        assert_eq!(table.fill_rate(), 25);

        // smaller hash displaces the occupant, larger does not
        assert_eq!(table.add_item_to_index(low, guard), 0);
        assert_eq!(table.add_item_to_index(high, guard), 0);
        assert_eq!(table.buckets[2].load(Ordering::Relaxed, guard), low);

        // a probe into bucket 3 scans back to bucket 2
        let found = table.index_element(3u64 << 62, guard);
        assert_eq!(found, Some(low));

        // a probe equal to the occupant's hash must start before it
        assert_eq!(table.index_element(bucket_two_low, guard), None);

        table.seal(guard);
        assert_eq!(table.add_item_to_index(high, guard), 0);

        unsafe {
            drop(high.into_owned());
            drop(low.into_owned());
        }
    }
}
