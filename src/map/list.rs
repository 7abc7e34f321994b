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

//! A lockfree singly-linked list kept sorted by key hash.
//!
//! Deletion takes three steps. A node is logically deleted by swinging its
//! value cell to null, which every value write has to race with a CAS, so
//! exactly one of a removal and a concurrent update wins. The remover (or any
//! thread that finds the empty cell) then splices a tombstone in as the
//! node's successor, and any traversal that later walks past it physically
//! unlinks both the node and its tombstone with a single CAS on the
//! predecessor's `next` pointer. Because a buried node's `next` never changes
//! again, a CAS that expects a live successor on it always fails, which keeps
//! inserts and unlinks from resurrecting it.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{self, Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;

/// Hash carried by the list head and by tombstones. Real keys never hash to
/// this value.
pub(crate) const MARK: u64 = u64::MAX;

// bits of `Node::refs`
const UNLINKED: usize = 1;
const RETIRED: usize = 1 << 1;
const INDEX_REF: usize = 1 << 2;

pub(crate) struct Node<K, V> {
    pub(crate) hash: u64,
    key: Option<K>,
    value: Atomic<V>,
    next: Atomic<Node<K, V>>,
    // Index buckets hold counted references to nodes. A node may only be
    // reclaimed once it is unlinked from the list *and* no bucket refers to
    // it, otherwise a reader starting from a stale bucket could walk into
    // freed memory.
    refs: AtomicUsize,
}

/// Where a key sits in the list: `current` is the node holding the key (or
/// null), `left` the live node before that position and `right` the node
/// after it.
pub(crate) struct Position<'g, K, V> {
    pub(crate) left: Shared<'g, Node<K, V>>,
    pub(crate) current: Shared<'g, Node<K, V>>,
    pub(crate) right: Shared<'g, Node<K, V>>,
}

pub(crate) enum Injected<'g, K, V> {
    Inserted(Shared<'g, Node<K, V>>),
    Updated(Shared<'g, V>),
}

impl<K, V> Node<K, V> {
    pub(crate) fn head() -> Owned<Self> {
        Owned::new(Node {
            hash: MARK,
            key: None,
            value: Atomic::null(),
            next: Atomic::null(),
            refs: AtomicUsize::new(0),
        })
    }

    pub(crate) fn new(hash: u64, key: K, value: V) -> Owned<Self> {
        debug_assert_ne!(hash, MARK);

        Owned::new(Node {
            hash,
            key: Some(key),
            value: Atomic::new(value),
            next: Atomic::null(),
            refs: AtomicUsize::new(0),
        })
    }

    fn tombstone() -> Owned<Self> {
        Owned::new(Node {
            hash: MARK,
            key: None,
            value: Atomic::null(),
            next: Atomic::null(),
            refs: AtomicUsize::new(0),
        })
    }

    pub(crate) fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    pub(crate) fn is_tombstone(&self) -> bool {
        self.hash == MARK
    }

    /// A node is deleted iff its successor is a tombstone.
    pub(crate) fn is_deleted(&self, guard: &Guard) -> bool {
        let next = self.next.load(Ordering::Acquire, guard);

        unsafe { next.as_ref() }.map_or(false, Node::is_tombstone)
    }

    pub(crate) fn is_unlinked(&self) -> bool {
        self.refs.load(Ordering::Acquire) & UNLINKED != 0
    }

    pub(crate) fn value<'g>(&self, guard: &'g Guard) -> Option<&'g V> {
        unsafe { self.value.load(Ordering::Acquire, guard).as_ref() }
    }

    pub(crate) fn value_ptr<'g>(&self, guard: &'g Guard) -> Shared<'g, V> {
        self.value.load(Ordering::Acquire, guard)
    }

    /// Replaces the value, returning the previous value cell. The caller is
    /// responsible for retiring it.
    ///
    /// Returns `None` and drops `value` if the node has been removed.
    pub(crate) fn swap_value<'g>(&self, mut value: Owned<V>, guard: &'g Guard) -> Option<Shared<'g, V>> {
        let backoff = Backoff::new();
        let mut current = self.value.load(Ordering::Acquire, guard);

        loop {
            if current.is_null() {
                self.bury(guard);

                return None;
            }

            match self.value.compare_exchange(current, value, Ordering::AcqRel, Ordering::Acquire, guard) {
                Ok(_) => return Some(current),
                Err(e) => {
                    current = e.current;
                    value = e.new;
                    backoff.spin();
                }
            }
        }
    }

    /// Replaces `current` with `value`. Fails if the value changed or the node
    /// was removed in the meantime.
    pub(crate) fn compare_and_swap_value<'g>(
        &self,
        current: Shared<'g, V>,
        value: Owned<V>,
        guard: &'g Guard,
    ) -> bool {
        debug_assert!(!current.is_null());

        self.value
            .compare_exchange(current, value, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
    }

    /// Returns the first live node after `self`, skipping over deleted nodes
    /// without unlinking them.
    pub(crate) fn next_live<'g>(&self, guard: &'g Guard) -> Shared<'g, Self> {
        let mut current = self.next.load(Ordering::Acquire, guard);

        loop {
            let current_ref = match unsafe { current.as_ref() } {
                Some(c) => c,
                None => return current,
            };

            let next = current_ref.next.load(Ordering::Acquire, guard);

            // self was deleted underneath us; its tombstone leads on
            if current_ref.is_tombstone() {
                current = next;

                continue;
            }

            match unsafe { next.as_ref() } {
                Some(next_ref) if next_ref.is_tombstone() => {
                    current = next_ref.next.load(Ordering::Acquire, guard);
                }
                _ => return current,
            }
        }
    }

    /// Walks from `start` looking for the node whose hash is `hash` and
    /// whose key satisfies `matches`.
    ///
    /// `start` must be `head` or a node with a hash strictly less than
    /// `hash`. Deleted nodes met along the way are unlinked and handed to
    /// `on_unlink`, which owns their reclamation from then on. If the walk
    /// finds that a predecessor was deleted concurrently it restarts from
    /// `head`.
    pub(crate) fn search<'g, M, U>(
        head: Shared<'g, Self>,
        start: Shared<'g, Self>,
        hash: u64,
        matches: M,
        mut on_unlink: U,
        guard: &'g Guard,
    ) -> Position<'g, K, V>
    where
        M: Fn(&K) -> bool,
        U: FnMut(Shared<'g, Self>),
    {
        let backoff = Backoff::new();
        let mut left = start;

        'restart: loop {
            let mut left_ref = unsafe { left.deref() };
            let mut current = left_ref.next.load(Ordering::Acquire, guard);

            if unsafe { current.as_ref() }.map_or(false, Node::is_tombstone) {
                left = head;
                backoff.snooze();

                continue 'restart;
            }

            loop {
                let current_ref = match unsafe { current.as_ref() } {
                    Some(c) => c,
                    None => {
                        return Position {
                            left,
                            current: Shared::null(),
                            right: Shared::null(),
                        }
                    }
                };

                let next = current_ref.next.load(Ordering::Acquire, guard);

                if let Some(next_ref) = unsafe { next.as_ref() } {
                    if next_ref.is_tombstone() {
                        // the tombstone's successor is fixed once spliced in
                        let successor = next_ref.next.load(Ordering::Acquire, guard);

                        match left_ref.next.compare_exchange(
                            current,
                            successor,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        ) {
                            Ok(_) => {
                                on_unlink(current);
                                current = successor;
                            }
                            Err(e) => {
                                if unsafe { e.current.as_ref() }.map_or(false, Node::is_tombstone) {
                                    left = head;
                                    backoff.snooze();

                                    continue 'restart;
                                }

                                current = e.current;
                            }
                        }

                        continue;
                    }
                }

                if current_ref.hash > hash {
                    return Position {
                        left,
                        current: Shared::null(),
                        right: current,
                    };
                }

                if current_ref.hash == hash && current_ref.key.as_ref().map_or(false, &matches) {
                    return Position {
                        left,
                        current,
                        right: next,
                    };
                }

                left = current;
                left_ref = current_ref;
                current = next;
            }
        }
    }

    /// Publishes `node` at `position`, or stores its value into the existing
    /// node if the key is already present.
    ///
    /// Hands the node back if the list changed underneath `position` or the
    /// existing node was removed; the caller should search again and retry.
    pub(crate) fn inject<'g>(
        position: &Position<'g, K, V>,
        node: Owned<Self>,
        guard: &'g Guard,
    ) -> Result<Injected<'g, K, V>, Owned<Self>> {
        if let Some(current) = unsafe { position.current.as_ref() } {
            let backoff = Backoff::new();
            let value = node.value.load(Ordering::Relaxed, guard);
            let mut previous = current.value.load(Ordering::Acquire, guard);

            loop {
                if previous.is_null() {
                    current.bury(guard);

                    return Err(node);
                }

                match current.value.compare_exchange(
                    previous,
                    value,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => {
                        // the cell now belongs to `current`
                        node.value.store(Shared::null(), Ordering::Relaxed);

                        return Ok(Injected::Updated(previous));
                    }
                    Err(e) => {
                        previous = e.current;
                        backoff.spin();
                    }
                }
            }
        }

        node.next.store(position.right, Ordering::Relaxed);
        let left = unsafe { position.left.deref() };

        match left.next.compare_exchange(
            position.right,
            node,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(inserted) => Ok(Injected::Inserted(inserted)),
            Err(e) => Err(e.new),
        }
    }

    /// Logically deletes `self` by taking its value cell, then buries it.
    ///
    /// Returns the value cell to exactly one caller: the one that moved the
    /// node from live to deleted. That caller is responsible for retiring it.
    pub(crate) fn remove<'g>(&self, guard: &'g Guard) -> Option<Shared<'g, V>> {
        let backoff = Backoff::new();
        let mut value = self.value.load(Ordering::Acquire, guard);

        loop {
            if value.is_null() {
                self.bury(guard);

                return None;
            }

            match self.value.compare_exchange(
                value,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => break,
                Err(e) => {
                    value = e.current;
                    backoff.spin();
                }
            }
        }

        self.bury(guard);

        Some(value)
    }

    // Splices a tombstone in after a node whose value cell has been taken.
    // Safe to call any number of times from any thread.
    fn bury(&self, guard: &Guard) {
        let mut next = self.next.load(Ordering::Acquire, guard);

        if unsafe { next.as_ref() }.map_or(false, Node::is_tombstone) {
            return;
        }

        let backoff = Backoff::new();
        let mut tombstone = Node::tombstone();

        loop {
            if unsafe { next.as_ref() }.map_or(false, Node::is_tombstone) {
                return;
            }

            tombstone.next.store(next, Ordering::Relaxed);

            match self.next.compare_exchange(
                next,
                tombstone,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return,
                Err(e) => {
                    next = e.current;
                    tombstone = e.new;
                    backoff.spin();
                }
            }
        }
    }

    /// Takes an index reference on `node`. Fails if the node has already
    /// been unlinked, in which case it must not be published anywhere.
    pub(crate) fn acquire(node: Shared<'_, Self>, guard: &Guard) -> bool {
        let node_ref = unsafe { node.deref() };
        let previous = node_ref.refs.fetch_add(INDEX_REF, Ordering::AcqRel);

        if previous & UNLINKED != 0 {
            Node::release(node, guard);

            false
        } else {
            true
        }
    }

    /// Drops an index reference, retiring the node if it was the last thing
    /// keeping an unlinked node alive.
    pub(crate) fn release(node: Shared<'_, Self>, guard: &Guard) {
        let node_ref = unsafe { node.deref() };
        let previous = node_ref.refs.fetch_sub(INDEX_REF, Ordering::AcqRel);

        if previous == UNLINKED | INDEX_REF {
            Node::try_retire(node, guard);
        }
    }

    /// Records that `node` is no longer reachable from the list.
    pub(crate) fn mark_unlinked(node: Shared<'_, Self>, guard: &Guard) {
        let node_ref = unsafe { node.deref() };
        let previous = node_ref.refs.fetch_or(UNLINKED, Ordering::AcqRel);

        if previous == 0 {
            Node::try_retire(node, guard);
        }
    }

    fn try_retire(node: Shared<'_, Self>, guard: &Guard) {
        let node_ref = unsafe { node.deref() };

        if node_ref
            .refs
            .compare_exchange(
                UNLINKED,
                UNLINKED | RETIRED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            let raw = node.as_raw();

            unsafe {
                guard.defer_unchecked(move || {
                    Node::free(Shared::from(raw));
                });
            }
        }
    }

    /// Frees a node that was unlinked but never retired. Only for use when
    /// the caller has exclusive access to the whole list.
    pub(crate) unsafe fn free_if_orphaned(node: Shared<'_, Self>) {
        let refs = node.deref().refs.load(Ordering::Relaxed);

        if refs & UNLINKED != 0 && refs & RETIRED == 0 {
            Node::free(node);
        }
    }

    /// Frees an unlinked node together with its tombstone.
    unsafe fn free(node: Shared<'_, Self>) {
        let owned = node.into_owned();
        let next = owned
            .next
            .load(Ordering::Relaxed, crossbeam_epoch::unprotected());

        if next.as_ref().map_or(false, Node::is_tombstone) {
            drop(next.into_owned());
        }

        drop(owned);
    }

    pub(crate) fn next_ptr<'g>(&self, guard: &'g Guard) -> Shared<'g, Self> {
        self.next.load(Ordering::Acquire, guard)
    }
}

impl<K, V> Drop for Node<K, V> {
    fn drop(&mut self) {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let value = self.value.swap(Shared::null(), Ordering::Relaxed, guard);

        if !value.is_null() {
            drop(unsafe { value.into_owned() });
        }
    }
}
