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

//! A lockfree concurrent hash map implemented as a hash-ordered linked list
//! with a resizable bucket index.

mod index;
mod list;


use index::IndexTable;
use list::{Injected, Node, Position, MARK};

use crate::common::single_flight::{Flight, Group};

use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash, Hasher},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crossbeam_epoch::{self, Atomic, Guard, Owned, Shared};
use tracing::trace;

/// Default hasher for `HashMap`.
///
/// This is currently [aHash], a hashing algorithm designed around acceleration
/// by the [AES-NI] instruction set on x86 processors. aHash is not
/// cryptographically secure, but is fast and resistant to DoS attacks.
///
/// [aHash]: https://docs.rs/ahash
/// [AES-NI]: https://en.wikipedia.org/wiki/AES_instruction_set
pub type DefaultHashBuilder = ahash::RandomState;

const DEFAULT_LENGTH: usize = 8;
const MAX_LENGTH: usize = 1 << (usize::BITS / 2);
const MAX_FILL_RATE: usize = 50;

/// A lockfree concurrent hash map implemented as a singly-linked list sorted
/// by key hash, accelerated by an array of bucket pointers into that list.
///
/// Lookups, insertions and removals never block one another. Every entry
/// lives in exactly one list node, and nodes are never moved: growing the map
/// only rebuilds the bucket index, so readers that started on the old index
/// finish correctly. Removed nodes and replaced values are reclaimed through
/// [crossbeam-epoch] once no thread can still be reading them.
///
/// The default hashing algorithm is [aHash]. The hashing algorithm to be used
/// can be chosen on a per-`HashMap` basis using the [`with_hasher`] and
/// [`with_capacity_and_hasher`] methods, or replaced later with
/// [`set_hasher`].
///
/// Key types must implement [`Hash`] and [`Eq`]. Any operations that return
/// a value require the value type to implement [`Clone`], as elements may be
/// in use by other threads and as such cannot be moved from.
///
/// [crossbeam-epoch]: https://docs.rs/crossbeam-epoch
/// [aHash]: https://docs.rs/ahash
/// [`with_hasher`]: #method.with_hasher
/// [`with_capacity_and_hasher`]: #method.with_capacity_and_hasher
/// [`set_hasher`]: #method.set_hasher
/// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
/// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
/// [`Clone`]: https://doc.rust-lang.org/std/clone/trait.Clone.html
pub struct HashMap<K, V, S = DefaultHashBuilder> {
    head: Atomic<Node<K, V>>,
    table: Atomic<IndexTable<K, V>>,
    len: AtomicUsize,
    resizing: AtomicBool,
    flights: Group<u64>,
    build_hasher: S,
}

impl<K, V> HashMap<K, V, DefaultHashBuilder> {
    /// Creates an empty `HashMap` with the default number of buckets.
    pub fn new() -> Self {
        HashMap::with_capacity_and_hasher(0, DefaultHashBuilder::default())
    }

    /// Creates an empty `HashMap` whose index has at least `capacity`
    /// buckets.
    pub fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty `HashMap` that will use `build_hasher` to hash keys.
    pub fn with_hasher(build_hasher: S) -> Self {
        HashMap::with_capacity_and_hasher(0, build_hasher)
    }

    /// Creates an empty `HashMap` whose index has at least `capacity` buckets
    /// and that uses `build_hasher` to hash keys.
    ///
    /// The bucket count is always a power of two, never less than 8 and
    /// never more than `2^(usize::BITS / 2)`.
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: S) -> Self {
        let length = index_length(capacity).unwrap_or(MAX_LENGTH).max(DEFAULT_LENGTH);

        HashMap {
            head: Atomic::from(Node::head()),
            table: Atomic::new(IndexTable::with_length(length)),
            len: AtomicUsize::new(0),
            resizing: AtomicBool::new(false),
            flights: Group::new(),
            build_hasher,
        }
    }

    /// Returns the number of live entries.
    ///
    /// The count is maintained alongside concurrent insertions and removals,
    /// so it is only exact once the map is quiescent.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns true if this `HashMap` contains no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of buckets in the current index.
    pub fn capacity(&self) -> usize {
        let guard = &crossbeam_epoch::pin();

        unsafe { self.table.load(Ordering::Acquire, guard).deref() }.len()
    }

    /// Returns the percentage of occupied buckets in the current index.
    ///
    /// The index is grown once this exceeds 50.
    pub fn fill_rate(&self) -> usize {
        let guard = &crossbeam_epoch::pin();

        unsafe { self.table.load(Ordering::Acquire, guard).deref() }.fill_rate()
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> HashMap<K, V, S> {
    /// Returns a copy of the value corresponding to `key`.
    ///
    /// `Q` can be any borrowed form of `K`, but [`Hash`] and [`Eq`] on `Q`
    /// *must* match that of `K`. `V` must implement [`Clone`], as the value
    /// may be concurrently removed at any moment, so the best we can do is
    /// return a copy of it.
    ///
    /// [`Hash`]: https://doc.rust-lang.org/std/hash/trait.Hash.html
    /// [`Eq`]: https://doc.rust-lang.org/std/cmp/trait.Eq.html
    /// [`Clone`]: https://doc.rust-lang.org/std/clone/trait.Clone.html
    pub fn get<Q: ?Sized + Hash + Eq>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
    {
        self.get_and(key, V::clone)
    }

    /// Invokes `with_value` with a reference to the value corresponding to
    /// `key`.
    ///
    /// `with_value` will only be invoked if there is a value associated with
    /// `key` contained within this hash map.
    pub fn get_and<Q: ?Sized + Hash + Eq, F: FnOnce(&V) -> T, T>(
        &self,
        key: &Q,
        with_value: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
    {
        let guard = &crossbeam_epoch::pin();
        let hash = self.hash(key);

        let position = self.find(hash, |k| k.borrow() == key, guard);
        let node = unsafe { position.current.as_ref() }?;

        node.value(guard).map(with_value)
    }

    /// Returns true if there is a value associated with `key`.
    pub fn contains_key<Q: ?Sized + Hash + Eq>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
    {
        self.get_and(key, |_| ()).is_some()
    }

    /// Inserts a key-value pair into the hash map, then returns a copy of the
    /// previous value associated with `key`.
    ///
    /// If the key was not previously present in this hash map, [`None`] is
    /// returned.
    ///
    /// [`None`]: https://doc.rust-lang.org/std/option/enum.Option.html#variant.None
    pub fn insert(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        self.insert_and(key, value, V::clone)
    }

    /// Inserts a key-value pair into the hash map, then invokes
    /// `with_previous` with the previously-associated value.
    ///
    /// If the key was not previously present in this hash map, [`None`] is
    /// returned and `with_previous` is not invoked.
    ///
    /// [`None`]: https://doc.rust-lang.org/std/option/enum.Option.html#variant.None
    pub fn insert_and<F: FnOnce(&V) -> T, T>(
        &self,
        key: K,
        value: V,
        with_previous: F,
    ) -> Option<T> {
        let guard = &crossbeam_epoch::pin();
        let hash = self.hash(&key);
        let mut node = Node::new(hash, key, value);

        loop {
            let position = {
                let key = node.key();

                self.find(hash, |k| Some(k) == key, guard)
            };

            match Node::inject(&position, node, guard) {
                Ok(Injected::Inserted(inserted)) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    self.index(inserted, guard);

                    return None;
                }
                Ok(Injected::Updated(previous)) => {
                    let result = with_previous(unsafe { previous.deref() });
                    unsafe { guard.defer_destroy(previous) };

                    return Some(result);
                }
                Err(rejected) => node = rejected,
            }
        }
    }

    /// Removes the value associated with `key` from the hash map, returning
    /// a copy of that value if there was one contained in this hash map.
    pub fn remove<Q: ?Sized + Hash + Eq>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
    {
        self.remove_and(key, V::clone)
    }

    /// Removes the value associated with `key` from the hash map, then
    /// returns the result of invoking `with_previous` with the
    /// previously-associated value.
    pub fn remove_and<Q: ?Sized + Hash + Eq, F: FnOnce(&V) -> T, T>(
        &self,
        key: &Q,
        with_previous: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
    {
        let guard = &crossbeam_epoch::pin();
        let hash = self.hash(key);

        let position = self.find(hash, |k| k.borrow() == key, guard);
        let previous = unsafe { position.current.as_ref() }?.remove(guard)?;

        self.len.fetch_sub(1, Ordering::Relaxed);
        let result = with_previous(unsafe { previous.deref() });
        unsafe { guard.defer_destroy(previous) };

        // walk past the node once more to unlink it
        self.find_from(position.left, hash, |k| k.borrow() == key, guard);

        Some(result)
    }

    /// Removes every key in `keys` that is present, returning how many
    /// entries were removed.
    ///
    /// The keys are sorted by hash first, so the whole batch is served by a
    /// single forward walk of the list wherever the list allows it.
    pub fn remove_many<'a, Q, I>(&self, keys: I) -> usize
    where
        Q: 'a + ?Sized + Hash + Eq,
        K: Borrow<Q>,
        I: IntoIterator<Item = &'a Q>,
    {
        let mut batch: Vec<_> = keys.into_iter().map(|key| (self.hash(key), key)).collect();
        batch.sort_unstable_by_key(|&(hash, _)| hash);

        let guard = &crossbeam_epoch::pin();
        let mut cursor: Option<Shared<'_, Node<K, V>>> = None;
        let mut removed = 0;

        for (hash, key) in batch {
            let start = match cursor {
                Some(node)
                    if unsafe { node.deref() }.hash < hash
                        && !unsafe { node.deref() }.is_deleted(guard) =>
                {
                    node
                }
                _ => self.start(hash, guard),
            };

            let position = self.find_from(start, hash, |k| k.borrow() == key, guard);

            if let Some(node) = unsafe { position.current.as_ref() } {
                if let Some(previous) = node.remove(guard) {
                    unsafe { guard.defer_destroy(previous) };
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    removed += 1;

                    self.find_from(position.left, hash, |k| k.borrow() == key, guard);
                }
            }

            cursor = Some(position.left);
        }

        removed
    }

    /// Replaces the value associated with `key`, returning a copy of the
    /// previous value.
    ///
    /// Nothing is inserted if `key` is not present, including when a
    /// concurrent removal wins the race for the entry.
    pub fn swap<Q: ?Sized + Hash + Eq>(&self, key: &Q, value: V) -> Option<V>
    where
        K: Borrow<Q>,
        V: Clone,
    {
        self.swap_and(key, value, V::clone)
    }

    /// Replaces the value associated with `key`, then returns the result of
    /// invoking `with_previous` with the previous value.
    ///
    /// Nothing is inserted and `with_previous` is not invoked if `key` is not
    /// present.
    pub fn swap_and<Q: ?Sized + Hash + Eq, F: FnOnce(&V) -> T, T>(
        &self,
        key: &Q,
        value: V,
        with_previous: F,
    ) -> Option<T>
    where
        K: Borrow<Q>,
    {
        let guard = &crossbeam_epoch::pin();
        let hash = self.hash(key);

        let position = self.find(hash, |k| k.borrow() == key, guard);
        let node = unsafe { position.current.as_ref() }?;

        let previous = node.swap_value(Owned::new(value), guard)?;
        let result = with_previous(unsafe { previous.deref() });
        unsafe { guard.defer_destroy(previous) };

        Some(result)
    }

    /// Replaces the value associated with `key` with `new` if it is equal to
    /// `current`.
    ///
    /// Returns true if the value was replaced. Returns false if `key` is not
    /// present, its value differs from `current`, or another thread replaced
    /// the value in the meantime.
    pub fn compare_and_swap<Q: ?Sized + Hash + Eq>(&self, key: &Q, current: &V, new: V) -> bool
    where
        K: Borrow<Q>,
        V: PartialEq,
    {
        let guard = &crossbeam_epoch::pin();
        let hash = self.hash(key);

        let position = self.find(hash, |k| k.borrow() == key, guard);
        let node = match unsafe { position.current.as_ref() } {
            Some(n) => n,
            None => return false,
        };

        let value = node.value_ptr(guard);

        match unsafe { value.as_ref() } {
            Some(v) if v == current => (),
            _ => return false,
        }

        if node.compare_and_swap_value(value, Owned::new(new), guard) {
            unsafe { guard.defer_destroy(value) };

            true
        } else {
            false
        }
    }

    /// Returns the value associated with `key`, computing and inserting it
    /// first if it is absent.
    ///
    /// Concurrent callers for the same key share one invocation of `compute`:
    /// one caller runs it while the others wait and then read whatever it
    /// inserted. If `compute` returns [`None`], nothing is inserted and
    /// [`None`] is returned.
    ///
    /// Calls are coalesced by key hash. Two distinct keys that collide on the
    /// full 64-bit hash may observe each other's call, in which case the
    /// waiting caller returns whatever its own key currently maps to.
    ///
    /// # Panics
    ///
    /// If `compute` panics, the panic propagates to the caller that ran it
    /// and every caller waiting on it panics as well.
    ///
    /// [`None`]: https://doc.rust-lang.org/std/option/enum.Option.html#variant.None
    pub fn get_or_compute<F: FnOnce() -> Option<V>>(&self, key: K, compute: F) -> Option<V>
    where
        V: Clone,
    {
        if let Some(value) = self.get(&key) {
            return Some(value);
        }

        let hash = self.hash(&key);
        let mut pending = Some((key, compute));

        let flight = self.flights.run(hash, || {
            let (key, compute) = pending.take()?;

            // a call that finished just before ours may have filled it in
            if let Some(value) = self.get(&key) {
                return Some(value);
            }

            let value = compute()?;
            self.insert_and(key, value.clone(), |_| ());

            Some(value)
        });

        match flight {
            Flight::Led(value) => value,
            Flight::Followed => pending.and_then(|(key, _)| self.get(&key)),
        }
    }

    /// Invokes `visit` with each live entry in ascending hash order until it
    /// returns false.
    ///
    /// Entries inserted or removed concurrently may or may not be visited, but
    /// no entry is visited twice.
    pub fn for_each<F: FnMut(&K, &V) -> bool>(&self, mut visit: F) {
        let guard = &crossbeam_epoch::pin();
        let mut current = unsafe { self.head(guard).deref() }.next_live(guard);

        while let Some(node) = unsafe { current.as_ref() } {
            if let (Some(key), Some(value)) = (node.key(), node.value(guard)) {
                if !visit(key, value) {
                    return;
                }
            }

            current = node.next_live(guard);
        }
    }

    /// Grows the index to at least `length` buckets.
    ///
    /// Does nothing if the index already has that many buckets, another
    /// thread is already growing it, or `length` is beyond the largest
    /// supported index (`2^(usize::BITS / 2)` buckets).
    pub fn grow(&self, length: usize) {
        let guard = &crossbeam_epoch::pin();

        if length <= self.table(guard).len() || index_length(length).is_none() {
            return;
        }

        self.try_grow(length, guard);
    }

    /// Replaces the hasher used for keys.
    ///
    /// Existing entries are re-threaded under the new hasher, which is why
    /// `K` and `V` must implement [`Clone`].
    ///
    /// [`Clone`]: https://doc.rust-lang.org/std/clone/trait.Clone.html
    pub fn set_hasher(&mut self, build_hasher: S)
    where
        K: Clone,
        V: Clone,
    {
        let mut entries = Vec::with_capacity(self.len());

        self.for_each(|k, v| {
            entries.push((k.clone(), v.clone()));

            true
        });

        let capacity = self.capacity();
        *self = HashMap::with_capacity_and_hasher(capacity, build_hasher);

        for (key, value) in entries {
            self.insert_and(key, value, |_| ());
        }
    }
}

impl<'g, K: 'g + Hash + Eq, V: 'g, S: BuildHasher> HashMap<K, V, S> {
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);

        // MARK is reserved for the head and tombstones
        match hasher.finish() {
            MARK => MARK - 1,
            hash => hash,
        }
    }

    fn head(&self, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        self.head.load(Ordering::Acquire, guard)
    }

    fn table(&self, guard: &'g Guard) -> &'g IndexTable<K, V> {
        unsafe { self.table.load(Ordering::Acquire, guard).deref() }
    }

    fn start(&self, hash: u64, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        self.table(guard)
            .index_element(hash, guard)
            .unwrap_or_else(|| self.head(guard))
    }

    fn find<M: Fn(&K) -> bool>(&self, hash: u64, matches: M, guard: &'g Guard) -> Position<'g, K, V> {
        self.find_from(self.start(hash, guard), hash, matches, guard)
    }

    fn find_from<M: Fn(&K) -> bool>(
        &self,
        start: Shared<'g, Node<K, V>>,
        hash: u64,
        matches: M,
        guard: &'g Guard,
    ) -> Position<'g, K, V> {
        Node::search(
            self.head(guard),
            start,
            hash,
            matches,
            |node| {
                Node::mark_unlinked(node, guard);
                self.table(guard).remove_item_from_index(node, guard);
            },
            guard,
        )
    }

    fn index(&self, node: Shared<'g, Node<K, V>>, guard: &'g Guard) {
        let table = self.table(guard);

        if table.add_item_to_index(node, guard) != 0 && table.fill_rate() > MAX_FILL_RATE {
            self.try_grow(0, guard);
        }
    }

    fn try_grow(&self, mut requested: usize, guard: &'g Guard) {
        if self
            .resizing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        loop {
            let old_ptr = self.table.load(Ordering::Acquire, guard);
            let old = unsafe { old_ptr.deref() };

            if old.len() >= MAX_LENGTH {
                break;
            }

            let length = match index_length(requested.max(old.len() * 2)) {
                Some(length) => length,
                None => break,
            };
            let new_ptr = Owned::new(IndexTable::with_length(length)).into_shared(guard);
            let new = unsafe { new_ptr.deref() };

            self.fill(new, guard);
            self.table.store(new_ptr, Ordering::Release);

            trace!(
                from = old.len(),
                to = length,
                fill_rate = new.fill_rate(),
                "grew map index"
            );

            old.seal(guard);
            unsafe { guard.defer_destroy(old_ptr) };

            if new.fill_rate() <= MAX_FILL_RATE {
                break;
            }

            requested = 0;
        }

        self.resizing.store(false, Ordering::Release);
    }

    // Offers the first live node of every run that shares a bucket.
    fn fill(&self, table: &'g IndexTable<K, V>, guard: &'g Guard) {
        let mut last_index = None;
        let mut current = unsafe { self.head(guard).deref() }.next_live(guard);

        while let Some(node) = unsafe { current.as_ref() } {
            let index = table.index_of(node.hash);

            if last_index != Some(index) {
                table.add_item_to_index(current, guard);
                last_index = Some(index);
            }

            current = node.next_live(guard);
        }
    }
}

// Rounds up to a bucket count, or `None` if that would exceed MAX_LENGTH.
fn index_length(length: usize) -> Option<usize> {
    length
        .checked_next_power_of_two()
        .filter(|&length| length <= MAX_LENGTH)
}

impl<K, V, S: Default> Default for HashMap<K, V, S> {
    fn default() -> Self {
        HashMap::with_hasher(S::default())
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        // no other thread can hold a reference to the map, so nothing
        // below needs to be protected
        let guard = unsafe { crossbeam_epoch::unprotected() };

        let table = self.table.swap(Shared::null(), Ordering::Relaxed, guard);

        if !table.is_null() {
            unsafe {
                table.deref().free_orphans(guard);
                drop(table.into_owned());
            }
        }

        // live nodes, deleted-but-linked nodes and their tombstones
        let mut current = self.head.swap(Shared::null(), Ordering::Relaxed, guard);

        while let Some(node) = unsafe { current.as_ref() } {
            let next = node.next_ptr(guard);
            drop(unsafe { current.into_owned() });
            current = next;
        }
    }
}
