//  Copyright 2024 Cachecore Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! The lock-free concurrent map: one Harris-style marked linked list per
//! bucket, with an embedded atomic tagged slot so that replacing the value
//! for a key that is already present never touches list structure at all.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use cachecore_common::code::Key;
use crossbeam_epoch::{Atomic, Guard as CbGuard, Owned, Shared};

use crate::entry::RealEntry;
use crate::epoch::{EpochGuard, EpochPool};
use crate::slot::TaggedSlot;

struct Node<K> {
    hash: u64,
    key: K,
    slot: AtomicU64,
    next: Atomic<Node<K>>,
}

impl<K> Node<K> {
    fn new(hash: u64, key: K, slot_bits: u64) -> Self {
        Self { hash, key, slot: AtomicU64::new(slot_bits), next: Atomic::null() }
    }
}

struct Bucket<K> {
    head: Atomic<Node<K>>,
}

impl<K> Default for Bucket<K> {
    fn default() -> Self {
        Self { head: Atomic::null() }
    }
}

/// Harris's classic marked-pointer search: walk from `head` looking for a
/// node whose `(hash, key)` matches, physically unlinking any
/// logically-deleted (tag == 1) nodes it passes over along the way.
///
/// Returns `(predecessor_link, node)`, where `node` is null if no match was
/// found (in which case `predecessor_link` is exactly where a new node with
/// this `(hash, key)` belongs).
fn search<'g, K>(
    head: &'g Atomic<Node<K>>,
    hash: u64,
    key: &K,
    guard: &'g CbGuard,
) -> (&'g Atomic<Node<K>>, Shared<'g, Node<K>>)
where
    K: PartialEq,
{
    'retry: loop {
        let mut left = head;
        let mut right = left.load(Ordering::Acquire, guard);
        loop {
            if right.is_null() {
                return (left, right);
            }
            let right_unmarked = right.with_tag(0);
            let right_ref = unsafe { right_unmarked.deref() };
            let next = right_ref.next.load(Ordering::Acquire, guard);
            if next.tag() == 1 {
                // `right` is marked for deletion: help finish unlinking it
                // before continuing the search from the same predecessor.
                match left.compare_exchange(
                    right_unmarked,
                    next.with_tag(0),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => unsafe { guard.defer_destroy(right_unmarked) },
                    Err(_) => continue 'retry,
                }
                right = next.with_tag(0);
                continue;
            }
            if right_ref.hash > hash || (right_ref.hash == hash && &right_ref.key == key) {
                return (left, right_unmarked);
            }
            left = &right_ref.next;
            right = next;
        }
    }
}

/// Outcome of `remove_if`'s predicate, carried through for the ghost /
/// real-entry cleanup callers that need it.
pub struct RemovedSlot {
    pub slot: TaggedSlot,
}

/// A lock-free `(Key, TaggedSlot)` map. Generic over `V` purely so that
/// retiring a real-entry pointer knows the concrete type to drop (`V`
/// itself never appears in the list structure).
pub struct ConcurrentMap<K, V> {
    buckets: Box<[Bucket<K>]>,
    bucket_mask: u64,
    chunk_count: usize,
    pool: EpochPool,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Key,
    V: Send + 'static,
{
    /// `bucket_count_log2` fixes the number of buckets for the lifetime of
    /// the map (the bucket array never resizes); `chunk_count_log2` must be
    /// small enough that `2^chunk_count_log2 <= 2^bucket_count_log2`.
    pub fn new(bucket_count_log2: u32, chunk_count_log2: u32) -> Self {
        let bucket_count = 1usize << bucket_count_log2;
        let chunk_count = 1usize << chunk_count_log2;
        assert!(chunk_count <= bucket_count, "more chunks than buckets");
        let buckets = (0..bucket_count).map(|_| Bucket::default()).collect();
        Self {
            buckets,
            bucket_mask: bucket_count as u64 - 1,
            chunk_count,
            pool: EpochPool::new(),
            _value: std::marker::PhantomData,
        }
    }

    #[inline]
    pub fn bucket_for_hash(&self, hash: u64) -> usize {
        (hash & self.bucket_mask) as usize
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// The contiguous bucket range owned by `chunk_index`.
    pub fn chunk_range(&self, chunk_index: usize) -> Range<usize> {
        let size = self.buckets.len() / self.chunk_count;
        let start = chunk_index * size;
        let end = if chunk_index + 1 == self.chunk_count { self.buckets.len() } else { start + size };
        start..end
    }

    pub fn pin(&self) -> EpochGuard {
        self.pool.pin()
    }

    pub fn find(&self, hash: u64, key: &K) -> Option<(TaggedSlot, EpochGuard)> {
        let guard = self.pool.pin();
        let bucket = &self.buckets[self.bucket_for_hash(hash)];
        let (_, right) = search(&bucket.head, hash, key, guard.inner());
        if right.is_null() {
            return None;
        }
        let node = unsafe { right.deref() };
        if node.hash != hash || &node.key != key {
            return None;
        }
        let bits = node.slot.load(Ordering::Acquire);
        Some((TaggedSlot::from_bits(bits), guard))
    }

    pub fn contains(&self, hash: u64, key: &K) -> bool {
        let guard = self.pool.pin();
        let bucket = &self.buckets[self.bucket_for_hash(hash)];
        let (_, right) = search(&bucket.head, hash, key, guard.inner());
        !right.is_null() && {
            let node = unsafe { right.deref() };
            node.hash == hash && &node.key == key
        }
    }

    /// Insert `slot`, replacing any existing slot for `key`. If `mergeable`
    /// is given, it computes the slot actually installed from
    /// `(old_slot, slot)`; it may be invoked more than once if the
    /// replacement CAS is contended, so it must be a pure function of its
    /// arguments. Retires the prior real entry, if any.
    pub fn upsert<M>(&self, hash: u64, key: K, slot: TaggedSlot, mergeable: Option<M>) -> (TaggedSlot, bool)
    where
        M: Fn(TaggedSlot, TaggedSlot) -> TaggedSlot,
    {
        let guard = self.pool.pin();
        let cb = guard.inner();
        let bucket = &self.buckets[self.bucket_for_hash(hash)];
        let mut pending = Owned::new(Node::new(hash, key.clone(), slot.bits()));
        loop {
            let (left, right) = search(&bucket.head, hash, &key, cb);
            if !right.is_null() {
                let node = unsafe { right.deref() };
                if node.hash == hash && node.key == key {
                    let mut old_bits = node.slot.load(Ordering::Acquire);
                    loop {
                        let old_slot = TaggedSlot::from_bits(old_bits);
                        let merged = match &mergeable {
                            Some(f) => f(old_slot, slot),
                            None => slot,
                        };
                        match node.slot.compare_exchange_weak(
                            old_bits,
                            merged.bits(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                if let Some(ptr) = old_slot.as_real::<RealEntry<K, V>>() {
                                    unsafe { guard.retire(ptr) };
                                }
                                return (merged, false);
                            }
                            Err(observed) => old_bits = observed,
                        }
                    }
                }
            }
            pending.next.store(right, Ordering::Relaxed);
            match left.compare_exchange(right, pending, Ordering::AcqRel, Ordering::Acquire, cb) {
                Ok(_) => return (slot, true),
                Err(err) => pending = err.new,
            }
        }
    }

    /// Never overwrites an existing slot. Used to install ghosts without
    /// risk of demoting a live real entry.
    pub fn insert_if_absent(&self, hash: u64, key: K, slot: TaggedSlot) -> bool {
        let guard = self.pool.pin();
        let cb = guard.inner();
        let bucket = &self.buckets[self.bucket_for_hash(hash)];
        let mut pending = Owned::new(Node::new(hash, key.clone(), slot.bits()));
        loop {
            let (left, right) = search(&bucket.head, hash, &key, cb);
            if !right.is_null() {
                let node = unsafe { right.deref() };
                if node.hash == hash && node.key == key {
                    return false;
                }
            }
            pending.next.store(right, Ordering::Relaxed);
            match left.compare_exchange(right, pending, Ordering::AcqRel, Ordering::Acquire, cb) {
                Ok(_) => return true,
                Err(err) => pending = err.new,
            }
        }
    }

    fn unlink(&self, bucket: &Bucket<K>, hash: u64, key: &K, guard: &EpochGuard) -> bool {
        let cb = guard.inner();
        loop {
            let (left, right) = search(&bucket.head, hash, key, cb);
            if right.is_null() {
                return false;
            }
            let node = unsafe { right.deref() };
            if node.hash != hash || &node.key != key {
                return false;
            }
            let next = node.next.load(Ordering::Acquire, cb);
            if next.tag() == 1 {
                return false;
            }
            match node.next.compare_exchange(
                next,
                next.with_tag(1),
                Ordering::AcqRel,
                Ordering::Acquire,
                cb,
            ) {
                Ok(_) => {
                    let _ = left.compare_exchange(right, next, Ordering::AcqRel, Ordering::Acquire, cb);
                    unsafe { cb.defer_destroy(right) };
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    pub fn remove(&self, hash: u64, key: &K) -> Option<TaggedSlot> {
        let guard = self.pool.pin();
        let bucket = &self.buckets[self.bucket_for_hash(hash)];
        let (_, right) = search(&bucket.head, hash, key, guard.inner());
        if right.is_null() {
            return None;
        }
        let node = unsafe { right.deref() };
        if node.hash != hash || &node.key != key {
            return None;
        }
        let bits = node.slot.load(Ordering::Acquire);
        if !self.unlink(bucket, hash, key, &guard) {
            return None;
        }
        let slot = TaggedSlot::from_bits(bits);
        if let Some(ptr) = slot.as_real::<RealEntry<K, V>>() {
            unsafe { guard.retire(ptr) };
        }
        Some(slot)
    }

    /// Atomic remove gated on `pred`: the slot is swapped out to `Empty`
    /// first, `pred` is evaluated on what was there, and only on
    /// acceptance is the node actually unlinked. On rejection the slot is
    /// reinstalled on a best-effort basis: if a concurrent writer already
    /// reoccupied it, that write stands.
    pub fn remove_if<P>(&self, hash: u64, key: &K, pred: P) -> bool
    where
        P: FnOnce(TaggedSlot) -> bool,
    {
        let guard = self.pool.pin();
        let bucket = &self.buckets[self.bucket_for_hash(hash)];
        let (_, right) = search(&bucket.head, hash, key, guard.inner());
        if right.is_null() {
            return false;
        }
        let node = unsafe { right.deref() };
        if node.hash != hash || &node.key != key {
            return false;
        }
        let old_bits = node.slot.load(Ordering::Acquire);
        if node
            .slot
            .compare_exchange(old_bits, TaggedSlot::EMPTY.bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let old_slot = TaggedSlot::from_bits(old_bits);
        if pred(old_slot) {
            if node.slot.load(Ordering::Acquire) == TaggedSlot::EMPTY.bits() {
                self.unlink(bucket, hash, key, &guard);
            }
            if let Some(ptr) = old_slot.as_real::<RealEntry<K, V>>() {
                unsafe { guard.retire(ptr) };
            }
            true
        } else {
            let _ = node.slot.compare_exchange(
                TaggedSlot::EMPTY.bits(),
                old_bits,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            false
        }
    }

    /// Visit every live slot in the given bucket range (used only by
    /// chunked cleanup).
    pub fn for_each_in_range<F>(&self, range: Range<usize>, mut visit: F)
    where
        F: FnMut(u64, &K, TaggedSlot),
    {
        let guard = self.pool.pin();
        let cb = guard.inner();
        for bucket in &self.buckets[range] {
            let mut current = bucket.head.load(Ordering::Acquire, cb);
            while !current.is_null() {
                let node = unsafe { current.deref() };
                let next = node.next.load(Ordering::Acquire, cb);
                if next.tag() == 0 {
                    let bits = node.slot.load(Ordering::Acquire);
                    visit(node.hash, &node.key, TaggedSlot::from_bits(bits));
                }
                current = next.with_tag(0);
            }
        }
    }
}

impl<K, V> Drop for ConcurrentMap<K, V> {
    fn drop(&mut self) {
        // Exclusive access (we are being dropped): tear down directly
        // rather than deferring through the epoch.
        let guard = crossbeam_epoch::pin();
        for bucket in self.buckets.iter() {
            let mut current = bucket.head.load(Ordering::Relaxed, &guard);
            while !current.is_null() {
                let owned = unsafe { current.into_owned() };
                let bits = owned.slot.load(Ordering::Relaxed);
                if let Some(ptr) = TaggedSlot::from_bits(bits).as_real::<RealEntry<K, V>>() {
                    unsafe { drop(Box::from_raw(ptr)) };
                }
                current = owned.next.load(Ordering::Relaxed, &guard).with_tag(0);
                // `owned` drops here, freeing the `Node<K>` allocation.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn hash_of(k: u64) -> u64 {
        // A fixed, deterministic stand-in for the caller-supplied hash
        // function used throughout these unit tests.
        ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(k)
    }

    #[test]
    fn insert_then_find_round_trips() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        let slot = TaggedSlot::ghost(Default::default(), 10, 1);
        assert!(map.insert_if_absent(hash_of(1), 1, slot));
        let (found, _guard) = map.find(hash_of(1), &1).unwrap();
        assert_eq!(found, slot);
    }

    #[test]
    fn insert_if_absent_does_not_clobber_existing() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        let first = TaggedSlot::ghost(Default::default(), 10, 1);
        let second = TaggedSlot::ghost(Default::default(), 99, 2);
        assert!(map.insert_if_absent(hash_of(1), 1, first));
        assert!(!map.insert_if_absent(hash_of(1), 1, second));
        let (found, _guard) = map.find(hash_of(1), &1).unwrap();
        assert_eq!(found, first);
    }

    #[test]
    fn upsert_replaces_and_reports_was_insert() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        let first = TaggedSlot::ghost(Default::default(), 10, 1);
        let second = TaggedSlot::ghost(Default::default(), 20, 2);
        let (_slot, was_insert) = map.upsert::<fn(TaggedSlot, TaggedSlot) -> TaggedSlot>(hash_of(1), 1, first, None);
        assert!(was_insert);
        let (_slot, was_insert) =
            map.upsert::<fn(TaggedSlot, TaggedSlot) -> TaggedSlot>(hash_of(1), 1, second, None);
        assert!(!was_insert);
        let (found, _guard) = map.find(hash_of(1), &1).unwrap();
        assert_eq!(found, second);
    }

    #[test]
    fn remove_deletes_key() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        let slot = TaggedSlot::ghost(Default::default(), 10, 1);
        map.insert_if_absent(hash_of(1), 1, slot);
        let removed = map.remove(hash_of(1), &1);
        assert_eq!(removed, Some(slot));
        assert!(map.find(hash_of(1), &1).is_none());
    }

    #[test]
    fn remove_if_rejects_and_reinstalls() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        let slot = TaggedSlot::ghost(Default::default(), 10, 1);
        map.insert_if_absent(hash_of(1), 1, slot);
        let removed = map.remove_if(hash_of(1), &1, |_| false);
        assert!(!removed);
        let (found, _guard) = map.find(hash_of(1), &1).unwrap();
        assert_eq!(found, slot);
    }

    #[test]
    fn remove_if_accepts_and_deletes() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        let slot = TaggedSlot::ghost(Default::default(), 10, 1);
        map.insert_if_absent(hash_of(1), 1, slot);
        let removed = map.remove_if(hash_of(1), &1, |_| true);
        assert!(removed);
        assert!(map.find(hash_of(1), &1).is_none());
    }

    #[test]
    fn chunk_ranges_cover_every_bucket_exactly_once() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(6, 3);
        let mut covered = vec![false; map.bucket_count()];
        for chunk in 0..map.chunk_count() {
            for i in map.chunk_range(chunk) {
                assert!(!covered[i], "bucket {i} covered twice");
                covered[i] = true;
            }
        }
        assert!(covered.into_iter().all(|c| c));
    }

    #[test]
    fn concurrent_inserts_are_all_observable() {
        let map: Arc<ConcurrentMap<u64, u64>> = Arc::new(ConcurrentMap::new(8, 2));
        let mut handles = vec![];
        for t in 0..8u64 {
            let map = map.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200u64 {
                    let key = t * 1000 + i;
                    let slot = TaggedSlot::ghost(Default::default(), 1, 1);
                    map.insert_if_absent(hash_of(key), key, slot);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..8u64 {
            for i in 0..200u64 {
                let key = t * 1000 + i;
                assert!(map.find(hash_of(key), &key).is_some());
            }
        }
    }

    #[test]
    fn for_each_in_range_visits_only_its_chunk() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 2);
        for k in 0..50u64 {
            map.insert_if_absent(hash_of(k), k, TaggedSlot::ghost(Default::default(), 1, 1));
        }
        let mut seen = 0usize;
        for chunk in 0..map.chunk_count() {
            map.for_each_in_range(map.chunk_range(chunk), |_, _, _| seen += 1);
        }
        assert_eq!(seen, 50);
    }
}
