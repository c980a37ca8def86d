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

//! Stale-write race protection: a flat table of generation counters, one
//! per hash bucket, bumped by every write that might race a slower
//! concurrent fetch-and-admit for the same key.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

const TABLE_SIZE: usize = 4096;

/// A fixed-size table of generation counters indexed by `hash % TABLE_SIZE`.
/// Collisions between unrelated keys just cause the occasional unnecessary
/// discard of a stale fetch result, never an incorrect admit.
pub struct GenerationTable {
    counters: Box<[CachePadded<AtomicU32>]>,
}

impl Default for GenerationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationTable {
    pub fn new() -> Self {
        let counters = (0..TABLE_SIZE).map(|_| CachePadded::new(AtomicU32::new(0))).collect();
        Self { counters }
    }

    fn index(&self, hash: u64) -> usize {
        (hash as usize) % self.counters.len()
    }

    /// Snapshot the current generation for `hash` before starting a
    /// fetch-and-admit. The caller compares this against [`bump`]'s return
    /// later to detect whether a write raced the fetch.
    pub fn snapshot(&self, hash: u64) -> u32 {
        self.counters[self.index(hash)].load(Ordering::Acquire)
    }

    /// Bump the generation for `hash`, called by every write-through path
    /// (insert, upsert, patch, erase, invalidate) and by write-coalescing
    /// followers once the leader's write lands, so waiters observe the
    /// same generation bump the leader caused.
    pub fn bump(&self, hash: u64) -> u32 {
        self.counters[self.index(hash)].fetch_add(1, Ordering::AcqRel) + 1
    }

    /// True if a write landed for `hash` since `snapshot` was taken.
    pub fn changed_since(&self, hash: u64, snapshot: u32) -> bool {
        self.counters[self.index(hash)].load(Ordering::Acquire) != snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_is_observed_by_changed_since() {
        let table = GenerationTable::new();
        let snap = table.snapshot(42);
        assert!(!table.changed_since(42, snap));
        table.bump(42);
        assert!(table.changed_since(42, snap));
    }

    #[test]
    fn unrelated_hashes_do_not_interfere_outside_collisions() {
        let table = GenerationTable::new();
        let snap = table.snapshot(1);
        table.bump(2);
        assert!(!table.changed_since(1, snap));
    }

    #[test]
    fn bump_returns_new_generation() {
        let table = GenerationTable::new();
        assert_eq!(table.bump(7), 1);
        assert_eq!(table.bump(7), 2);
    }
}
