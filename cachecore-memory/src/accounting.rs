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

//! Striped memory accounting: a signed counter spread over cache lines so
//! that concurrent charges from many threads don't contend on one atomic.

use std::cell::Cell;
use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_utils::CachePadded;

/// `MEMORY_COUNTER_SLOTS` must be a power of two, at most 64.
const MAX_SLOTS: usize = 64;

thread_local! {
    /// Each thread sticks to one slot for its lifetime to keep charges for
    /// a single logical caller coherent-ish under load, without needing any
    /// synchronization to pick it.
    static SLOT_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

pub struct MemoryAccounting {
    slots: Box<[CachePadded<AtomicI64>]>,
    mask: usize,
    max_memory: u64,
}

impl MemoryAccounting {
    /// `slots` is rounded up to the next power of two and clamped to
    /// [`MAX_SLOTS`]. `max_memory = 0` disables the GDSF policy entirely.
    pub fn new(slots: usize, max_memory: u64) -> Self {
        let count = slots.next_power_of_two().clamp(1, MAX_SLOTS);
        let slots: Box<[CachePadded<AtomicI64>]> =
            (0..count).map(|_| CachePadded::new(AtomicI64::new(0))).collect();
        Self { mask: count - 1, slots, max_memory }
    }

    fn slot_index(&self) -> usize {
        SLOT_HINT.with(|hint| {
            if let Some(i) = hint.get() {
                return i & self.mask;
            }
            // Derive a stable-ish index from the thread id's hash so
            // distinct threads are likely to spread across slots without
            // any shared state to coordinate the assignment.
            let tid = std::thread::current().id();
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::hash::Hash::hash(&tid, &mut hasher);
            let idx = (std::hash::Hasher::finish(&hasher) as usize) & self.mask;
            hint.set(Some(idx));
            idx
        })
    }

    /// Charge (or discharge, for negative `delta`) bytes against this
    /// cache's share of memory.
    pub fn charge(&self, delta: i64) {
        let idx = self.slot_index();
        self.slots[idx].fetch_add(delta, Ordering::Relaxed);
    }

    /// Approximate total under contention, exact at quiescence.
    pub fn total_memory(&self) -> i64 {
        self.slots.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }

    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    /// `max_memory == 0` disables the policy entirely.
    pub fn policy_enabled(&self) -> bool {
        self.max_memory > 0
    }

    pub fn over_budget(&self) -> bool {
        self.policy_enabled() && self.total_memory() as i128 > self.max_memory as i128
    }

    /// `usage = total_memory / max_memory`, clamped to `[0, +inf)`. Used by
    /// the histogram threshold derivation; callers must check
    /// `policy_enabled()` first.
    pub fn usage(&self) -> f64 {
        if self.max_memory == 0 {
            return 0.0;
        }
        (self.total_memory().max(0) as f64) / (self.max_memory as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_max_memory_disables_policy() {
        let acct = MemoryAccounting::new(8, 0);
        acct.charge(1_000_000);
        assert!(!acct.policy_enabled());
        assert!(!acct.over_budget());
    }

    #[test]
    fn charges_and_discharges_sum_correctly() {
        let acct = MemoryAccounting::new(4, 1_000);
        acct.charge(500);
        acct.charge(200);
        acct.charge(-100);
        assert_eq!(acct.total_memory(), 600);
    }

    #[test]
    fn over_budget_reflects_max_memory() {
        let acct = MemoryAccounting::new(4, 1_000);
        acct.charge(999);
        assert!(!acct.over_budget());
        acct.charge(2);
        assert!(acct.over_budget());
    }

    #[test]
    fn usage_at_half_capacity() {
        let acct = MemoryAccounting::new(1, 1_000);
        acct.charge(500);
        assert!((acct.usage() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn slot_count_is_clamped_to_power_of_two_at_most_64() {
        let acct = MemoryAccounting::new(1000, 10);
        assert_eq!(acct.slots.len(), 64);
        let acct = MemoryAccounting::new(3, 10);
        assert_eq!(acct.slots.len(), 4);
    }
}
