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

//! The process-wide registry of named caches and the chunked sweep driver
//! that incrementally visits them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::eviction::SweepOutcome;

/// A type-erased handle a [`Registry`] can drive without knowing a cache's
/// key or value types.
pub trait Sweepable: Send + Sync {
    fn name(&self) -> &str;
    fn chunk_count(&self) -> usize;
    /// Sweep the chunk at `chunk_index`, recomputing that chunk's slice of
    /// the score histogram and evicting anything below the cache's current
    /// threshold.
    fn sweep_chunk(&self, chunk_index: usize) -> SweepOutcome;
    /// Called once a full pass over every chunk completes: merges the
    /// just-built histogram into the persistent one and recomputes the
    /// eviction threshold for the next pass.
    fn finish_pass(&self);
    /// True if this cache's accounted memory still exceeds its configured
    /// maximum. Checked after a pass to decide whether `tick` needs to run
    /// a second, more aggressive pass before returning.
    fn over_budget(&self) -> bool;
    /// Recompute the eviction threshold using the most aggressive target
    /// fraction (`target_pct(1.0)`), ignoring current usage, ahead of an
    /// over-budget second pass.
    fn raise_threshold_for_over_budget_pass(&self);
}

struct RegisteredCache {
    cache: Arc<dyn Sweepable>,
    next_chunk: AtomicUsize,
}

/// Holds every live cache in the process and round-robins a chunk of
/// cleanup work across them each time [`Registry::tick`] is called. A
/// single [`AtomicBool`] ensures at most one thread is actively driving the
/// sweep at a time; callers that lose the race simply return immediately,
/// since another thread is already making progress on their behalf.
#[derive(Default)]
pub struct Registry {
    caches: RwLock<Vec<RegisteredCache>>,
    driving: AtomicBool,
}

impl Registry {
    pub fn register(&self, cache: Arc<dyn Sweepable>) {
        self.caches.write().push(RegisteredCache { cache, next_chunk: AtomicUsize::new(0) });
    }

    pub fn unregister(&self, name: &str) {
        self.caches.write().retain(|r| r.cache.name() != name);
    }

    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drive one chunk's worth of cleanup work on every registered cache. If
    /// any cache is still over budget after that, its threshold is raised to
    /// the most aggressive target and a second chunk is swept on its behalf
    /// before `tick` returns. A no-op, not an error, if another thread is
    /// already ticking.
    pub fn tick(&self) -> Vec<SweepOutcome> {
        if self.driving.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Vec::new();
        }
        let mut outcomes = self.sweep_pass(|_| true);
        let any_over_budget = self.caches.read().iter().any(|r| r.cache.over_budget());
        if any_over_budget {
            for registered in self.caches.read().iter() {
                if registered.cache.over_budget() {
                    registered.cache.raise_threshold_for_over_budget_pass();
                }
            }
            outcomes.extend(self.sweep_pass(|r| r.cache.over_budget()));
        }
        self.driving.store(false, Ordering::Release);
        outcomes
    }

    /// Sweep one chunk on every registered cache for which `select` returns
    /// `true`, finishing a cache's pass once its last chunk is visited.
    fn sweep_pass(&self, select: impl Fn(&RegisteredCache) -> bool) -> Vec<SweepOutcome> {
        let caches = self.caches.read();
        caches
            .iter()
            .filter(|registered| select(registered))
            .map(|registered| {
                let chunk_count = registered.cache.chunk_count().max(1);
                let chunk = registered.next_chunk.fetch_add(1, Ordering::Relaxed) % chunk_count;
                let outcome = registered.cache.sweep_chunk(chunk);
                if chunk + 1 == chunk_count {
                    registered.cache.finish_pass();
                }
                outcome
            })
            .collect()
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry. Every [`crate::cache::Cache`] enrolls itself
/// here on construction.
pub fn global() -> &'static Registry {
    GLOBAL.get_or_init(Registry::default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    struct FakeCache {
        name: String,
        chunks: usize,
        visits: Counter,
        passes: Counter,
        over_budget: std::sync::atomic::AtomicBool,
        aggressive_raises: Counter,
    }

    impl FakeCache {
        fn new(name: &str, chunks: usize) -> Self {
            Self {
                name: name.into(),
                chunks,
                visits: Counter::new(0),
                passes: Counter::new(0),
                over_budget: std::sync::atomic::AtomicBool::new(false),
                aggressive_raises: Counter::new(0),
            }
        }
    }

    impl Sweepable for FakeCache {
        fn name(&self) -> &str {
            &self.name
        }

        fn chunk_count(&self) -> usize {
            self.chunks
        }

        fn sweep_chunk(&self, _chunk_index: usize) -> SweepOutcome {
            self.visits.fetch_add(1, Ordering::Relaxed);
            SweepOutcome::default()
        }

        fn finish_pass(&self) {
            self.passes.fetch_add(1, Ordering::Relaxed);
        }

        fn over_budget(&self) -> bool {
            self.over_budget.load(Ordering::Relaxed)
        }

        fn raise_threshold_for_over_budget_pass(&self) {
            self.aggressive_raises.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn tick_round_robins_and_reports_pass_completion() {
        let registry = Registry::default();
        let fake = Arc::new(FakeCache::new("t", 4));
        registry.register(fake.clone());
        for _ in 0..4 {
            registry.tick();
        }
        assert_eq!(fake.visits.load(Ordering::Relaxed), 4);
        assert_eq!(fake.passes.load(Ordering::Relaxed), 1);
        assert_eq!(fake.aggressive_raises.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn tick_runs_a_second_pass_when_still_over_budget() {
        let registry = Registry::default();
        let fake = Arc::new(FakeCache::new("t", 4));
        fake.over_budget.store(true, Ordering::Relaxed);
        registry.register(fake.clone());
        registry.tick();
        assert_eq!(fake.visits.load(Ordering::Relaxed), 2);
        assert_eq!(fake.aggressive_raises.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn tick_skips_the_second_pass_when_within_budget() {
        let registry = Registry::default();
        let fake = Arc::new(FakeCache::new("t", 4));
        registry.register(fake.clone());
        registry.tick();
        assert_eq!(fake.visits.load(Ordering::Relaxed), 1);
        assert_eq!(fake.aggressive_raises.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unregister_removes_by_name() {
        let registry = Registry::default();
        let fake = Arc::new(FakeCache::new("t", 1));
        registry.register(fake);
        assert_eq!(registry.len(), 1);
        registry.unregister("t");
        assert!(registry.is_empty());
    }
}
