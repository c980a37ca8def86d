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

//! [`Cache`] ties the map, accounting, histogram, generation table and
//! metrics together into one named, independently-swept L1 engine.

use std::hash::{BuildHasher, Hash};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cachecore_common::code::{HashBuilder, Key, Value};

use crate::accounting::MemoryAccounting;
use crate::config::{CacheOptions, GlobalPolicyConfig};
use crate::entry::RealEntry;
use crate::epoch::EpochGuard;
use crate::eviction::{should_promote, sweep_chunk, SweepOutcome};
use crate::generation::GenerationTable;
use crate::histogram::{target_pct, ScoreHistogram};
use crate::map::ConcurrentMap;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::registry::Sweepable;
use crate::slot::{GhostFormat, TaggedSlot};

/// A guard borrowing the underlying [`RealEntry`] for the duration of one
/// epoch pin. Dereferences to `&V`; the epoch guard embedded in it is what
/// keeps the entry alive even if a concurrent eviction unlinks it the
/// instant after `find` returns.
///
/// Not `Send`/`Sync`: the embedded [`EpochGuard`] must be dropped on the
/// thread that acquired it. A caller that needs the value to survive a
/// suspension point (an `.await`, or a handoff to another thread) must
/// clone `V` out of the entry first, the way the facade layer does.
pub struct CacheEntry<K, V> {
    ptr: *const RealEntry<K, V>,
    _guard: EpochGuard,
}

impl<K, V> CacheEntry<K, V> {
    pub fn key(&self) -> &K {
        unsafe { &(*self.ptr).key }
    }

    pub fn charge(&self) -> usize {
        unsafe { (*self.ptr).charge() }
    }

    /// Record a larger charge after a lazy buffer built on top of this
    /// entry's value grows its total memory usage. Returns the delta the
    /// caller must additionally charge to the owning cache's accounting
    /// counter via [`Cache::charge_delta`].
    pub fn grow_charge(&self, new_total: usize) -> usize {
        unsafe { (*self.ptr).grow_charge(new_total) }
    }
}

impl<K, V> Deref for CacheEntry<K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        unsafe { &(*self.ptr).value }
    }
}

/// Why a [`Cache::fetch_and_admit`] call did not hand back a real entry.
#[derive(Debug)]
pub enum AdmitOutcome<V, E> {
    /// The origin/remote `fetch` future itself failed.
    FetchFailed(E),
    /// The value was fetched successfully but the ghost filter has not yet
    /// seen enough interest in this key to admit it; a ghost recording this
    /// miss was installed instead. The fetched value is handed back anyway
    /// as a transient, uncached result.
    NotAdmitted(V),
}

/// One named, independently-swept in-memory cache.
pub struct Cache<K, V, S = HashBuilder> {
    name: String,
    map: ConcurrentMap<K, V>,
    accounting: MemoryAccounting,
    hash_builder: S,
    generation: GenerationTable,
    metrics: Metrics,
    persistent_histogram: Mutex<ScoreHistogram>,
    building_histogram: Mutex<ScoreHistogram>,
    threshold_bits: AtomicU64,
    policy: GlobalPolicyConfig,
    avg_fetch_cost_us: Mutex<f64>,
    default_ttl_ns: Option<i64>,
}

impl<K, V, S> Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    pub fn new(options: CacheOptions<S>, policy: GlobalPolicyConfig) -> Arc<Self> {
        let chunk_count_log2 = policy.chunk_count_log2.min(options.bucket_count_log2);
        let cache = Arc::new(Self {
            name: options.name,
            map: ConcurrentMap::new(options.bucket_count_log2, chunk_count_log2),
            accounting: MemoryAccounting::new(options.accounting_slots, options.max_memory),
            hash_builder: options.hash_builder,
            generation: GenerationTable::new(),
            metrics: Metrics::new(),
            persistent_histogram: Mutex::new(ScoreHistogram::new()),
            building_histogram: Mutex::new(ScoreHistogram::new()),
            threshold_bits: AtomicU64::new(0),
            policy,
            avg_fetch_cost_us: Mutex::new(1.0),
            default_ttl_ns: options.default_ttl_ns,
        });
        crate::registry::global().register(cache.clone() as Arc<dyn Sweepable>);
        cache
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn memory_usage(&self) -> i64 {
        self.accounting.total_memory()
    }

    pub fn chunk_count(&self) -> usize {
        self.map.chunk_count()
    }

    /// Adjust the accounting counter by `delta` bytes without touching the
    /// map. Used by callers that grow an entry's charge after creating a
    /// lazy serialised buffer on top of it.
    pub fn charge_delta(&self, delta: i64) {
        self.accounting.charge(delta);
    }

    /// Shrink any ghost recorded for `key` by the configured update
    /// penalty. A no-op if the key is absent or already a real entry.
    /// Callers invoke this ahead of a write-through update so a key that is
    /// frequently mutated but rarely read doesn't coast into admission on
    /// penalty-free ghost interest.
    pub fn penalize_ghost(&self, key: &K) {
        let hash = self.hash_of(key);
        crate::eviction::penalize_ghost(&self.map, hash, key);
    }

    fn hash_of<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.hash_builder.hash_one(key)
    }

    fn threshold(&self) -> f64 {
        f64::from_bits(self.threshold_bits.load(Ordering::Relaxed))
    }

    fn avg_fetch_cost_us(&self) -> f64 {
        *self.avg_fetch_cost_us.lock().unwrap()
    }

    /// Exponentially blend a freshly observed fetch latency into the
    /// running average used for GDSF scoring.
    fn record_fetch_cost(&self, cost_us: f64) {
        let mut avg = self.avg_fetch_cost_us.lock().unwrap();
        *avg = 0.9 * *avg + 0.1 * cost_us;
    }

    pub fn find(&self, key: &K) -> Option<CacheEntry<K, V>> {
        let hash = self.hash_of(key);
        let (slot, guard) = self.map.find(hash, key)?;
        if let Some(ptr) = slot.as_real::<RealEntry<K, V>>() {
            unsafe { (*ptr).metadata.record_access() };
            self.metrics.record_hit();
            Some(CacheEntry { ptr, _guard: guard })
        } else {
            // A ghost: remembered absence, not a hit.
            self.metrics.record_miss();
            None
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let hash = self.hash_of(key);
        self.map.find(hash, key).map(|(slot, _)| slot.is_real()).unwrap_or(false)
    }

    /// Insertions per cache between amortised sweep triggers, expressed as
    /// a bitmask: a sweep is kicked off whenever a write's hash happens to
    /// have every one of these low bits clear.
    const CLEANUP_MASK: u64 = (1 << 9) - 1;

    /// Kick the global sweep driver from a write path once every
    /// `CLEANUP_MASK + 1` insertions, amortised across all hashes rather
    /// than counted. A no-op outside a Tokio runtime (e.g. in a plain
    /// `#[test]`), since the detached task is an optimisation, not a
    /// correctness requirement — nothing here is load-bearing for any
    /// invariant the map itself guarantees.
    fn maybe_trigger_sweep(&self, hash: u64) {
        if hash & Self::CLEANUP_MASK != 0 {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async { crate::registry::global().tick() });
        }
    }

    /// Write-through insert or overwrite, bumping the stale-write
    /// generation so any fetch-and-admit racing this write discards its
    /// result per the configured [`crate::config::UpdateStrategy`].
    pub fn upsert(&self, key: K, value: V, charge: usize, ttl_ns: Option<i64>) -> CacheEntry<K, V> {
        let hash = self.hash_of(&key);
        let ttl = ttl_ns.or(self.default_ttl_ns);
        let entry = RealEntry::new(key.clone(), value, charge, crate::entry::COUNT_SCALE, ttl);
        let ptr = Box::into_raw(Box::new(entry));
        self.map.upsert::<fn(TaggedSlot, TaggedSlot) -> TaggedSlot>(hash, key, TaggedSlot::real(ptr), None);
        self.accounting.charge(charge as i64);
        self.generation.bump(hash);
        self.metrics.record_insert();
        self.maybe_trigger_sweep(hash);
        let guard = self.map.pin();
        CacheEntry { ptr, _guard: guard }
    }

    /// Insert only if `key` is not already present as a real entry.
    /// Returns `false` without modifying anything if it is.
    pub fn insert_if_absent(&self, key: K, value: V, charge: usize, ttl_ns: Option<i64>) -> bool {
        let hash = self.hash_of(&key);
        if self.map.find(hash, &key).map(|(s, _)| s.is_real()).unwrap_or(false) {
            return false;
        }
        let ttl = ttl_ns.or(self.default_ttl_ns);
        let entry = RealEntry::new(key.clone(), value, charge, crate::entry::COUNT_SCALE, ttl);
        let ptr = Box::into_raw(Box::new(entry));
        let installed = self.map.insert_if_absent(hash, key, TaggedSlot::real(ptr));
        if installed {
            self.accounting.charge(charge as i64);
            self.generation.bump(hash);
            self.metrics.record_insert();
            self.maybe_trigger_sweep(hash);
        } else {
            unsafe { drop(Box::from_raw(ptr)) };
        }
        installed
    }

    /// Apply `patch` to the existing value in place, or do nothing if the
    /// key is absent. Returns `true` if a real entry was patched.
    pub fn patch<F>(&self, key: &K, patch: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        let hash = self.hash_of(key);
        let Some((slot, _guard)) = self.map.find(hash, key) else {
            return false;
        };
        let Some(ptr) = slot.as_real::<RealEntry<K, V>>() else {
            return false;
        };
        // Safety: `_guard`'s pin keeps the entry alive for this call, and
        // no other path mutates `value` in place (overwrite always swaps
        // the slot's pointer instead).
        unsafe {
            let value = std::ptr::addr_of_mut!((*ptr).value);
            patch(&mut *value);
        }
        self.generation.bump(hash);
        true
    }

    pub fn erase(&self, key: &K) -> bool {
        let hash = self.hash_of(key);
        let removed = self.map.remove(hash, key);
        self.generation.bump(hash);
        match removed {
            Some(slot) if slot.is_real() => {
                self.metrics.record_remove();
                true
            }
            _ => false,
        }
    }

    /// Remove any trace of `key`, real entry or ghost, without recording
    /// it as a user-visible delete.
    pub fn invalidate(&self, key: &K) {
        let hash = self.hash_of(key);
        self.map.remove(hash, key);
        self.generation.bump(hash);
    }

    /// Ghost-admission read-through: on a miss, `fetch` runs, and the
    /// result is admitted either as a fresh ghost (recording interest) or,
    /// once a key has proven itself across enough misses to clear the
    /// current threshold, promoted straight to a real entry. A write that
    /// lands on `key` while `fetch` is in flight discards the fetch result
    /// under `UpdateStrategy::WriteWins`.
    pub async fn fetch_and_admit<F, Fut, E>(
        &self,
        key: K,
        fetch: F,
    ) -> Result<CacheEntry<K, V>, AdmitOutcome<V, E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(V, usize), E>>,
        V: Clone,
    {
        let hash = self.hash_of(&key);
        if let Some(entry) = self.find(&key) {
            return Ok(entry);
        }

        let snapshot = self.generation.snapshot(hash);
        let prior_ghost = self.map.find(hash, &key).and_then(|(slot, _)| slot.is_ghost().then_some(slot));

        let started = std::time::Instant::now();
        let (value, charge) = fetch().await.map_err(AdmitOutcome::FetchFailed)?;
        self.record_fetch_cost(started.elapsed().as_micros() as f64);

        if matches!(self.policy.update_strategy, crate::config::UpdateStrategy::WriteWins)
            && self.generation.changed_since(hash, snapshot)
        {
            // A write (or invalidate) raced us. The admission step is
            // skipped unconditionally rather than looking at what the race
            // left behind: looking up the winning write's value here would
            // return it as if `fetch_and_admit` had found it itself, which
            // is indistinguishable from admitting our own stale fetch on
            // the delete/invalidate race, where the slot is meant to stay
            // empty. The caller gets its fetched value back as a transient,
            // uncached view.
            return Err(AdmitOutcome::NotAdmitted(value));
        }

        let access_count = prior_ghost.map(|g| g.ghost_access_count() + 1).unwrap_or(1);
        let threshold = self.threshold();
        let candidate_ghost = TaggedSlot::ghost(
            GhostFormat::empty(),
            charge.min(crate::slot::GHOST_MAX_BYTES as usize) as u32,
            access_count,
        );

        if should_promote(candidate_ghost, threshold, self.avg_fetch_cost_us()) {
            let entry = RealEntry::new(key.clone(), value, charge, access_count * crate::entry::COUNT_SCALE, None);
            let ptr = Box::into_raw(Box::new(entry));
            self.map.upsert::<fn(TaggedSlot, TaggedSlot) -> TaggedSlot>(hash, key, TaggedSlot::real(ptr), None);
            self.accounting.charge(charge as i64);
            self.metrics.record_promote();
            self.metrics.record_insert();
            self.maybe_trigger_sweep(hash);
            let guard = self.map.pin();
            Ok(CacheEntry { ptr, _guard: guard })
        } else {
            let merge = |_old: TaggedSlot, new: TaggedSlot| new;
            self.map.upsert(hash, key, candidate_ghost, Some(merge));
            self.metrics.record_ghost_insert();
            self.metrics.record_miss();
            Err(AdmitOutcome::NotAdmitted(value))
        }
    }
}

impl<K, V, S> Sweepable for Cache<K, V, S>
where
    K: Key,
    V: Value,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn chunk_count(&self) -> usize {
        self.map.chunk_count()
    }

    fn sweep_chunk(&self, chunk_index: usize) -> SweepOutcome {
        let range = self.map.chunk_range(chunk_index);
        let threshold = self.threshold();
        let avg_cost = self.avg_fetch_cost_us();
        // Ghost candidates are only worth installing for a pressure sweep
        // that isn't also over budget: an over-budget sweep needs bytes
        // back now and a remembered ghost wouldn't help with that.
        let usage = self.accounting.usage();
        let install_ghosts =
            self.accounting.policy_enabled() && (0.50..=1.00).contains(&usage) && !self.accounting.over_budget();
        let mut building = self.building_histogram.lock().unwrap();
        let outcome = sweep_chunk::<K, V>(
            &self.map,
            range,
            self.policy.decay_rate,
            avg_cost,
            threshold,
            install_ghosts,
            &mut building,
        );
        if outcome.bytes_freed != 0 {
            self.accounting.charge(-outcome.bytes_freed);
            self.metrics.record_evict(outcome.evicted);
        }
        outcome
    }

    fn finish_pass(&self) {
        let mut persistent = self.persistent_histogram.lock().unwrap();
        {
            let building = self.building_histogram.lock().unwrap();
            persistent.merge_ema(&building, self.policy.histogram_ema_alpha);
        }
        *self.building_histogram.lock().unwrap() = ScoreHistogram::new();

        let new_threshold = if self.accounting.policy_enabled() {
            let usage = self.accounting.usage();
            let target = target_pct(usage);
            let bytes_to_free = target * self.accounting.max_memory() as f64;
            persistent.threshold_for(bytes_to_free)
        } else {
            0.0
        };
        self.threshold_bits.store(new_threshold.to_bits(), Ordering::Relaxed);
    }

    fn over_budget(&self) -> bool {
        self.accounting.over_budget()
    }

    fn raise_threshold_for_over_budget_pass(&self) {
        let persistent = self.persistent_histogram.lock().unwrap();
        let bytes_to_free = target_pct(1.0) * self.accounting.max_memory() as f64;
        let threshold = persistent.threshold_for(bytes_to_free);
        self.threshold_bits.store(threshold.to_bits(), Ordering::Relaxed);
    }
}
