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

//! GDSF scoring decisions: which live entries a sweep chunk evicts, and
//! whether a ghost has earned promotion to a real entry.

use cachecore_common::code::Key;

use crate::entry::{ghost_score_proxy, RealEntry, COUNT_SCALE};
use crate::histogram::ScoreHistogram;
use crate::map::ConcurrentMap;
use crate::slot::{GhostFormat, TaggedSlot};

/// Multiplier applied to a ghost's counter on an update/patch path.
/// Frequently mutated keys are thus discouraged from re-admission at a
/// score earned by stale interest.
pub const UPDATE_PENALTY: f64 = 0.25;

/// If `key` currently holds a ghost, shrink its counter by [`UPDATE_PENALTY`]
/// in place. A no-op if the key is absent or already a real entry.
pub fn penalize_ghost<K, V>(map: &ConcurrentMap<K, V>, hash: u64, key: &K)
where
    K: Key,
    V: Send + 'static,
{
    let Some((slot, _guard)) = map.find(hash, key) else {
        return;
    };
    if !slot.is_ghost() {
        return;
    }
    let penalized_count = ((slot.ghost_access_count() as f64) * UPDATE_PENALTY) as u32;
    let penalized = slot.with_ghost_access_count(penalized_count.max(1));
    // `old` may be stale under CAS contention; `new` already carries the
    // penalized count computed from the snapshot read above. Only apply it
    // if the slot is still a ghost — a concurrent promotion to a real entry
    // must never be clobbered by a stale ghost penalty.
    let merge = |old: TaggedSlot, new: TaggedSlot| if old.is_ghost() { new } else { old };
    map.upsert(hash, key.clone(), penalized, Some(merge));
}

/// An entry is evicted once its score falls strictly below the threshold
/// derived from the target fraction to free. A score exactly on the
/// boundary survives: the threshold is the score at which cumulative bytes
/// first reach the target, so the boundary bucket's occupant is already
/// counted toward the freed total without needing to be evicted itself.
#[inline]
pub fn should_evict(score: f64, threshold: f64) -> bool {
    score < threshold
}

/// A ghost is promoted once its proxy score clears the same threshold a
/// real entry would need to survive eviction: if it were real today, it
/// wouldn't be at the bottom of the distribution.
#[inline]
pub fn should_promote(ghost: TaggedSlot, threshold: f64, avg_fetch_cost_us: f64) -> bool {
    debug_assert!(ghost.is_ghost());
    let score = ghost_score_proxy(ghost.ghost_access_count(), avg_fetch_cost_us, ghost.ghost_bytes_estimate());
    score > threshold
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SweepOutcome {
    pub visited: usize,
    pub evicted: usize,
    pub bytes_freed: i64,
}

/// Visit every live slot in `range`. Real entries have their count decayed
/// and their score folded into `building`; any whose score falls below
/// `threshold` is evicted. Ghost slots have their counter decayed by
/// `decay_rate` and are removed once it reaches zero — this is what lets a
/// ghost eventually age out of the map rather than living forever.
///
/// `install_ghosts` gates whether an evicted real entry gets a ghost
/// candidate seeded with its decayed count: per the admission engine's
/// design, this only happens during a pressure sweep (`usage` in `[0.50,
/// 1.00]`) that is not also an over-budget sweep, so over-budget sweeps
/// discard outright rather than spend a slot remembering what they discarded.
#[allow(clippy::too_many_arguments)]
pub fn sweep_chunk<K, V>(
    map: &ConcurrentMap<K, V>,
    range: std::ops::Range<usize>,
    decay_rate: f64,
    avg_fetch_cost_us: f64,
    threshold: f64,
    install_ghosts: bool,
    building: &mut ScoreHistogram,
) -> SweepOutcome
where
    K: Key,
    V: Send + 'static,
{
    let mut outcome = SweepOutcome::default();
    let mut to_evict: Vec<(u64, K)> = Vec::new();
    let mut to_decay: Vec<(u64, K)> = Vec::new();

    map.for_each_in_range(range, |hash, key, slot| {
        if let Some(ptr) = slot.as_real::<RealEntry<K, V>>() {
            outcome.visited += 1;
            let entry = unsafe { &*ptr };
            let decayed = entry.metadata.decay(decay_rate);
            let score = crate::entry::gdsf_score(decayed, avg_fetch_cost_us, entry.charge());
            building.record(score, entry.charge());
            if should_evict(score, threshold) {
                to_evict.push((hash, key.clone()));
            }
        } else if slot.is_ghost() {
            to_decay.push((hash, key.clone()));
        }
    });

    for (hash, key) in to_evict {
        // Re-check under `remove_if` rather than trusting the snapshot
        // taken during the read-only visit above: the entry may have been
        // touched (or already removed) since.
        let mut freed = 0i64;
        let mut ghost_candidate = None;
        let removed = map.remove_if(hash, &key, |slot| {
            if let Some(ptr) = slot.as_real::<RealEntry<K, V>>() {
                let entry = unsafe { &*ptr };
                let current_count = entry.metadata.scaled_count();
                let current_score = crate::entry::gdsf_score(current_count, avg_fetch_cost_us, entry.charge());
                if should_evict(current_score, threshold) {
                    freed = entry.charge() as i64;
                    if install_ghosts {
                        // Seed the ghost's counter from the evicted entry,
                        // scaled back down to the raw units a ghost's
                        // counter is kept in (see `fetch_and_admit`, which
                        // multiplies by `COUNT_SCALE` on the way back up).
                        let raw_count = (current_count / COUNT_SCALE).max(1);
                        ghost_candidate = Some(TaggedSlot::ghost(
                            GhostFormat::empty(),
                            entry.charge().min(crate::slot::GHOST_MAX_BYTES as usize) as u32,
                            raw_count,
                        ));
                    }
                    return true;
                }
            }
            false
        });
        if removed {
            outcome.evicted += 1;
            outcome.bytes_freed += freed;
            if let Some(ghost) = ghost_candidate {
                // Materialised only after the chunk walk, and only into the
                // slot this very eviction just vacated: `insert_if_absent`
                // never overwrites a slot a concurrent writer has already
                // reoccupied, so admission control can never demote a live
                // real entry to a ghost.
                map.insert_if_absent(hash, key, ghost);
            }
        }
    }

    for (hash, key) in to_decay {
        decay_or_remove_ghost(map, hash, &key, decay_rate);
    }

    outcome
}

/// Decay a ghost's counter by `decay_rate`; if that reaches zero, remove it
/// and discharge its accounted overhead. Ghosts are carried entirely in the
/// 8-byte slot and charge no heap memory, so there is nothing further to
/// discharge beyond dropping the slot itself.
fn decay_or_remove_ghost<K, V>(map: &ConcurrentMap<K, V>, hash: u64, key: &K, decay_rate: f64)
where
    K: Key,
    V: Send + 'static,
{
    let Some((slot, _guard)) = map.find(hash, key) else {
        return;
    };
    if !slot.is_ghost() {
        return;
    }
    let decayed = ((slot.ghost_access_count() as f64) * decay_rate) as u32;
    if decayed == 0 {
        // Best-effort, like `penalize_ghost`: if a concurrent write already
        // promoted or replaced this slot, `remove_if`'s predicate rejects
        // and the replacement stands.
        map.remove_if(hash, key, |current| current.is_ghost());
        return;
    }
    let updated = slot.with_ghost_access_count(decayed);
    let merge = |old: TaggedSlot, new: TaggedSlot| if old.is_ghost() { new } else { old };
    map.upsert(hash, key.clone(), updated, Some(merge));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_evict_is_exclusive_at_threshold() {
        assert!(!should_evict(5.0, 5.0));
        assert!(should_evict(4.9, 5.0));
        assert!(!should_evict(5.1, 5.0));
    }

    #[test]
    fn promotion_requires_clearing_the_threshold() {
        let weak = TaggedSlot::ghost(GhostFormat::empty(), 1000, 1);
        let strong = TaggedSlot::ghost(GhostFormat::empty(), 1000, 500);
        let threshold = ghost_score_proxy(100, 50.0, 1000);
        assert!(!should_promote(weak, threshold, 50.0));
        assert!(should_promote(strong, threshold, 50.0));
    }

    #[test]
    fn sweep_chunk_evicts_low_score_entries_and_frees_their_charge() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        for k in 0..10u64 {
            let entry = RealEntry::new(k, k, 100, crate::entry::COUNT_SCALE, None);
            let ptr = Box::into_raw(Box::new(entry));
            map.upsert::<fn(TaggedSlot, TaggedSlot) -> TaggedSlot>(k, k, TaggedSlot::real(ptr), None);
        }
        let mut building = ScoreHistogram::new();
        // With a very high threshold, every visited entry should evict.
        let outcome =
            sweep_chunk::<u64, u64>(&map, 0..map.bucket_count(), 0.95, 100.0, f64::MAX, false, &mut building);
        assert_eq!(outcome.visited, 10);
        assert_eq!(outcome.evicted, 10);
        assert_eq!(outcome.bytes_freed, 1000);
    }

    #[test]
    fn sweep_chunk_installs_a_ghost_for_each_eviction_under_pressure() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        for k in 0..10u64 {
            let entry = RealEntry::new(k, k, 100, crate::entry::COUNT_SCALE, None);
            let ptr = Box::into_raw(Box::new(entry));
            map.upsert::<fn(TaggedSlot, TaggedSlot) -> TaggedSlot>(k, k, TaggedSlot::real(ptr), None);
        }
        let mut building = ScoreHistogram::new();
        let outcome =
            sweep_chunk::<u64, u64>(&map, 0..map.bucket_count(), 0.95, 100.0, f64::MAX, true, &mut building);
        assert_eq!(outcome.evicted, 10);
        for k in 0..10u64 {
            let (slot, _guard) = map.find(k, &k).expect("evicted real entry should leave a ghost behind");
            assert!(slot.is_ghost());
            assert!(slot.ghost_access_count() > 0);
        }
    }

    #[test]
    fn sweep_chunk_does_not_install_ghosts_when_over_budget() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        let entry = RealEntry::new(1u64, 1u64, 100, crate::entry::COUNT_SCALE, None);
        let ptr = Box::into_raw(Box::new(entry));
        map.upsert::<fn(TaggedSlot, TaggedSlot) -> TaggedSlot>(1, 1, TaggedSlot::real(ptr), None);
        let mut building = ScoreHistogram::new();
        let outcome = sweep_chunk::<u64, u64>(&map, 0..map.bucket_count(), 0.95, 100.0, f64::MAX, false, &mut building);
        assert_eq!(outcome.evicted, 1);
        assert!(map.find(1, &1u64).is_none());
    }

    #[test]
    fn sweep_chunk_decays_a_ghost_and_leaves_it_when_nonzero() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        let ghost = TaggedSlot::ghost(GhostFormat::empty(), 100, 40);
        map.upsert::<fn(TaggedSlot, TaggedSlot) -> TaggedSlot>(1, 1u64, ghost, None);
        let mut building = ScoreHistogram::new();
        sweep_chunk::<u64, u64>(&map, 0..map.bucket_count(), 0.5, 100.0, 1.0, false, &mut building);
        let (slot, _guard) = map.find(1, &1u64).expect("ghost should survive a non-zero decay");
        assert_eq!(slot.ghost_access_count(), 20);
    }

    #[test]
    fn sweep_chunk_removes_a_ghost_once_it_decays_to_zero() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        let ghost = TaggedSlot::ghost(GhostFormat::empty(), 100, 1);
        map.upsert::<fn(TaggedSlot, TaggedSlot) -> TaggedSlot>(1, 1u64, ghost, None);
        let mut building = ScoreHistogram::new();
        sweep_chunk::<u64, u64>(&map, 0..map.bucket_count(), 0.1, 100.0, 1.0, false, &mut building);
        assert!(map.find(1, &1u64).is_none());
    }

    #[test]
    fn penalize_ghost_shrinks_counter_in_place() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        let ghost = TaggedSlot::ghost(GhostFormat::empty(), 100, 40);
        map.upsert::<fn(TaggedSlot, TaggedSlot) -> TaggedSlot>(1, 1u64, ghost, None);
        penalize_ghost(&map, 1, &1u64);
        let (slot, _guard) = map.find(1, &1u64).unwrap();
        assert_eq!(slot.ghost_access_count(), 10);
    }

    #[test]
    fn penalize_ghost_is_a_no_op_when_key_absent() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        penalize_ghost(&map, 1, &1u64);
        assert!(map.find(1, &1u64).is_none());
    }

    #[test]
    fn sweep_chunk_spares_entries_above_threshold() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4, 1);
        let entry = RealEntry::new(1u64, 1u64, 100, crate::entry::COUNT_SCALE, None);
        let ptr = Box::into_raw(Box::new(entry));
        map.upsert::<fn(TaggedSlot, TaggedSlot) -> TaggedSlot>(1, 1, TaggedSlot::real(ptr), None);
        let mut building = ScoreHistogram::new();
        let outcome = sweep_chunk::<u64, u64>(&map, 0..map.bucket_count(), 1.0, 100.0, -1.0, false, &mut building);
        assert_eq!(outcome.visited, 1);
        assert_eq!(outcome.evicted, 0);
    }
}
