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

//! Per-entry metadata, scoring, and the real-entry allocation.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};

/// Access counts are scaled so that repeated `count *= decay_rate`
/// multiplications (applied in integer form, see [`Metadata::decay`])
/// retain precision.
pub const COUNT_SCALE: u32 = 1024;

/// Sentinel stored in `expiration_ns` meaning "no TTL".
const NO_EXPIRATION: i64 = i64::MIN;

/// The ghost flag occupies the top bit of the 32-bit scaled counter,
/// mirroring the ghost's own inline counter layout. Real entries never set
/// it.
const GHOST_FLAG: u32 = 1 << 31;
const COUNT_MASK: u32 = GHOST_FLAG - 1;

/// Compact, atomically-updated per-entry state shared by real entries.
/// (Ghosts carry their own counter inline in the slot and do not use this
/// type.)
#[derive(Debug)]
pub struct Metadata {
    access_count: AtomicU32,
    expiration_ns: AtomicI64,
}

impl Metadata {
    /// A freshly admitted real entry always starts with a nonzero scaled
    /// count: `access_count` is never zero for a live entry at admission.
    pub fn new(initial_count: u32, ttl_ns: Option<i64>) -> Self {
        Self {
            access_count: AtomicU32::new(initial_count.max(1) & COUNT_MASK),
            expiration_ns: AtomicI64::new(ttl_ns.unwrap_or(NO_EXPIRATION)),
        }
    }

    /// Single relaxed add on the read path: no decay happens here.
    #[inline]
    pub fn record_access(&self) {
        self.access_count.fetch_add(COUNT_SCALE, Ordering::Relaxed);
    }

    /// Decay the scaled count in place during a sweep visit, returning the
    /// post-decay value used to compute this visit's score.
    pub fn decay(&self, decay_rate: f64) -> u32 {
        let mut current = self.access_count.load(Ordering::Relaxed);
        loop {
            let decayed = ((current as f64) * decay_rate) as u32;
            match self.access_count.compare_exchange_weak(
                current,
                decayed,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return decayed,
                Err(observed) => current = observed,
            }
        }
    }

    /// Apply a multiplicative penalty to the counter, e.g. after a
    /// stale-write race forces a conservative re-score.
    pub fn apply_penalty(&self, penalty: f64) {
        let mut current = self.access_count.load(Ordering::Relaxed);
        loop {
            let penalized = ((current as f64) * penalty) as u32;
            match self.access_count.compare_exchange_weak(
                current,
                penalized,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn scaled_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed) & COUNT_MASK
    }

    pub fn is_expired(&self, now_ns: i64) -> bool {
        let exp = self.expiration_ns.load(Ordering::Relaxed);
        exp != NO_EXPIRATION && now_ns >= exp
    }

    pub fn has_ttl(&self) -> bool {
        self.expiration_ns.load(Ordering::Relaxed) != NO_EXPIRATION
    }
}

/// `score = (decayed_count * avg_fetch_cost_µs) / max(memory_bytes, 1)`.
#[inline]
pub fn gdsf_score(decayed_count: u32, avg_fetch_cost_us: f64, memory_bytes: usize) -> f64 {
    (decayed_count as f64) * avg_fetch_cost_us / (memory_bytes.max(1) as f64)
}

/// A ghost's score proxy considers the same formula but uses its inline
/// byte estimate rather than a charged `RealEntry`'s `memory_usage()`.
#[inline]
pub fn ghost_score_proxy(access_count: u32, avg_fetch_cost_us: f64, bytes_estimate: u32) -> f64 {
    gdsf_score(access_count, avg_fetch_cost_us, bytes_estimate.max(1) as usize)
}

/// Header + payload for a real entry. Allocated in an epoch-aware pool and
/// retired through it; `charge` tracks the byte count most recently handed
/// to the memory accounting counter so that later lazy-buffer growth can be
/// charged incrementally.
pub struct RealEntry<K, V> {
    pub metadata: Metadata,
    pub key: K,
    pub value: V,
    charge: AtomicUsize,
}

impl<K, V> RealEntry<K, V> {
    pub fn new(key: K, value: V, charge: usize, initial_count: u32, ttl_ns: Option<i64>) -> Self {
        Self {
            metadata: Metadata::new(initial_count, ttl_ns),
            key,
            value,
            charge: AtomicUsize::new(charge),
        }
    }

    pub fn charge(&self) -> usize {
        self.charge.load(Ordering::Relaxed)
    }

    /// Record a larger charge after a lazy buffer (e.g. a cached JSON or
    /// binary serialisation) grows the entity's `memory_usage()`. Returns
    /// the delta that the caller must additionally charge to the global
    /// accounting counter.
    pub fn grow_charge(&self, new_total: usize) -> usize {
        let previous = self.charge.swap(new_total, Ordering::Relaxed);
        new_total.saturating_sub(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_metadata_has_nonzero_count() {
        let meta = Metadata::new(0, None);
        assert!(meta.scaled_count() > 0);
    }

    #[test]
    fn decay_reduces_count_monotonically_for_rate_below_one() {
        let meta = Metadata::new(COUNT_SCALE, None);
        let first = meta.decay(0.95);
        let second = meta.decay(0.95);
        assert!(second <= first);
    }

    #[test]
    fn decay_rate_one_is_a_no_op() {
        let meta = Metadata::new(COUNT_SCALE, None);
        let before = meta.scaled_count();
        let after = meta.decay(1.0);
        assert_eq!(before, after);
    }

    #[test]
    fn ttl_expiry_is_detected() {
        let meta = Metadata::new(COUNT_SCALE, Some(1_000));
        assert!(meta.has_ttl());
        assert!(!meta.is_expired(999));
        assert!(meta.is_expired(1_000));
    }

    #[test]
    fn no_ttl_never_expires() {
        let meta = Metadata::new(COUNT_SCALE, None);
        assert!(!meta.has_ttl());
        assert!(!meta.is_expired(i64::MAX));
    }

    #[test]
    fn score_scales_inversely_with_memory() {
        let cheap = gdsf_score(COUNT_SCALE, 100.0, 10);
        let expensive = gdsf_score(COUNT_SCALE, 100.0, 10_000);
        assert!(cheap > expensive);
    }

    #[test]
    fn grow_charge_reports_only_the_delta() {
        let entry = RealEntry::new("k", "v", 100, COUNT_SCALE, None);
        assert_eq!(entry.grow_charge(150), 50);
        assert_eq!(entry.charge(), 150);
        // Shrinking (should not happen per the monotone contract, but must
        // not underflow if it somehow did).
        assert_eq!(entry.grow_charge(120), 0);
    }
}
