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

//! Cache-wide counters, all relaxed: useful as a rough operator dashboard,
//! never consulted on a correctness path.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub hit: AtomicUsize,
    pub miss: AtomicUsize,
    pub insert: AtomicUsize,
    pub remove: AtomicUsize,
    pub evict: AtomicUsize,
    pub ghost_insert: AtomicUsize,
    pub ghost_hit: AtomicUsize,
    pub promote: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert(&self) {
        self.insert.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remove(&self) {
        self.remove.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evict(&self, count: usize) {
        self.evict.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_ghost_insert(&self) {
        self.ghost_insert.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ghost_hit(&self) {
        self.ghost_hit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promote(&self) {
        self.promote.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hit: self.hit.load(Ordering::Relaxed),
            miss: self.miss.load(Ordering::Relaxed),
            insert: self.insert.load(Ordering::Relaxed),
            remove: self.remove.load(Ordering::Relaxed),
            evict: self.evict.load(Ordering::Relaxed),
            ghost_insert: self.ghost_insert.load(Ordering::Relaxed),
            ghost_hit: self.ghost_hit.load(Ordering::Relaxed),
            promote: self.promote.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time, non-atomic copy of [`Metrics`] suitable for logging or
/// exposing through an admin endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub hit: usize,
    pub miss: usize,
    pub insert: usize,
    pub remove: usize,
    pub evict: usize,
    pub ghost_insert: usize,
    pub ghost_hit: usize,
    pub promote: usize,
}

impl MetricsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hit + self.miss;
        if total == 0 {
            0.0
        } else {
            self.hit as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = Metrics::new();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        let snap = metrics.snapshot();
        assert_eq!(snap.hit, 2);
        assert_eq!(snap.miss, 1);
        assert!((snap.hit_ratio() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn hit_ratio_is_zero_with_no_traffic() {
        assert_eq!(MetricsSnapshot::default().hit_ratio(), 0.0);
    }
}
