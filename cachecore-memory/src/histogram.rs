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

//! The 128-bucket log-scale score histogram and eviction threshold
//! derivation.

/// Number of log-scale buckets.
pub const BUCKET_COUNT: usize = 128;

/// Score range covered by the histogram: roughly `[2^LOG2_MIN, 2^LOG2_MAX]`.
const LOG2_MIN: f64 = -10.0;
const LOG2_MAX: f64 = 23.0;
const LOG2_SPAN: f64 = LOG2_MAX - LOG2_MIN;

#[inline]
fn bucket_of(score: f64) -> usize {
    if score <= 0.0 {
        return 0;
    }
    // A fast approximate log2 would bit-twiddle the IEEE-754 representation
    // directly; `f64::log2` is used here for clarity and is not on any
    // wait-free path (it only runs during sweep, never on a reader).
    let log2 = score.log2().clamp(LOG2_MIN, LOG2_MAX);
    let frac = (log2 - LOG2_MIN) / LOG2_SPAN;
    ((frac * BUCKET_COUNT as f64) as usize).min(BUCKET_COUNT - 1)
}

#[inline]
fn bucket_upper_bound(bucket: usize) -> f64 {
    let frac = (bucket + 1) as f64 / BUCKET_COUNT as f64;
    let log2 = LOG2_MIN + frac * LOG2_SPAN;
    2f64.powf(log2)
}

/// A histogram of `(score, bytes)` observations, in bytes-per-bucket form.
#[derive(Clone)]
pub struct ScoreHistogram {
    buckets: [f64; BUCKET_COUNT],
}

impl Default for ScoreHistogram {
    fn default() -> Self {
        Self { buckets: [0.0; BUCKET_COUNT] }
    }
}

impl ScoreHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.buckets = [0.0; BUCKET_COUNT];
    }

    /// Record one visited real entry during a sweep.
    pub fn record(&mut self, score: f64, bytes: usize) {
        self.buckets[bucket_of(score)] += bytes as f64;
    }

    /// Merge `building` into `self` (the persistent histogram) with an EMA
    /// coefficient `alpha`: `persistent = alpha * building + (1 - alpha) *
    /// persistent`.
    pub fn merge_ema(&mut self, building: &ScoreHistogram, alpha: f64) {
        for (p, b) in self.buckets.iter_mut().zip(building.buckets.iter()) {
            *p = alpha * b + (1.0 - alpha) * *p;
        }
    }

    /// Walk low-to-high, returning the score threshold at which cumulative
    /// bucket bytes first reach `bytes_to_free`. Returns the top of the
    /// score range if the target is never reached.
    pub fn threshold_for(&self, bytes_to_free: f64) -> f64 {
        if bytes_to_free <= 0.0 {
            return 0.0;
        }
        let mut cumulative = 0.0;
        for (i, bytes) in self.buckets.iter().enumerate() {
            cumulative += bytes;
            if cumulative >= bytes_to_free {
                return bucket_upper_bound(i);
            }
        }
        bucket_upper_bound(BUCKET_COUNT - 1)
    }
}

/// Piecewise-quadratic target fraction of `MAX_MEMORY` to free, as a
/// function of current usage (`total_memory / MAX_MEMORY`). Continuous and
/// non-decreasing over `[0, 1]`.
pub fn target_pct(usage: f64) -> f64 {
    if usage < 0.50 {
        0.0
    } else if usage < 0.80 {
        let t = (usage - 0.50) / 0.30;
        0.05 * t * t
    } else {
        let t = ((usage.min(1.0)) - 0.80) / 0.20;
        0.05 + 0.20 * t * t
    }
}
