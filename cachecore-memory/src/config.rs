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

//! Configuration surface: one process-wide policy shared by every named
//! cache, plus per-cache construction options.

use cachecore_common::code::HashBuilder;

/// How a write that coalesces with an in-flight fetch-and-admit for the
/// same key is reconciled once both complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// The write always wins; the fetch result is discarded if it lands
    /// after the write's generation bump.
    WriteWins,
    /// Whichever of the write or the fetch result lands last wins.
    LastWriterWins,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self::WriteWins
    }
}

/// Knobs shared by every cache in the process: the decay rate applied on
/// each sweep visit, the EMA smoothing coefficient for the score histogram,
/// and the piecewise target-fraction curve's segment boundaries are fixed
/// (not configurable) to keep the eviction behaviour predictable across
/// caches; only the rate and coalescing strategy vary per deployment.
#[derive(Debug, Clone, Copy)]
pub struct GlobalPolicyConfig {
    /// Multiplicative decay applied to an entry's scaled access count each
    /// time a sweep visits it. Must be in `(0, 1]`; `1.0` disables decay.
    pub decay_rate: f64,
    /// EMA smoothing coefficient blending a sweep's freshly built histogram
    /// into the persistent one used for threshold derivation. Must be in
    /// `(0, 1]`.
    pub histogram_ema_alpha: f64,
    /// How many bucket-chunks a full sweep pass is divided into.
    pub chunk_count_log2: u32,
    pub update_strategy: UpdateStrategy,
}

impl Default for GlobalPolicyConfig {
    fn default() -> Self {
        Self {
            decay_rate: 0.95,
            histogram_ema_alpha: 0.3,
            chunk_count_log2: 4,
            update_strategy: UpdateStrategy::default(),
        }
    }
}

/// Construction options for a single named cache.
#[derive(Clone)]
pub struct CacheOptions<S = HashBuilder> {
    pub name: String,
    /// `log2` of the fixed bucket-array size. The map never resizes.
    pub bucket_count_log2: u32,
    /// Memory budget in bytes; `0` disables the GDSF eviction policy for
    /// this cache (entries are kept until explicitly removed).
    pub max_memory: u64,
    /// Number of striped memory-accounting counters; rounded up to a power
    /// of two and capped at 64.
    pub accounting_slots: usize,
    /// Default TTL applied to entries that don't specify their own, or
    /// `None` for no default expiration.
    pub default_ttl_ns: Option<i64>,
    pub hash_builder: S,
}

impl Default for CacheOptions<HashBuilder> {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
            bucket_count_log2: 16,
            max_memory: 0,
            accounting_slots: 16,
            default_ttl_ns: None,
            hash_builder: HashBuilder::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_has_decay_enabled_and_write_wins() {
        let policy = GlobalPolicyConfig::default();
        assert!(policy.decay_rate < 1.0);
        assert_eq!(policy.update_strategy, UpdateStrategy::WriteWins);
    }

    #[test]
    fn default_options_disable_memory_policy() {
        let opts = CacheOptions::default();
        assert_eq!(opts.max_memory, 0);
    }
}
