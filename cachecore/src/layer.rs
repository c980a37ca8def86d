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

//! [`CacheLayer`] composes the L1 engine with the L2 (remote) and L3
//! (origin) collaborators into the five-operation application surface.

use std::sync::Arc;
use std::time::Duration;

use cachecore_common::code::Key;
use cachecore_common::error::{CacheError, Result};
use cachecore_memory::cache::{AdmitOutcome, Cache};
use cachecore_memory::config::{CacheOptions, GlobalPolicyConfig};

use crate::entity::Entity;
use crate::origin::Origin;
use crate::remote::Remote;

/// Which buffer an entity serialises into before it crosses to L2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Format {
    Binary,
    Json,
}

#[derive(Clone)]
pub struct LayerOptions {
    pub read_only: bool,
    pub l2_ttl: Duration,
    pub l2_format: L2Format,
}

impl Default for LayerOptions {
    fn default() -> Self {
        Self { read_only: false, l2_ttl: Duration::from_secs(300), l2_format: L2Format::Json }
    }
}

fn encode<V: Entity>(entity: &V, format: L2Format) -> Option<Vec<u8>> {
    match format {
        L2Format::Binary if entity.has_binary_serialization() => entity.to_binary(),
        L2Format::Binary => entity.to_json().map(String::into_bytes),
        L2Format::Json => entity.to_json().map(String::into_bytes),
    }
}

fn decode<V: Entity>(bytes: &[u8], format: L2Format) -> Option<V> {
    match format {
        L2Format::Binary => V::from_binary(bytes).or_else(|| std::str::from_utf8(bytes).ok().and_then(V::from_json)),
        L2Format::Json => std::str::from_utf8(bytes).ok().and_then(V::from_json),
    }
}

/// The read-through/write-through façade the application talks to. `K` is
/// the key type, `V` the cached entity type.
pub struct CacheLayer<K, V>
where
    K: Key,
    V: Entity,
{
    l1: Arc<Cache<K, V>>,
    origin: Arc<dyn Origin<K, V>>,
    remote: Option<Arc<dyn Remote<K>>>,
    options: LayerOptions,
}

impl<K, V> CacheLayer<K, V>
where
    K: Key,
    V: Entity,
{
    pub fn new(
        l1_options: CacheOptions,
        policy: GlobalPolicyConfig,
        origin: Arc<dyn Origin<K, V>>,
        remote: Option<Arc<dyn Remote<K>>>,
        options: LayerOptions,
    ) -> Self {
        Self { l1: Cache::new(l1_options, policy), origin, remote, options }
    }

    pub fn l1(&self) -> &Arc<Cache<K, V>> {
        &self.l1
    }

    fn require_writable(&self) -> Result<()> {
        if self.options.read_only {
            Err(CacheError::ReadOnlyViolation)
        } else {
            Ok(())
        }
    }

    /// Read-through find: an L1 hit returns immediately without suspending;
    /// an L1 miss consults L2 then L3, admitting or ghosting the result
    /// under the same rules as the underlying engine's fetch-and-admit.
    pub async fn find(&self, key: &K) -> Result<V> {
        let origin = Arc::clone(&self.origin);
        let remote = self.remote.clone();
        let l2_ttl = self.options.l2_ttl;
        let l2_format = self.options.l2_format;
        let fetch_key = key.clone();

        let outcome = self
            .l1
            .fetch_and_admit(key.clone(), move || async move {
                if let Some(remote) = remote.as_ref() {
                    if let Ok(Some(bytes)) = remote.get_raw_ex(&fetch_key, l2_ttl).await {
                        if let Some(entity) = decode::<V>(&bytes, l2_format) {
                            let charge = entity.memory_usage();
                            return Ok((entity, charge));
                        }
                    }
                }
                let entity = origin.fetch(&fetch_key).await?.ok_or(CacheError::NotFound)?;
                if let Some(remote) = remote.as_ref() {
                    if let Some(bytes) = encode(&entity, l2_format) {
                        let _ = remote.set_raw(&fetch_key, bytes, l2_ttl).await;
                    }
                }
                let charge = entity.memory_usage();
                Ok((entity, charge))
            })
            .await;

        match outcome {
            Ok(entry) => Ok((*entry).clone()),
            Err(AdmitOutcome::FetchFailed(err)) => {
                tracing::warn!(cache = self.l1.name(), kind = ?err, "fetch-and-admit failed");
                Err(err)
            }
            Err(AdmitOutcome::NotAdmitted(value)) => Ok(value),
        }
    }

    /// Like [`CacheLayer::find`] but returns the entity's serialised form,
    /// computing and memoising it on the L1 entry the first time it's
    /// requested. The lazy buffer's size is charged to the accounting
    /// counter incrementally, never replacing the entity's own charge.
    pub async fn find_as(&self, key: &K) -> Result<Vec<u8>> {
        let entity = self.find(key).await?;
        let format = self.options.l2_format;
        if let Some(entry) = self.l1.find(key) {
            if let Some(bytes) = encode(&*entry, format) {
                let delta = entry.grow_charge(entry.charge() + bytes.len());
                if delta > 0 {
                    self.l1.charge_delta(delta as i64);
                }
                return Ok(bytes);
            }
        }
        encode(&entity, format).ok_or(CacheError::NotFound)
    }

    /// Write-through upsert: writes the origin first, then admits the
    /// entity to L1. A coalesced write (another in-flight identical write
    /// already landed) skips the L1 mutation to avoid double-eviction.
    pub async fn upsert(&self, key: K, entity: V) -> Result<V> {
        self.require_writable()?;
        let outcome = self
            .origin
            .update(&key, &entity)
            .await
            .inspect_err(|err| tracing::warn!(cache = self.l1.name(), kind = ?err, "origin update failed"))?;
        if outcome.coalesced {
            return self.l1.find(&key).map(|e| (*e).clone()).ok_or(CacheError::NotFound);
        }
        self.l1.penalize_ghost(&key);
        let charge = entity.memory_usage();
        let entry = self.l1.upsert(key, entity, charge, None);
        Ok((*entry).clone())
    }

    /// Write-through partial update: writes the origin, penalizes any
    /// ghost recorded for the key (frequently mutated keys earn admission
    /// more slowly), evicts the now-stale L1 slot, then re-admits through
    /// the normal read-through path.
    pub async fn patch<F>(&self, key: &K, patch_fn: F) -> Result<V>
    where
        F: Fn(&mut V) + Sync,
    {
        self.require_writable()?;
        let outcome = self
            .origin
            .patch(key, &patch_fn)
            .await
            .inspect_err(|err| tracing::warn!(cache = self.l1.name(), kind = ?err, "origin patch failed"))?;
        if outcome.affected == 0 {
            return Err(CacheError::NotFound);
        }
        if outcome.coalesced {
            return self.l1.find(key).map(|e| (*e).clone()).ok_or(CacheError::NotFound);
        }
        self.l1.penalize_ghost(key);
        self.l1.erase(key);
        self.find(key).await
    }

    /// Write-through delete: writes the origin, then invalidates L1.
    /// Returns the number of rows the origin reports affected.
    pub async fn erase(&self, key: &K) -> Result<u64> {
        self.require_writable()?;
        let outcome = self
            .origin
            .delete(key)
            .await
            .inspect_err(|err| tracing::warn!(cache = self.l1.name(), kind = ?err, "origin delete failed"))?;
        if outcome.affected > 0 {
            self.l1.invalidate(key);
        }
        Ok(outcome.affected)
    }

    /// Synchronously remove `key` from L1; asynchronously invalidate L2.
    pub async fn invalidate(&self, key: &K) {
        self.l1.invalidate(key);
        if let Some(remote) = &self.remote {
            let _ = remote.invalidate(key).await;
        }
    }
}
