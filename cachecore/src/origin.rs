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

//! The L3 (origin / database) collaborator contract, plus an in-memory
//! test-only stand-in. Never a real SQL client: query generation and the
//! driver live in an excluded outer layer.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use async_trait::async_trait;
use cachecore_common::error::OriginError;

/// The result of a write against the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub affected: u64,
    /// `true` if this call rode on another in-flight identical write; the
    /// façade must then skip its own L1 mutation side effects.
    pub coalesced: bool,
}

impl Outcome {
    pub fn single() -> Self {
        Self { affected: 1, coalesced: false }
    }

    pub fn none() -> Self {
        Self { affected: 0, coalesced: false }
    }
}

#[async_trait]
pub trait Origin<K, E>: Send + Sync + 'static
where
    K: Send + Sync,
    E: Send + Sync,
{
    async fn fetch(&self, key: &K) -> Result<Option<E>, OriginError>;
    async fn insert(&self, key: &K, entity: &E) -> Result<Outcome, OriginError>;
    async fn update(&self, key: &K, entity: &E) -> Result<Outcome, OriginError>;
    async fn patch(&self, key: &K, patch: &(dyn for<'r> Fn(&'r mut E) + Sync)) -> Result<Outcome, OriginError>;
    async fn delete(&self, key: &K) -> Result<Outcome, OriginError>;
}

/// An in-memory stand-in for the origin, with injectable latency and
/// failure modes. Used only in this crate's own tests.
pub struct TestOrigin<K, E> {
    rows: Mutex<HashMap<K, E>>,
    latency: std::time::Duration,
    fail_next: std::sync::atomic::AtomicBool,
}

impl<K, E> TestOrigin<K, E>
where
    K: Eq + Hash + Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self { rows: Mutex::new(HashMap::new()), latency: std::time::Duration::ZERO, fail_next: false.into() }
    }

    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn seed(&self, key: K, entity: E) {
        self.rows.lock().unwrap().insert(key, entity);
    }

    /// The next origin call will fail transiently, then revert to normal.
    pub fn fail_next_call(&self) {
        self.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<(), OriginError> {
        if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Err(OriginError::Transient);
        }
        Ok(())
    }
}

impl<K, E> Default for TestOrigin<K, E>
where
    K: Eq + Hash + Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, E> Origin<K, E> for TestOrigin<K, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    async fn fetch(&self, key: &K) -> Result<Option<E>, OriginError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.maybe_fail()?;
        Ok(self.rows.lock().unwrap().get(key).cloned())
    }

    async fn insert(&self, key: &K, entity: &E) -> Result<Outcome, OriginError> {
        self.maybe_fail()?;
        self.rows.lock().unwrap().insert(key.clone(), entity.clone());
        Ok(Outcome::single())
    }

    async fn update(&self, key: &K, entity: &E) -> Result<Outcome, OriginError> {
        self.insert(key, entity).await
    }

    async fn patch(&self, key: &K, patch: &(dyn for<'r> Fn(&'r mut E) + Sync)) -> Result<Outcome, OriginError> {
        self.maybe_fail()?;
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(key) {
            Some(entity) => {
                patch(entity);
                Ok(Outcome::single())
            }
            None => Ok(Outcome::none()),
        }
    }

    async fn delete(&self, key: &K) -> Result<Outcome, OriginError> {
        self.maybe_fail()?;
        let removed = self.rows.lock().unwrap().remove(key).is_some();
        Ok(if removed { Outcome::single() } else { Outcome::none() })
    }
}
