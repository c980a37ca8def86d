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

//! The L2 (remote key-value store) collaborator contract, plus an
//! in-memory test-only stand-in. Never a real network client: the wire
//! protocol and connection pool live in an excluded outer layer.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cachecore_common::error::OriginError;

#[async_trait]
pub trait Remote<K>: Send + Sync + 'static
where
    K: Send + Sync,
{
    async fn get_raw(&self, key: &K) -> Result<Option<Vec<u8>>, OriginError>;

    /// Like [`Remote::get_raw`] but refreshes the entry's remote TTL on a hit.
    async fn get_raw_ex(&self, key: &K, ttl: Duration) -> Result<Option<Vec<u8>>, OriginError>;

    async fn set_raw(&self, key: &K, bytes: Vec<u8>, ttl: Duration) -> Result<(), OriginError>;

    async fn invalidate(&self, key: &K) -> Result<(), OriginError>;
}

/// An in-memory stand-in for the remote store, with injectable latency and
/// failure modes. Used only in this crate's own tests.
pub struct TestRemote<K> {
    rows: Mutex<HashMap<K, Vec<u8>>>,
    latency: Duration,
    fail_next: std::sync::atomic::AtomicBool,
}

impl<K> TestRemote<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self { rows: Mutex::new(HashMap::new()), latency: Duration::ZERO, fail_next: false.into() }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn seed(&self, key: K, bytes: Vec<u8>) {
        self.rows.lock().unwrap().insert(key, bytes);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.rows.lock().unwrap().contains_key(key)
    }

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

impl<K> Default for TestRemote<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K> Remote<K> for TestRemote<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    async fn get_raw(&self, key: &K) -> Result<Option<Vec<u8>>, OriginError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.maybe_fail()?;
        Ok(self.rows.lock().unwrap().get(key).cloned())
    }

    async fn get_raw_ex(&self, key: &K, _ttl: Duration) -> Result<Option<Vec<u8>>, OriginError> {
        // A real store would bump the remote TTL here; the in-memory stand-in
        // has no expiry clock to refresh.
        self.get_raw(key).await
    }

    async fn set_raw(&self, key: &K, bytes: Vec<u8>, _ttl: Duration) -> Result<(), OriginError> {
        self.maybe_fail()?;
        self.rows.lock().unwrap().insert(key.clone(), bytes);
        Ok(())
    }

    async fn invalidate(&self, key: &K) -> Result<(), OriginError> {
        self.maybe_fail()?;
        self.rows.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let remote: TestRemote<String> = TestRemote::new();
        remote.set_raw(&"a".to_string(), b"hello".to_vec(), Duration::from_secs(60)).await.unwrap();
        let got = remote.get_raw(&"a".to_string()).await.unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let remote: TestRemote<String> = TestRemote::new();
        remote.seed("a".to_string(), b"hello".to_vec());
        remote.invalidate(&"a".to_string()).await.unwrap();
        assert_eq!(remote.get_raw(&"a".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn fail_next_call_fails_exactly_once() {
        let remote: TestRemote<String> = TestRemote::new();
        remote.fail_next_call();
        assert!(remote.get_raw(&"a".to_string()).await.is_err());
        assert!(remote.get_raw(&"a".to_string()).await.is_ok());
    }
}
