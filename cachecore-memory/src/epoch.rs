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

//! Epoch-based safe memory reclamation.
//!
//! Built directly on `crossbeam-epoch`: every [`EpochPool`] owns its own
//! [`Collector`], so the real-entry pool and the transient pool used by
//! fetch-and-admit never share a reclamation domain with each other or with
//! the map's own node list.

use std::cell::RefCell;

use crossbeam_epoch::{Collector, Guard, LocalHandle};

thread_local! {
    /// One registered handle per `(thread, collector)` pair. A thread that
    /// touches several caches registers with several collectors; the vector
    /// stays tiny in practice (one entry per distinct pool the thread has
    /// pinned).
    static HANDLES: RefCell<Vec<(Collector, LocalHandle)>> = const { RefCell::new(Vec::new()) };
}

/// A reclamation domain for one class of retired object (real entries, or
/// transient fetch results). Cheap to construct; intended to be a
/// process-wide static, matching the "static singletons" design note.
#[derive(Clone)]
pub struct EpochPool {
    collector: Collector,
}

impl Default for EpochPool {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochPool {
    pub fn new() -> Self {
        Self { collector: Collector::new() }
    }

    /// Pin the calling thread to this pool's epoch. The returned guard must
    /// be acquired and dropped on the same thread: `crossbeam_epoch::Guard`
    /// is tied to the pinning thread's `Local` registration, and unpinning
    /// it from a different thread corrupts that thread's pin count.
    pub fn pin(&self) -> EpochGuard {
        HANDLES.with(|handles| {
            let mut handles = handles.borrow_mut();
            if let Some((_, handle)) = handles.iter().find(|(c, _)| *c == self.collector) {
                return EpochGuard(handle.pin());
            }
            let handle = self.collector.register();
            let guard = handle.pin();
            handles.push((self.collector.clone(), handle));
            EpochGuard(guard)
        })
    }
}

/// A cheap ticket pinning the global reclamation epoch for this pool. While
/// at least one guard acquired at or before epoch E is live, no object
/// retired at epoch E may be destroyed.
///
/// Not `Send`: it wraps `crossbeam_epoch::Guard`, which is tied to the
/// pinning thread's registration and must be unpinned on that same thread.
/// A caller that needs a value to outlive a pin across an `.await` must
/// clone the value out of the guarded entry before suspending, rather than
/// holding the guard itself across the suspension point.
pub struct EpochGuard(Guard);

impl EpochGuard {
    /// Schedule `ptr` for destruction once no guard that could have observed
    /// it remains pinned. `retire` is O(1) amortised and never blocks.
    ///
    /// # Safety
    /// `ptr` must have been allocated with `Box::new` (or equivalent) and
    /// must not be referenced by any other live path once retired.
    pub unsafe fn retire<T: Send + 'static>(&self, ptr: *mut T) {
        self.0.defer_unchecked(move || {
            drop(Box::from_raw(ptr));
        });
    }

    /// Run any reclamation work whose epoch has already passed. Called
    /// opportunistically from sweep; never required for correctness.
    pub fn flush(&self) {
        self.0.flush();
    }

    pub(crate) fn inner(&self) -> &Guard {
        &self.0
    }
}
