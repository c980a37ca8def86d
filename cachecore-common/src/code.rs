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

use std::hash::Hash;

/// Bound satisfied by every type usable as a cache key.
///
/// Keys are hashed with [`ahash`], which already provides avalanche-quality
/// finalisation for both integer and byte-sequence input, so no bespoke
/// mixing step is implemented here.
pub trait Key: Hash + Eq + Clone + Send + Sync + 'static {}

impl<T> Key for T where T: Hash + Eq + Clone + Send + Sync + 'static {}

/// Bound satisfied by every type usable as a cached value.
pub trait Value: Send + Sync + 'static {}

impl<T> Value for T where T: Send + Sync + 'static {}

/// The hash builder used throughout cachecore. A type alias rather than a
/// bound so every crate in the workspace agrees on one finalisation scheme.
pub type HashBuilder = ahash::RandomState;
