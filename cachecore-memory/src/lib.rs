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

//! The L1 in-memory engine: epoch-reclaimed lock-free map, GDSF eviction,
//! and ghost-entry admission.

pub mod accounting;
pub mod cache;
pub mod config;
pub mod entry;
pub mod epoch;
pub mod eviction;
pub mod generation;
pub mod histogram;
pub mod map;
pub mod metrics;
pub mod prelude;
pub mod registry;
pub mod slot;

pub use cachecore_common::code::{HashBuilder, Key, Value};
pub use cachecore_common::error::{CacheError, OriginError, Result};
