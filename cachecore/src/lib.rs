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

//! The tiered read-through/write-through cache façade: an L1 in-memory
//! engine composed with L2 (remote) and L3 (origin) collaborators.

pub mod entity;
pub mod layer;
pub mod origin;
pub mod remote;

pub mod prelude {
    pub use crate::entity::Entity;
    pub use crate::layer::{CacheLayer, L2Format, LayerOptions};
    pub use crate::origin::{Origin, Outcome, TestOrigin};
    pub use crate::remote::{Remote, TestRemote};
    pub use cachecore_common::error::{CacheError, OriginError, Result};
    pub use cachecore_memory::config::{CacheOptions, GlobalPolicyConfig, UpdateStrategy};
}
