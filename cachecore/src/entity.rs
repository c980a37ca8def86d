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

//! The entity contract: what the façade requires of a payload type before
//! it can be cached.

/// A cacheable row. `memory_usage` must be monotone non-decreasing across
/// lazy buffer creations (`to_binary`/`to_json` may grow it, never shrink
/// it) since the accounting counter is charged incrementally on growth.
pub trait Entity: Clone + Send + Sync + 'static {
    fn memory_usage(&self) -> usize;

    /// A cached binary serialisation, built and memoised on first use.
    /// Returns `None` for entities that never declare binary support.
    fn to_binary(&self) -> Option<Vec<u8>> {
        None
    }

    /// A cached JSON serialisation, built and memoised on first use.
    fn to_json(&self) -> Option<String> {
        None
    }

    fn has_binary_serialization(&self) -> bool {
        false
    }

    /// Reconstruct an entity from a buffer previously produced by
    /// [`Entity::to_binary`]. `None` if the entity type never declares
    /// binary support, or the buffer is malformed.
    fn from_binary(_bytes: &[u8]) -> Option<Self>
    where
        Self: Sized,
    {
        None
    }

    /// Reconstruct an entity from a buffer previously produced by
    /// [`Entity::to_json`].
    fn from_json(_text: &str) -> Option<Self>
    where
        Self: Sized,
    {
        None
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Entity;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Widget {
        pub id: i64,
        pub label: String,
    }

    impl Entity for Widget {
        fn memory_usage(&self) -> usize {
            std::mem::size_of::<i64>() + self.label.len()
        }

        fn to_json(&self) -> Option<String> {
            Some(format!("{{\"id\":{},\"label\":\"{}\"}}", self.id, self.label))
        }

        fn from_json(text: &str) -> Option<Self> {
            // Hand-rolled for this fixed-shape test fixture; a real entity
            // would reach for a serde derive instead.
            let id_start = text.find("\"id\":")? + 5;
            let id_end = text[id_start..].find(',')? + id_start;
            let id: i64 = text[id_start..id_end].parse().ok()?;
            let label_start = text.rfind("\"label\":\"")? + 9;
            let label_end = text[label_start..].find('"')? + label_start;
            let label = text[label_start..label_end].to_string();
            Some(Widget { id, label })
        }
    }
}
