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

use thiserror::Error;

/// Errors raised by an origin (L3) or remote (L2) collaborator.
///
/// The façade never caches on either variant: readers get an empty guarded
/// view, writers get `success = false`.
#[derive(Debug, Error, Clone, Copy)]
pub enum OriginError {
    #[error("origin call failed transiently")]
    Transient,
    #[error("origin call failed permanently")]
    Permanent,
}

/// Errors surfaced by the cache layer façade.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("key not found in L1, L2 or L3")]
    NotFound,

    #[error("origin or remote call failed transiently")]
    OriginTransient,

    #[error("origin or remote call failed permanently")]
    OriginPermanent,

    #[error("attempted to write through a read-only cache")]
    ReadOnlyViolation,

    #[error("concurrent map could not grow to accommodate a new key")]
    SlotExhausted,
}

impl From<OriginError> for CacheError {
    fn from(err: OriginError) -> Self {
        match err {
            OriginError::Transient => CacheError::OriginTransient,
            OriginError::Permanent => CacheError::OriginPermanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
