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

//! The 8-byte tagged slot: empty, a pointer to a heap-allocated real entry,
//! or an inline ghost. Everything fits in one `u64` so a single atomic
//! load/store/CAS on the slot is all that's ever needed to read or swap it.

use bitflags::bitflags;

bitflags! {
    /// Which precomputed serialisations a real entry (or the entry a ghost
    /// remembers) has cached.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GhostFormat: u8 {
        const BINARY_CACHED = 0b01;
        const JSON_CACHED   = 0b10;
    }
}

const TAG_GHOST: u64 = 1;
const FORMAT_SHIFT: u32 = 1;
const FORMAT_MASK: u64 = 0b11 << FORMAT_SHIFT;
const BYTES_SHIFT: u32 = 3;
const BYTES_BITS: u32 = 30;
const BYTES_MASK: u64 = ((1u64 << BYTES_BITS) - 1) << BYTES_SHIFT;
const COUNT_SHIFT: u32 = 33;
const COUNT_BITS: u32 = 31;
const COUNT_MASK: u64 = ((1u64 << COUNT_BITS) - 1) << COUNT_SHIFT;

/// Largest byte estimate a ghost can carry (30 bits): 1 GiB.
pub const GHOST_MAX_BYTES: u32 = (1u32 << BYTES_BITS) - 1;
/// Largest access counter a ghost can carry (31 bits).
pub const GHOST_MAX_COUNT: u32 = (1u32 << COUNT_BITS) - 1;

/// An 8-byte value stored per map slot: empty, a real-entry pointer, or a
/// ghost. Atomic loads/stores/CAS on the underlying `u64` are what give the
/// map its "never a torn slot" guarantee.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct TaggedSlot(u64);

impl TaggedSlot {
    pub const EMPTY: TaggedSlot = TaggedSlot(0);

    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_ghost(self) -> bool {
        self.0 & TAG_GHOST != 0
    }

    #[inline]
    pub fn is_real(self) -> bool {
        self.0 != 0 && self.0 & TAG_GHOST == 0
    }

    /// Build a real slot from an 8-byte-aligned heap pointer.
    ///
    /// # Panics
    /// Panics in debug builds if `ptr` is null or misaligned; both would
    /// violate the tagged-pointer invariant this type depends on.
    pub fn real<T>(ptr: *mut T) -> Self {
        let bits = ptr as u64;
        debug_assert!(bits != 0, "real slot must not wrap a null pointer");
        debug_assert!(bits & TAG_GHOST == 0, "real entries must be at least 2-byte aligned");
        Self(bits)
    }

    /// Recover the real-entry pointer, or `None` if this slot is empty or a
    /// ghost.
    pub fn as_real<T>(self) -> Option<*mut T> {
        if self.is_real() {
            Some(self.0 as *mut T)
        } else {
            None
        }
    }

    /// Build a ghost slot. `bytes_estimate` and `access_count` are clamped
    /// to their field widths rather than panicking, since both are derived
    /// from runtime measurements that may legitimately overflow (a huge
    /// entity, a very hot key).
    pub fn ghost(format: GhostFormat, bytes_estimate: u32, access_count: u32) -> Self {
        let bytes = bytes_estimate.min(GHOST_MAX_BYTES) as u64;
        let count = access_count.min(GHOST_MAX_COUNT) as u64;
        let bits = TAG_GHOST
            | ((format.bits() as u64) << FORMAT_SHIFT) & FORMAT_MASK
            | (bytes << BYTES_SHIFT) & BYTES_MASK
            | (count << COUNT_SHIFT) & COUNT_MASK;
        Self(bits)
    }

    pub fn ghost_format(self) -> GhostFormat {
        debug_assert!(self.is_ghost());
        GhostFormat::from_bits_truncate(((self.0 & FORMAT_MASK) >> FORMAT_SHIFT) as u8)
    }

    pub fn ghost_bytes_estimate(self) -> u32 {
        debug_assert!(self.is_ghost());
        ((self.0 & BYTES_MASK) >> BYTES_SHIFT) as u32
    }

    pub fn ghost_access_count(self) -> u32 {
        debug_assert!(self.is_ghost());
        ((self.0 & COUNT_MASK) >> COUNT_SHIFT) as u32
    }

    /// A copy of this ghost with its access counter replaced.
    pub fn with_ghost_access_count(self, access_count: u32) -> Self {
        debug_assert!(self.is_ghost());
        Self::ghost(self.ghost_format(), self.ghost_bytes_estimate(), access_count)
    }

    /// A copy of this ghost with its byte estimate and cached-format flags
    /// refreshed, keeping its access counter.
    pub fn with_ghost_estimate(self, format: GhostFormat, bytes_estimate: u32) -> Self {
        debug_assert!(self.is_ghost());
        Self::ghost(format, bytes_estimate, self.ghost_access_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_round_trips() {
        assert!(TaggedSlot::EMPTY.is_empty());
        assert!(!TaggedSlot::EMPTY.is_real());
        assert!(!TaggedSlot::EMPTY.is_ghost());
    }

    #[test]
    fn real_round_trips_through_pointer_bits() {
        let mut x = 7u64;
        let ptr: *mut u64 = &mut x;
        let slot = TaggedSlot::real(ptr);
        assert!(slot.is_real());
        assert!(!slot.is_ghost());
        assert_eq!(slot.as_real::<u64>(), Some(ptr));
    }

    #[test]
    fn ghost_round_trips_fields() {
        let slot = TaggedSlot::ghost(GhostFormat::BINARY_CACHED, 12345, 7);
        assert!(slot.is_ghost());
        assert_eq!(slot.ghost_format(), GhostFormat::BINARY_CACHED);
        assert_eq!(slot.ghost_bytes_estimate(), 12345);
        assert_eq!(slot.ghost_access_count(), 7);

        let bumped = slot.with_ghost_access_count(8);
        assert_eq!(bumped.ghost_access_count(), 8);
        assert_eq!(bumped.ghost_bytes_estimate(), 12345);
    }

    #[test]
    fn ghost_access_count_never_zero_invariant_is_representable() {
        // access_count > 0 is a map-level invariant, not enforced by the
        // bit layout itself; this just checks the field can carry the
        // smallest legal value.
        let slot = TaggedSlot::ghost(GhostFormat::empty(), 0, 1);
        assert_eq!(slot.ghost_access_count(), 1);
    }

    #[test]
    fn ghost_fields_saturate_rather_than_wrap() {
        let slot = TaggedSlot::ghost(GhostFormat::JSON_CACHED, u32::MAX, u32::MAX);
        assert_eq!(slot.ghost_bytes_estimate(), GHOST_MAX_BYTES);
        assert_eq!(slot.ghost_access_count(), GHOST_MAX_COUNT);
    }
}
