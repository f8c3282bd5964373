// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Opaque shared memory addresses.
//!
//! An [`Address`] never carries a host pointer. It is a word sized handle that packs
//! the segment slot, the slot generation and a byte offset:
//!
//! ```text
//! | 63 .. 48 | 47 .. 40   | 39 .. 0     |
//! | slot + 1 | generation | byte offset |
//! ```
//!
//! Slot `0` is reserved, so the raw value `0` is never a valid address.

use std::fmt;

/// Number of bits used for the byte offset inside a segment
const OFFSET_BITS: u32 = 40;

/// Number of bits used for the slot generation
const GENERATION_BITS: u32 = 8;

/// Number of bits to shift to reach the slot field
const SLOT_SHIFT: u32 = OFFSET_BITS + GENERATION_BITS;

/// Maximum number of addressable segment slots, the root segment included
pub(crate) const MAX_SLOTS: usize = (1 << (u64::BITS - SLOT_SHIFT)) - 1;

/// Exclusive upper bound of a segment size in bytes
pub(crate) const MAX_SEGMENT_BYTES: usize = offset_mask() as usize;

const fn offset_mask() -> u64 {
    (1 << OFFSET_BITS) - 1
}

const fn generation_mask() -> u64 {
    (1 << GENERATION_BITS) - 1
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(u64);

impl Address {
    /// The address that never resolves to a segment
    pub const NULL: Address = Address(0);

    pub(crate) fn new(slot: usize, generation: u8, offset: usize) -> Self {
        debug_assert!(slot < MAX_SLOTS);
        debug_assert!((offset as u64) <= offset_mask());

        Self(((slot as u64 + 1) << SLOT_SHIFT) | ((generation as u64) << OFFSET_BITS) | offset as u64)
    }

    /// Rebuilds an address from its raw representation, eg. after it has been
    /// stored inside a shared word.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw representation of this address.
    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.slot().is_none()
    }

    /// Moves this address `bytes` further into its segment.
    ///
    /// Offsets that overflow the offset field saturate at its maximum, which lies
    /// past the end of every segment and is therefore rejected on access.
    pub fn offset(self, bytes: usize) -> Self {
        let offset = (self.byte_offset() as u64)
            .saturating_add(bytes as u64)
            .min(offset_mask());

        Self((self.0 & !offset_mask()) | offset)
    }

    pub(crate) fn slot(self) -> Option<usize> {
        match self.0 >> SLOT_SHIFT {
            0 => None,
            field => Some(field as usize - 1),
        }
    }

    pub(crate) fn generation(self) -> u8 {
        ((self.0 >> OFFSET_BITS) & generation_mask()) as u8
    }

    pub(crate) fn byte_offset(self) -> usize {
        (self.0 & offset_mask()) as usize
    }
}

impl From<Address> for u64 {
    fn from(address: Address) -> Self {
        address.to_raw()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot() {
            Some(slot) => f
                .debug_struct("Address")
                .field("slot", &slot)
                .field("generation", &self.generation())
                .field("offset", &self.byte_offset())
                .finish(),
            None => f.write_str("Address(null)"),
        }
    }
}
