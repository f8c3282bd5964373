// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Segment Allocator
//!
//! Segments live in a slot arena. Each slot carries a generation that is bumped
//! whenever its segment is released, so addresses handed out for an earlier occupant
//! of the slot stop resolving. Slot `0` holds the root segment, which can never be
//! freed.
//!
//! Freeing is deferred: a committed free only marks the segment, the epoch transition
//! retires it (no new access resolves) and the transition after that releases the slot
//! and its storage.

use crate::{
    address::{MAX_SEGMENT_BYTES, MAX_SLOTS},
    word::{Word, WordState},
    Address, RegionConfig, Result, TxError, TxId,
};
use log::*;
use std::{
    mem,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};
use zeroize::Zeroize;

/// Slot index of the root segment
const ROOT: usize = 0;

pub(crate) struct Segment {
    slot: usize,
    generation: u8,
    align: usize,
    states: Box<[WordState]>,

    /// both copies of every word, `2 * align` bytes per word
    copies: Box<[AtomicU8]>,

    /// id of the transaction that freed this segment in the running epoch, 0 if none
    freed_by: AtomicU64,
}

impl Segment {
    fn allocate(slot: usize, generation: u8, size: usize, align: usize) -> Result<Self> {
        let count = size / align;
        let bytes = size.checked_mul(2).ok_or(TxError::OutOfMemory)?;

        let mut states = Vec::new();
        states.try_reserve_exact(count).map_err(|_| TxError::OutOfMemory)?;
        states.resize_with(count, WordState::default);

        let mut copies = Vec::new();
        copies.try_reserve_exact(bytes).map_err(|_| TxError::OutOfMemory)?;
        copies.resize_with(bytes, || AtomicU8::new(0));

        Ok(Self {
            slot,
            generation,
            align,
            states: states.into_boxed_slice(),
            copies: copies.into_boxed_slice(),
            freed_by: AtomicU64::new(0),
        })
    }

    pub(crate) fn start(&self) -> Address {
        Address::new(self.slot, self.generation, 0)
    }

    /// Size in bytes
    pub(crate) fn size(&self) -> usize {
        self.states.len() * self.align
    }

    pub(crate) fn word(&self, index: usize) -> Word<'_> {
        let width = 2 * self.align;
        Word::new(&self.states[index], &self.copies[index * width..(index + 1) * width])
    }

    /// Marks this segment as freed by `tx`. Only one transaction per epoch may free a segment.
    pub(crate) fn mark_freed(&self, tx: TxId) -> Result<()> {
        match self
            .freed_by
            .compare_exchange(0, tx.get(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(owner) if owner == tx.get() => Err(TxError::InvalidFree(self.start())),
            Err(_) => Err(TxError::Conflict),
        }
    }

    /// Withdraws the free mark of an aborted transaction.
    pub(crate) fn unmark_freed(&self, tx: TxId) {
        let _ = self
            .freed_by
            .compare_exchange(tx.get(), 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        for state in self.states.iter_mut() {
            state.zeroize();
        }
        for byte in self.copies.iter_mut() {
            byte.get_mut().zeroize();
        }
    }
}

enum Slot {
    Vacant { generation: u8 },

    /// Released after its last generation. Never reused, so stale addresses stay dead.
    Exhausted,

    Live(Arc<Segment>),

    /// Freed by a committed transaction one transition ago. Unreachable, not yet released.
    Retired(Arc<Segment>),
}

#[derive(Default)]
struct Slots {
    entries: Vec<Slot>,
    vacant: Vec<usize>,
    retired: Vec<usize>,

    /// bytes held by dynamically allocated segments, retired ones included
    allocated: usize,
}

impl Slots {
    /// Generation the next occupant of `slot` is created with
    fn generation(&self, slot: usize) -> u8 {
        match &self.entries[slot] {
            Slot::Vacant { generation } => *generation,
            _ => 0,
        }
    }

    fn vacate(&mut self, slot: usize) {
        let next = match &self.entries[slot] {
            Slot::Live(segment) | Slot::Retired(segment) => {
                self.allocated -= segment.size();
                segment.generation.checked_add(1)
            }
            Slot::Vacant { .. } | Slot::Exhausted => return,
        };

        match next {
            Some(generation) => {
                self.entries[slot] = Slot::Vacant { generation };
                self.vacant.push(slot);
            }
            None => {
                debug!("segment slot ({}) exhausted its generations", slot);
                self.entries[slot] = Slot::Exhausted;
            }
        }
    }
}

/// Result of the segment housekeeping at an epoch transition
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sweep {
    pub retired: usize,
    pub released: usize,
}

pub(crate) struct SegmentTable {
    align: usize,
    memory_limit: Option<usize>,
    max_segments: usize,
    slots: RwLock<Slots>,
}

impl SegmentTable {
    /// Creates the table together with its root segment.
    pub(crate) fn new(config: &RegionConfig) -> Result<Self> {
        let root = Segment::allocate(ROOT, 0, config.size, config.align)?;

        let slots = Slots {
            entries: vec![Slot::Live(Arc::new(root))],
            ..Default::default()
        };

        Ok(Self {
            align: config.align,
            memory_limit: config.memory_limit,
            max_segments: config.max_segments.min(MAX_SLOTS - 1),
            slots: RwLock::new(slots),
        })
    }

    pub(crate) fn root_start(&self) -> Address {
        Address::new(ROOT, 0, 0)
    }

    /// Resolves `length` bytes starting at `address` to a live segment and the index of
    /// the first word.
    pub(crate) fn resolve(&self, address: Address, length: usize) -> Result<(Arc<Segment>, usize)> {
        let offset = address.byte_offset();
        if length == 0 || length % self.align != 0 || offset % self.align != 0 {
            return Err(TxError::Misaligned { address, size: length });
        }

        let segment = self.live(address)?;
        match offset.checked_add(length) {
            Some(end) if end <= segment.size() => Ok((segment, offset / self.align)),
            _ => Err(TxError::OutOfBounds(address)),
        }
    }

    /// Resolves the start address of a freeable segment.
    pub(crate) fn resolve_start(&self, address: Address) -> Result<Arc<Segment>> {
        if address.byte_offset() != 0 || address.slot() == Some(ROOT) {
            return Err(TxError::InvalidFree(address));
        }
        self.live(address)
    }

    /// Allocates and registers a zeroed segment of `size` bytes.
    pub(crate) fn allocate(&self, size: usize) -> Result<Arc<Segment>> {
        if size == 0 || size % self.align != 0 {
            return Err(TxError::Misaligned {
                address: Address::NULL,
                size,
            });
        }
        if size >= MAX_SEGMENT_BYTES {
            return Err(TxError::OutOfMemory);
        }

        let mut slots = self.slots_mut();

        let allocated = slots.allocated.checked_add(size).ok_or(TxError::OutOfMemory)?;
        if matches!(self.memory_limit, Some(limit) if allocated > limit) {
            debug!("allocation of {} bytes exceeds the memory limit", size);
            return Err(TxError::OutOfMemory);
        }

        let reused = slots.vacant.pop();
        let (slot, generation) = match reused {
            Some(slot) => (slot, slots.generation(slot)),
            None if slots.entries.len() <= self.max_segments => (slots.entries.len(), 0),
            None => {
                debug!("segment table is full ({} segments)", self.max_segments);
                return Err(TxError::OutOfMemory);
            }
        };

        let segment = match Segment::allocate(slot, generation, size, self.align) {
            Ok(segment) => Arc::new(segment),
            Err(error) => {
                if slot < slots.entries.len() {
                    slots.vacant.push(slot);
                }
                return Err(error);
            }
        };

        if slot == slots.entries.len() {
            slots.entries.push(Slot::Live(segment.clone()));
        } else {
            slots.entries[slot] = Slot::Live(segment.clone());
        }
        slots.allocated = allocated;

        Ok(segment)
    }

    /// Epoch transition housekeeping. Releases the segments retired by the previous
    /// transition, releases the allocations of aborted transactions right away, and
    /// retires the segments freed by committed transactions.
    pub(crate) fn sweep(&self, freed: Vec<Arc<Segment>>, dropped: Vec<Arc<Segment>>) -> Sweep {
        let mut slots = self.slots_mut();
        let mut sweep = Sweep::default();

        for slot in mem::take(&mut slots.retired) {
            slots.vacate(slot);
            sweep.released += 1;
        }

        for segment in dropped {
            if Self::occupies(&slots, &segment) {
                slots.vacate(segment.slot);
                sweep.released += 1;
            }
        }

        for segment in freed {
            if Self::occupies(&slots, &segment) {
                slots.entries[segment.slot] = Slot::Retired(segment.clone());
                slots.retired.push(segment.slot);
                sweep.retired += 1;
            }
        }

        sweep
    }

    /// Number of live dynamically allocated segments
    pub(crate) fn live_count(&self) -> usize {
        self.slots()
            .entries
            .iter()
            .skip(1)
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    fn live(&self, address: Address) -> Result<Arc<Segment>> {
        let slots = self.slots();
        match address.slot().and_then(|slot| slots.entries.get(slot)) {
            Some(Slot::Live(segment)) if segment.generation == address.generation() => Ok(segment.clone()),
            _ => Err(TxError::UnknownSegment(address)),
        }
    }

    fn occupies(slots: &Slots, segment: &Arc<Segment>) -> bool {
        matches!(&slots.entries[segment.slot], Slot::Live(live) if Arc::ptr_eq(live, segment))
    }

    fn slots(&self) -> RwLockReadGuard<'_, Slots> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn slots_mut(&self) -> RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}
