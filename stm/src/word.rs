// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Dual-Version Words
//!
//! A [`Word`] is the unit of conflict detection. It keeps two physical copies of its
//! value: the committed copy, selected by the `valid` bit, and the speculative copy
//! that the owning transaction writes into. Publishing an epoch flips the `valid` bit
//! of every written word, which makes all speculative copies visible at once.
//!
//! The per epoch ownership of a word lives in a single atomic control word, so every
//! ownership change is one compare-and-swap:
//!
//! ```text
//! | 63      | 62 .. 0                        |
//! | written | owner id, or all ones = shared |
//! ```

use crate::{Result, TxError, TxId};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use zeroize::Zeroize;

/// Marks the word as written by its owner this epoch
const WRITTEN: u64 = 1 << 63;

/// Owner field value for words read by more than one transaction
const SHARED: u64 = WRITTEN - 1;

/// Largest transaction id that can be stored inside the owner field
pub(crate) const MAX_TX_ID: u64 = SHARED - 1;

/// Ownership state of a word within the running epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    /// Untouched this epoch
    Clean,

    /// Read by exactly one read-write transaction
    Owned(TxId),

    /// Read by several read-write transactions. No one may write for the rest of the epoch.
    Shared,

    /// Written by its owner. The speculative copy holds the pending value.
    Written(TxId),
}

impl Access {
    fn pack(self) -> u64 {
        match self {
            Access::Clean => 0,
            Access::Owned(id) => id.get(),
            Access::Shared => SHARED,
            Access::Written(id) => WRITTEN | id.get(),
        }
    }

    fn unpack(raw: u64) -> Self {
        match (raw & WRITTEN != 0, raw & SHARED) {
            (false, 0) => Access::Clean,
            (false, SHARED) => Access::Shared,
            (false, id) => Access::Owned(TxId::from_raw(id)),
            (true, id) => Access::Written(TxId::from_raw(id)),
        }
    }
}

/// Ownership state and copy selector of a word. The copy bytes of all words of a
/// segment live in one buffer owned by the segment.
#[derive(Default)]
pub(crate) struct WordState {
    valid: AtomicBool,
    control: AtomicU64,
}

impl Zeroize for WordState {
    fn zeroize(&mut self) {
        self.valid.get_mut().zeroize();
        self.control.get_mut().zeroize();
    }
}

/// A word of a segment: its state together with both of its copies
#[derive(Clone, Copy)]
pub(crate) struct Word<'a> {
    state: &'a WordState,

    /// both copies back to back, `align` bytes each
    copies: &'a [AtomicU8],
}

impl<'a> Word<'a> {
    pub(crate) fn new(state: &'a WordState, copies: &'a [AtomicU8]) -> Self {
        debug_assert!(!copies.is_empty() && copies.len() % 2 == 0);
        Self { state, copies }
    }

    pub(crate) fn access(&self) -> Access {
        Access::unpack(self.state.control.load(Ordering::Acquire))
    }

    /// Reads the committed copy without touching the ownership state. This is the
    /// read path of read-only transactions.
    pub(crate) fn read_committed(&self, target: &mut [u8]) {
        load(self.committed(), target);
    }

    /// Reads the word on behalf of a read-write transaction. The first read of the epoch
    /// claims the word, a read of a word written by another transaction must abort.
    ///
    /// Returns `true`, if this call changed the ownership state, so the caller has to
    /// record the word for the epoch transition.
    pub(crate) fn read(&self, tx: TxId, target: &mut [u8]) -> Result<bool> {
        let mut current = self.state.control.load(Ordering::Acquire);

        loop {
            let next = match Access::unpack(current) {
                Access::Written(owner) if owner == tx => {
                    load(self.speculative(), target);
                    return Ok(false);
                }
                Access::Written(_) => return Err(TxError::Conflict),
                Access::Owned(owner) if owner == tx => {
                    load(self.committed(), target);
                    return Ok(false);
                }
                Access::Shared => {
                    load(self.committed(), target);
                    return Ok(false);
                }
                Access::Owned(_) => Access::Shared,
                Access::Clean => Access::Owned(tx),
            };

            match self
                .state
                .control
                .compare_exchange(current, next.pack(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    load(self.committed(), target);
                    return Ok(true);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Writes the speculative copy. The first writer of an untouched word, or the sole
    /// reader of it, becomes the exclusive owner for the rest of the epoch.
    ///
    /// Returns `true`, if this call changed the ownership state.
    pub(crate) fn write(&self, tx: TxId, source: &[u8]) -> Result<bool> {
        let mut current = self.state.control.load(Ordering::Acquire);

        loop {
            match Access::unpack(current) {
                Access::Written(owner) if owner == tx => {
                    store(self.speculative(), source);
                    return Ok(false);
                }
                Access::Clean => {}
                Access::Owned(owner) if owner == tx => {}
                _ => return Err(TxError::Conflict),
            }

            match self.state.control.compare_exchange(
                current,
                Access::Written(tx).pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    store(self.speculative(), source);
                    return Ok(true);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops any claim `tx` holds on this word. Words shared with other readers stay shared.
    pub(crate) fn release(&self, tx: TxId) {
        for held in [Access::Owned(tx), Access::Written(tx)] {
            if self
                .state
                .control
                .compare_exchange(held.pack(), 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Promotes a pending write to the committed copy and resets the ownership state.
    /// Must only be called while no transaction is active.
    ///
    /// Returns `true`, if the word had been written.
    pub(crate) fn publish(&self) -> bool {
        let written = matches!(
            Access::unpack(self.state.control.swap(0, Ordering::AcqRel)),
            Access::Written(_)
        );
        if written {
            self.state.valid.fetch_xor(true, Ordering::AcqRel);
        }
        written
    }

    fn align(&self) -> usize {
        self.copies.len() / 2
    }

    fn copy(&self, second: bool) -> &[AtomicU8] {
        let align = self.align();
        match second {
            false => &self.copies[..align],
            true => &self.copies[align..],
        }
    }

    fn committed(&self) -> &[AtomicU8] {
        self.copy(self.state.valid.load(Ordering::Acquire))
    }

    fn speculative(&self) -> &[AtomicU8] {
        self.copy(!self.state.valid.load(Ordering::Acquire))
    }
}

fn load(source: &[AtomicU8], target: &mut [u8]) {
    for (byte, cell) in target.iter_mut().zip(source) {
        *byte = cell.load(Ordering::Relaxed);
    }
}

fn store(target: &[AtomicU8], source: &[u8]) {
    for (cell, byte) in target.iter().zip(source) {
        cell.store(*byte, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Owns the storage of a single word
    struct Cell {
        state: WordState,
        copies: Box<[AtomicU8]>,
    }

    impl Cell {
        fn new(align: usize) -> Self {
            Self {
                state: WordState::default(),
                copies: (0..2 * align).map(|_| AtomicU8::new(0)).collect(),
            }
        }

        fn word(&self) -> Word<'_> {
            Word::new(&self.state, &self.copies)
        }
    }

    fn tx(id: u64) -> TxId {
        TxId::from_raw(id)
    }

    fn read(word: &Word<'_>, id: u64) -> Result<u64> {
        let mut buffer = [0u8; 8];
        word.read(tx(id), &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    fn committed(word: &Word<'_>) -> u64 {
        let mut buffer = [0u8; 8];
        word.read_committed(&mut buffer);
        u64::from_le_bytes(buffer)
    }

    #[test]
    fn test_access_encoding() {
        for access in [
            Access::Clean,
            Access::Shared,
            Access::Owned(tx(1)),
            Access::Owned(tx(MAX_TX_ID)),
            Access::Written(tx(1)),
            Access::Written(tx(MAX_TX_ID)),
        ] {
            assert_eq!(Access::unpack(access.pack()), access);
        }
    }

    #[test]
    fn test_write_is_speculative_until_published() -> Result<()> {
        let cell = Cell::new(8);
        let word = cell.word();

        assert!(word.write(tx(1), &42u64.to_le_bytes())?);
        assert_eq!(committed(&word), 0);
        assert_eq!(read(&word, 1)?, 42);
        assert_eq!(word.access(), Access::Written(tx(1)));

        assert!(word.publish());
        assert_eq!(word.access(), Access::Clean);
        assert_eq!(committed(&word), 42);

        Ok(())
    }

    #[test]
    fn test_single_writer_per_epoch() -> Result<()> {
        let cell = Cell::new(8);
        let word = cell.word();

        word.write(tx(1), &1u64.to_le_bytes())?;
        assert!(!word.write(tx(1), &2u64.to_le_bytes())?);

        assert_eq!(word.write(tx(2), &3u64.to_le_bytes()), Err(TxError::Conflict));
        assert_eq!(read(&word, 2), Err(TxError::Conflict));

        word.publish();
        assert_eq!(committed(&word), 2);

        Ok(())
    }

    #[test]
    fn test_readers_block_writers() -> Result<()> {
        let cell = Cell::new(8);
        let word = cell.word();

        assert_eq!(read(&word, 1)?, 0);
        assert_eq!(word.access(), Access::Owned(tx(1)));
        assert_eq!(word.write(tx(2), &5u64.to_le_bytes()), Err(TxError::Conflict));

        // a sole reader may upgrade to a writer
        assert!(!word.write(tx(1), &5u64.to_le_bytes())?);

        let cell = Cell::new(8);
        let other = cell.word();
        read(&other, 1)?;
        read(&other, 2)?;
        assert_eq!(other.access(), Access::Shared);
        assert_eq!(other.write(tx(1), &5u64.to_le_bytes()), Err(TxError::Conflict));

        Ok(())
    }

    #[test]
    fn test_release_rolls_back_claims() -> Result<()> {
        let cell = Cell::new(8);
        let word = cell.word();

        word.write(tx(1), &9u64.to_le_bytes())?;
        word.release(tx(1));
        assert_eq!(word.access(), Access::Clean);

        // another transaction can take over the word in the same epoch
        word.write(tx(2), &7u64.to_le_bytes())?;
        word.release(tx(1));
        assert_eq!(word.access(), Access::Written(tx(2)));

        assert!(word.publish());
        assert_eq!(committed(&word), 7);

        // a released write never becomes visible
        word.write(tx(3), &1u64.to_le_bytes())?;
        word.release(tx(3));
        assert!(!word.publish());
        assert_eq!(committed(&word), 7);

        Ok(())
    }

    #[test]
    fn test_zeroize_state() -> Result<()> {
        let mut cell = Cell::new(4);
        cell.word().write(tx(1), &[1, 2, 3, 4])?;
        cell.word().publish();
        cell.word().write(tx(2), &[5, 6, 7, 8])?;

        cell.state.zeroize();
        for byte in cell.copies.iter_mut() {
            byte.get_mut().zeroize();
        }

        assert_eq!(cell.word().access(), Access::Clean);
        let mut buffer = [0xffu8; 4];
        cell.word().read_committed(&mut buffer);
        assert_eq!(buffer, [0; 4]);

        Ok(())
    }
}
