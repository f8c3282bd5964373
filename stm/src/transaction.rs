// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{segment::Segment, Address, Region, Result, TxError};
use log::*;
use std::{fmt, sync::Arc};

/// Transaction identifier, unique within its [`Region`]. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(u64);

impl TxId {
    pub(crate) fn from_raw(id: u64) -> Self {
        debug_assert!(id != 0, "transaction ids start at one");
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

/// Lifecycle of a [`Transaction`]. A transaction only exists once the batcher admitted it
/// into an epoch, so it starts out `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,

    /// Ended without conflict, leaving the epoch
    Committing,

    /// Part of the epoch that publishes its writes
    Committed,

    /// Discarded. Its writes are never published.
    Aborted,
}

/// A word of a segment claimed during the epoch
pub(crate) type WordRef = (Arc<Segment>, usize);

/// A transaction on a shared memory [`Region`].
///
/// Every operation returns whether the transaction can continue. The first error that
/// aborts the transaction rolls back its claims, all further operations fail with
/// [`TxError::Aborted`]. [`Transaction::end`] must be called to leave the epoch; a
/// transaction dropped before that is aborted and leaves on its own.
pub struct Transaction<'a> {
    region: &'a Region,
    id: TxId,
    read_only: bool,
    epoch: u64,
    state: TxState,

    /// set once the transaction has left its epoch
    finished: bool,

    /// words whose ownership state this transaction changed
    touched: Vec<WordRef>,

    allocated: Vec<Arc<Segment>>,
    freed: Vec<Arc<Segment>>,
}

impl<'a> Transaction<'a> {
    /// Creates a transaction and joins an epoch. This may block while an epoch transition
    /// is in progress.
    pub(crate) fn begin(region: &'a Region, read_only: bool) -> Result<Self> {
        let id = region.next_tx_id()?;
        let epoch = region.batcher().enter();

        trace!("TX({}): BEGIN IN EPOCH ({}), READ ONLY ({})", id, epoch, read_only);

        Ok(Self {
            region,
            id,
            read_only,
            epoch,
            state: TxState::Active,
            finished: false,
            touched: Vec::new(),
            allocated: Vec::new(),
            freed: Vec::new(),
        })
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The epoch this transaction is a member of
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Reads `target.len()` bytes from the shared `source` into the private `target`. The
    /// length must be a positive multiple of the region's alignment.
    pub fn read(&mut self, source: Address, target: &mut [u8]) -> Result<()> {
        self.ensure_active()?;
        let result = self.read_words(source, target);
        self.check(result)
    }

    /// Writes the private `source` to the shared `target`. The length must be a positive
    /// multiple of the region's alignment.
    pub fn write(&mut self, source: &[u8], target: Address) -> Result<()> {
        self.ensure_active()?;
        let result = self.write_words(source, target);
        self.check(result)
    }

    /// Allocates a zeroed segment of `size` bytes and returns its start address.
    ///
    /// [`TxError::OutOfMemory`] leaves the transaction active. The segment is released
    /// again, if the transaction does not commit.
    pub fn alloc(&mut self, size: usize) -> Result<Address> {
        self.ensure_active()?;
        let result = self.allocate(size);
        self.check(result)
    }

    /// Frees the segment starting at `target`. The segment stays accessible to the members
    /// of the running epoch and is released one epoch after this transaction committed.
    pub fn free(&mut self, target: Address) -> Result<()> {
        self.ensure_active()?;
        let result = self.mark_free(target);
        self.check(result)
    }

    /// Aborts the transaction and rolls back its claims. It still has to [`Transaction::end`].
    pub fn abort(&mut self) {
        if self.state != TxState::Active {
            return;
        }
        self.state = TxState::Aborted;

        for (segment, index) in self.touched.iter() {
            segment.word(*index).release(self.id);
        }
        for segment in self.freed.drain(..) {
            segment.unmark_freed(self.id);
        }

        trace!("TX({}): ABORT IN EPOCH ({})", self.id, self.epoch);
    }

    /// Ends the transaction and leaves its epoch. Returns `true`, if the transaction
    /// committed. Calling this again returns the same outcome without touching the epoch.
    pub fn end(&mut self) -> bool {
        if self.finished {
            return self.state == TxState::Committed;
        }
        self.finished = true;

        if self.state == TxState::Active {
            self.state = TxState::Committing;
        }
        let committing = self.state == TxState::Committing;

        {
            let mut journal = self.region.journal();
            journal.touched.append(&mut self.touched);
            if committing {
                journal.freed.append(&mut self.freed);
            } else {
                journal.dropped.append(&mut self.allocated);
            }
        }

        self.region.leave();

        if committing {
            self.state = TxState::Committed;
        }

        trace!(
            "TX({}): END IN EPOCH ({}), COMMITTED ({})",
            self.id,
            self.epoch,
            committing
        );

        committing
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxState::Active => Ok(()),
            TxState::Aborted => Err(TxError::Aborted),
            TxState::Committing | TxState::Committed => Err(TxError::Finished),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.read_only {
            true => Err(TxError::ReadOnly),
            false => Ok(()),
        }
    }

    /// Aborts on every error but a refused allocation
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(error) = &result {
            if error.aborts() {
                trace!("TX({}): {}", self.id, error);
                self.abort();
            }
        }
        result
    }

    fn read_words(&mut self, source: Address, target: &mut [u8]) -> Result<()> {
        let (segment, first) = self.region.segments().resolve(source, target.len())?;

        for (offset, chunk) in target.chunks_mut(self.region.align()).enumerate() {
            let index = first + offset;
            let word = segment.word(index);

            if self.read_only {
                word.read_committed(chunk);
            } else if word.read(self.id, chunk)? {
                self.touched.push((segment.clone(), index));
            }
        }

        Ok(())
    }

    fn write_words(&mut self, source: &[u8], target: Address) -> Result<()> {
        self.ensure_writable()?;
        let (segment, first) = self.region.segments().resolve(target, source.len())?;

        for (offset, chunk) in source.chunks(self.region.align()).enumerate() {
            let index = first + offset;

            if segment.word(index).write(self.id, chunk)? {
                self.touched.push((segment.clone(), index));
            }
        }

        Ok(())
    }

    fn allocate(&mut self, size: usize) -> Result<Address> {
        self.ensure_writable()?;
        let segment = self.region.segments().allocate(size)?;
        let start = segment.start();
        self.allocated.push(segment);

        Ok(start)
    }

    fn mark_free(&mut self, target: Address) -> Result<()> {
        self.ensure_writable()?;
        let segment = self.region.segments().resolve_start(target)?;
        segment.mark_freed(self.id)?;
        self.freed.push(segment);

        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort();
            self.end();
        }
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("read_only", &self.read_only)
            .field("epoch", &self.epoch)
            .field("state", &self.state)
            .field("touched", &self.touched.len())
            .finish()
    }
}
