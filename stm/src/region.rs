// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    batcher::Batcher,
    segment::{Segment, SegmentTable},
    transaction::WordRef,
    word::MAX_TX_ID,
    Address, RegionConfig, Result, Transaction, TxError, TxId,
};
use log::*;
use std::{
    mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

/// Everything the members of an epoch hand over to its transition
#[derive(Default)]
pub(crate) struct Journal {
    pub touched: Vec<WordRef>,

    /// segments freed by committed transactions
    pub freed: Vec<Arc<Segment>>,

    /// segments allocated by aborted transactions
    pub dropped: Vec<Arc<Segment>>,
}

/// [`Region`] is a shared memory region that independent threads access through
/// [`Transaction`]s. It consists of a non-freeable root segment and any number of
/// segments allocated from within transactions.
///
/// Dropping the region releases all of its memory. The borrow every [`Transaction`] holds
/// on its region guarantees that no transaction is running at that point.
pub struct Region {
    config: RegionConfig,
    segments: SegmentTable,
    batcher: Batcher,
    journal: Mutex<Journal>,
    next_tx: AtomicU64,
}

impl Region {
    /// Creates a region whose root segment has `size` bytes made of words of `align` bytes.
    /// `size` must be a positive multiple of `align` and `align` a power of two.
    pub fn new(size: usize, align: usize) -> Result<Self> {
        Self::with_config(RegionConfig::new(size, align))
    }

    pub fn with_config(config: RegionConfig) -> Result<Self> {
        config.validate()?;

        let segments = SegmentTable::new(&config)?;
        let batcher = Batcher::new(config.admission);

        info!(
            "create region of {} bytes, aligned to {} bytes, admission {:?}",
            config.size, config.align, config.admission
        );

        Ok(Self {
            config,
            segments,
            batcher,
            journal: Mutex::new(Journal::default()),
            next_tx: AtomicU64::new(1),
        })
    }

    /// Start address of the root segment
    pub fn start(&self) -> Address {
        self.segments.root_start()
    }

    /// Size of the root segment in bytes
    pub fn size(&self) -> usize {
        self.config.size
    }

    /// Size of a word in bytes
    pub fn align(&self) -> usize {
        self.config.align
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    /// Begins a new transaction. Blocks while an epoch transition is in progress.
    pub fn begin(&self, read_only: bool) -> Result<Transaction<'_>> {
        Transaction::begin(self, read_only)
    }

    /// Number of the running epoch
    pub fn epoch(&self) -> u64 {
        self.batcher.epoch()
    }

    /// Blocks until the epoch `epoch` has closed. Returns immediately, if it already has.
    pub fn await_transition(&self, epoch: u64) {
        self.batcher.await_transition(epoch)
    }

    /// Number of dynamically allocated segments that are still reachable
    pub fn segment_count(&self) -> usize {
        self.segments.live_count()
    }

    pub(crate) fn segments(&self) -> &SegmentTable {
        &self.segments
    }

    pub(crate) fn batcher(&self) -> &Batcher {
        &self.batcher
    }

    pub(crate) fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_tx_id(&self) -> Result<TxId> {
        let id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        if id > MAX_TX_ID {
            self.next_tx.store(MAX_TX_ID + 1, Ordering::Relaxed);
            return Err(TxError::IdsExhausted);
        }
        Ok(TxId::from_raw(id))
    }

    /// Leaves the running epoch, closing it if this was its last member
    pub(crate) fn leave(&self) {
        self.batcher.leave(|epoch| self.transition(epoch));
    }

    /// Publishes every pending write of the closing epoch, resets the ownership state of
    /// all words touched in it and runs the deferred segment housekeeping.
    fn transition(&self, epoch: u64) {
        let journal = mem::take(&mut *self.journal());

        let touched = journal.touched.len();
        let published = journal
            .touched
            .iter()
            .filter(|(segment, index)| segment.word(*index).publish())
            .count();

        let sweep = self.segments.sweep(journal.freed, journal.dropped);

        debug!(
            "EPOCH({}): CLOSED. WORDS TOUCHED ({}), PUBLISHED ({}), SEGMENTS RETIRED ({}), RELEASED ({})",
            epoch, touched, published, sweep.retired, sweep.released
        );
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        info!(
            "destroy region after {} epochs, {} segments still allocated",
            self.batcher.epoch(),
            self.segments.live_count()
        );
    }
}
