// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{BusyBreaker, Region, Result, Transaction, TxError};
use log::*;

/// Caller side policy for conflicting transactions run through [`Region::execute`].
/// The engine itself never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Return [`TxError::Conflict`] on the first conflict
    Abort,

    /// Retry until the transaction commits. A conflicting owner keeps its words until the
    /// epoch closes, so every retry waits for the epoch of the failed attempt to close first.
    #[default]
    Retry,

    /// Like [`Strategy::Retry`], but spin on a [`BusyBreaker`] before each retry and give up
    /// with [`TxError::BreakerTripped`] once the breaker trips.
    RetryWithBreaker,
}

impl Region {
    /// Runs `program` inside a transaction until it commits, following `strategy` on
    /// conflicts. Errors other than conflicts are returned right away, after the
    /// transaction has been aborted.
    ///
    /// ```
    /// use epoch_stm::{Region, Strategy, TxError};
    ///
    /// let region = Region::new(16, 8)?;
    /// let (from, to) = (region.start(), region.start().offset(8));
    ///
    /// region.execute(false, Strategy::Retry, |tx| {
    ///     let mut balance = [0u8; 8];
    ///     tx.read(from, &mut balance)?;
    ///     tx.write(&(u64::from_le_bytes(balance) + 10).to_le_bytes(), to)
    /// })?;
    /// # Ok::<(), TxError>(())
    /// ```
    pub fn execute<F, U>(&self, read_only: bool, strategy: Strategy, program: F) -> Result<U>
    where
        F: Fn(&mut Transaction<'_>) -> Result<U>,
    {
        let breaker = BusyBreaker::default();

        loop {
            let mut tx = self.begin(read_only)?;
            let epoch = tx.epoch();

            let error = match program(&mut tx) {
                Ok(value) => {
                    if tx.end() {
                        return Ok(value);
                    }
                    // the program swallowed the error that aborted the transaction
                    TxError::Conflict
                }
                Err(error) => {
                    tx.abort();
                    tx.end();
                    error
                }
            };
            drop(tx);

            match (error, strategy) {
                (TxError::Conflict, Strategy::Retry) => {}
                (TxError::Conflict, Strategy::RetryWithBreaker) => breaker.spin()?,
                (error, _) => return Err(error),
            }

            debug!("retry conflicting transaction of epoch ({})", epoch);
            self.await_transition(epoch);
        }
    }
}
