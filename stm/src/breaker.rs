// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{Result, TxError};
use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_WAIT_UNITS: usize = 7;

/// # BusyBreaker
/// [`BusyBreaker`] is kind of a circuit-breaker and busy keeper for short delays between
/// transaction retries. Every spin doubles the wait, until the breaker trips.
#[derive(Debug)]
pub struct BusyBreaker {
    unit: AtomicUsize,
    max_units: usize,
}

impl Default for BusyBreaker {
    fn default() -> Self {
        Self::with_max_units(MAX_WAIT_UNITS)
    }
}

impl BusyBreaker {
    /// Creates a breaker that trips after `max_units + 1` spins.
    pub fn with_max_units(max_units: usize) -> Self {
        Self {
            unit: AtomicUsize::new(0),
            max_units,
        }
    }

    /// Keeps the CPU busy but hints to the CPU reschedule the CPU time
    ///
    /// [`core::hint::spin_loop()`] may be available on the integrating system,
    /// otherwise this function call is just a busy loop, that wastes some CPU cycles
    pub fn spin(&self) -> Result<()> {
        match self.unit.load(Ordering::Acquire) {
            unit if unit <= self.max_units => {
                for _ in 0..(1usize << unit.min(usize::BITS as usize - 1)) {
                    core::hint::spin_loop();
                }
                self.unit.store(unit + 1, Ordering::Release);

                Ok(())
            }
            _ => Err(TxError::BreakerTripped),
        }
    }

    /// Resets the breaker to zero
    pub fn reset(&self) {
        self.unit.store(0, Ordering::Release);
    }
}
