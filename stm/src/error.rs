// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::Address;
use thiserror::Error as DeriveError;

/// Global return type
pub type Result<T> = core::result::Result<T, TxError>;

#[derive(Debug, DeriveError, PartialEq, Eq, Clone)]
pub enum TxError {
    #[error("conflicting access by another transaction")]
    Conflict,

    #[error("mutating operation in a read-only transaction")]
    ReadOnly,

    #[error("invalid region layout: size {size} is not a positive multiple of alignment {align}")]
    InvalidLayout { size: usize, align: usize },

    #[error("misaligned access at {address} with length {size}")]
    Misaligned { address: Address, size: usize },

    #[error("no live segment at {0}")]
    UnknownSegment(Address),

    #[error("access at {0} runs past the end of its segment")]
    OutOfBounds(Address),

    #[error("cannot free {0}")]
    InvalidFree(Address),

    #[error("transaction has already been aborted")]
    Aborted,

    #[error("transaction has already ended")]
    Finished,

    #[error("out of memory")]
    OutOfMemory,

    #[error("transaction ids exhausted")]
    IdsExhausted,

    #[error("busy breaker reached its maximum wait units")]
    BreakerTripped,
}

impl TxError {
    /// Returns `true`, if the error leaves the issuing transaction aborted.
    ///
    /// Only a refused allocation keeps the transaction alive; the caller may
    /// retry the allocation or carry on without it.
    pub fn aborts(&self) -> bool {
        !matches!(self, TxError::OutOfMemory)
    }
}
